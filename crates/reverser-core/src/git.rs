//! Git Repository Facade: clone/fetch/checkout/write/commit/push primitives
//! over an on-disk working copy.
//!
//! Shells out to the `git` CLI via `tokio::process::Command` rather than
//! linking `git2`/libgit2, avoiding an OpenSSL dependency and keeping
//! credential handling (token/SSH) at the process boundary instead of an
//! FFI surface. One `GitFacade` per repository; a per-repo async mutex
//! serializes checkout→commit→push so only one branch is ever checked out
//! at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use reverser_types::{CommitBatch, GitCredentials, Operation};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::GitError;
use crate::sanitize::{canonical_yaml, object_path};

/// Credential material staged on disk for one facade's lifetime: an
/// askpass helper script for token auth, or a private key + known_hosts
/// file for SSH. Never embedded in the remote URL, so it cannot leak into
/// `git log`/process listings. Removed on drop.
enum CredentialStaging {
    Token { askpass_path: PathBuf },
    Ssh { key_path: PathBuf, known_hosts_path: PathBuf },
    None,
}

impl Drop for CredentialStaging {
    fn drop(&mut self) {
        match self {
            CredentialStaging::Token { askpass_path } => {
                let _ = std::fs::remove_file(askpass_path);
            }
            CredentialStaging::Ssh { key_path, known_hosts_path } => {
                let _ = std::fs::remove_file(key_path);
                let _ = std::fs::remove_file(known_hosts_path);
            }
            CredentialStaging::None => {}
        }
    }
}

pub struct GitFacade {
    repo_url: String,
    working_dir: PathBuf,
    author_name: String,
    author_email: String,
    operation_timeout: Duration,
    push_cycle_timeout: Duration,
    lock: Mutex<()>,
    credential_staging: CredentialStaging,
}

impl GitFacade {
    pub fn new(
        repo_url: String,
        credentials: GitCredentials,
        working_dir: PathBuf,
        author_name: String,
        author_email: String,
        operation_timeout: Duration,
        push_cycle_timeout: Duration,
    ) -> Result<Self, GitError> {
        let credential_staging = stage_credentials(&working_dir, &credentials)?;
        Ok(Self {
            repo_url,
            working_dir,
            author_name,
            author_email,
            operation_timeout,
            push_cycle_timeout,
            lock: Mutex::new(()),
            credential_staging,
        })
    }

    /// Clone into `working_dir` if it does not already hold a checkout of
    /// this repository.
    pub async fn ensure_clone(&self) -> Result<(), GitError> {
        let _guard = self.lock.lock().await;
        self.ensure_clone_locked().await
    }

    /// Same as [`Self::ensure_clone`], assuming `self.lock` is already held
    /// by the caller. `tokio::sync::Mutex` is not reentrant.
    async fn ensure_clone_locked(&self) -> Result<(), GitError> {
        if self.working_dir.join(".git").exists() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.working_dir).await?;
        self.run(&self.working_dir, &["clone", &self.repo_url, "."]).await?;
        self.configure_identity().await?;
        Ok(())
    }

    async fn configure_identity(&self) -> Result<(), GitError> {
        self.run(&self.working_dir, &["config", "user.name", &self.author_name]).await?;
        self.run(&self.working_dir, &["config", "user.email", &self.author_email]).await?;
        Ok(())
    }

    /// Checkout `branch`, creating it from the remote default if absent.
    pub async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.fetch().await?;
        let local_exists = self
            .run(&self.working_dir, &["rev-parse", "--verify", branch])
            .await
            .is_ok();

        if local_exists {
            self.run(&self.working_dir, &["checkout", branch]).await?;
            self.run(&self.working_dir, &["reset", "--hard", &format!("origin/{branch}")])
                .await
                .or_else(|_| Ok::<_, GitError>(()))?;
        } else {
            let remote_exists = self
                .run(&self.working_dir, &["rev-parse", "--verify", &format!("origin/{branch}")])
                .await
                .is_ok();
            if remote_exists {
                self.run(&self.working_dir, &["checkout", "-b", branch, &format!("origin/{branch}")])
                    .await?;
            } else {
                self.run(&self.working_dir, &["checkout", "-b", branch]).await?;
            }
        }
        Ok(())
    }

    pub async fn fetch(&self) -> Result<(), GitError> {
        self.run(&self.working_dir, &["fetch", "origin"]).await.map(|_| ())
    }

    pub async fn rebase(&self, onto_branch: &str) -> Result<(), GitError> {
        self.run(&self.working_dir, &["rebase", &format!("origin/{onto_branch}")])
            .await
            .map(|_| ())
    }

    async fn write_file(&self, relative_path: &str, contents: &str) -> Result<(), GitError> {
        let full_path = self.working_dir.join(relative_path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full_path, contents).await?;
        Ok(())
    }

    async fn delete_file(&self, relative_path: &str) -> Result<(), GitError> {
        let full_path = self.working_dir.join(relative_path);
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GitError::Io(err)),
        }
    }

    /// List paths of tracked files under `path_prefix`, used by the
    /// Reconciler Manager's orphan detection snapshot.
    pub async fn list_under(&self, path_prefix: &str) -> Result<Vec<String>, GitError> {
        let output = self
            .run(&self.working_dir, &["ls-files", path_prefix])
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn commit(&self, message: &str) -> Result<(), GitError> {
        self.run(&self.working_dir, &["add", "-A"]).await?;
        self.run(&self.working_dir, &["commit", "-m", message]).await.map(|_| ())
    }

    pub async fn push(&self, branch: &str) -> Result<(), GitError> {
        self.run(&self.working_dir, &["push", "origin", branch]).await.map(|_| ())
    }

    /// Apply one collapsed batch atomically: checkout, write/delete each
    /// item under its `baseFolder`, stage, commit, push, with one
    /// fetch+rebase+retry on non-fast-forward.
    pub async fn apply_and_push(&self, branch: &str, batch: &CommitBatch) -> Result<(), GitError> {
        let _guard = self.lock.lock().await;
        self.ensure_clone_locked().await?;

        let push_cycle = async {
            self.checkout(branch).await?;
            self.apply_batch_to_working_tree(batch).await?;
            self.commit(&commit_message(batch)).await?;

            match self.push(branch).await {
                Ok(()) => Ok(()),
                Err(GitError::NonFastForward { .. }) | Err(GitError::CommandFailed(_)) => {
                    self.fetch().await?;
                    self.rebase(branch).await?;
                    self.push(branch).await
                }
                Err(err) => Err(err),
            }
        };

        tokio::time::timeout(self.push_cycle_timeout, push_cycle)
            .await
            .map_err(|_| GitError::Timeout(self.push_cycle_timeout))?
    }

    async fn apply_batch_to_working_tree(&self, batch: &CommitBatch) -> Result<(), GitError> {
        for item in &batch.items {
            let path = object_path(&item.base_folder, &item.identifier);
            match item.operation {
                Operation::Delete => self.delete_file(&path).await?,
                Operation::Create | Operation::Update => {
                    let yaml = canonical_yaml(&item.object).map_err(|err| GitError::CommandFailed(err.to_string()))?;
                    self.write_file(&path, &yaml).await?;
                }
            }
        }
        Ok(())
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let mut command = Command::new("git");
        command.args(args).current_dir(cwd);

        match &self.credential_staging {
            CredentialStaging::Token { askpass_path } => {
                command.env("GIT_ASKPASS", askpass_path);
                command.env("GIT_TERMINAL_PROMPT", "0");
            }
            CredentialStaging::Ssh { key_path, known_hosts_path } => {
                command.env(
                    "GIT_SSH_COMMAND",
                    format!(
                        "ssh -i {} -o UserKnownHostsFile={} -o IdentitiesOnly=yes",
                        key_path.display(),
                        known_hosts_path.display()
                    ),
                );
            }
            CredentialStaging::None => {}
        }

        let output = tokio::time::timeout(self.operation_timeout, command.output())
            .await
            .map_err(|_| GitError::Timeout(self.operation_timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(classify_failure(&self.repo_url, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Stage credential material next to (not inside) `working_dir`: `git clone
/// <url> .` requires its target to be empty, so the staging directory lives
/// in a `-creds` sibling instead.
fn stage_credentials(working_dir: &Path, credentials: &GitCredentials) -> Result<CredentialStaging, GitError> {
    let creds_dir = sibling_creds_dir(working_dir);
    std::fs::create_dir_all(&creds_dir)?;

    match credentials {
        GitCredentials::TokenAuth { username, token } => {
            let askpass_path = creds_dir.join("askpass.sh");
            let script = format!(
                "#!/bin/sh\ncase \"$1\" in\nUsername*) echo {};;\nPassword*) echo {};;\nesac\n",
                shell_quote(username),
                shell_quote(token),
            );
            std::fs::write(&askpass_path, script)?;
            set_executable(&askpass_path)?;
            Ok(CredentialStaging::Token { askpass_path })
        }
        GitCredentials::SshAuth { private_key_pem, known_hosts } => {
            let key_path = creds_dir.join("id_key");
            let known_hosts_path = creds_dir.join("known_hosts");
            std::fs::write(&key_path, private_key_pem)?;
            set_private_key_perms(&key_path)?;
            std::fs::write(&known_hosts_path, known_hosts)?;
            Ok(CredentialStaging::Ssh { key_path, known_hosts_path })
        }
    }
}

fn sibling_creds_dir(working_dir: &Path) -> PathBuf {
    let file_name = working_dir
        .file_name()
        .map(|name| format!("{}-creds", name.to_string_lossy()))
        .unwrap_or_else(|| "reverser-creds".to_string());
    working_dir
        .parent()
        .map(|parent| parent.join(&file_name))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), GitError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), GitError> {
    Ok(())
}

#[cfg(unix)]
fn set_private_key_perms(path: &Path) -> Result<(), GitError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private_key_perms(_path: &Path) -> Result<(), GitError> {
    Ok(())
}

/// Single-quote wrap for safe embedding in a POSIX shell script.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn classify_failure(repo_url: &str, stderr: &str) -> GitError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication") || lower.contains("permission denied") || lower.contains("403") {
        GitError::AuthenticationFailed {
            repo_url: repo_url.to_string(),
        }
    } else if lower.contains("repository not found") || lower.contains("does not exist") || lower.contains("404") {
        GitError::RepositoryNotFound {
            repo_url: repo_url.to_string(),
        }
    } else if lower.contains("non-fast-forward") || lower.contains("fetch first") || lower.contains("rejected") {
        GitError::NonFastForward {
            branch: "unknown".to_string(),
        }
    } else if lower.contains("could not resolve host") || lower.contains("connection") || lower.contains("timed out") {
        GitError::NetworkTransient(stderr.to_string())
    } else {
        GitError::CommandFailed(stderr.to_string())
    }
}

/// `auto-commit: <N> change(s)` followed by a blank line and a stable,
/// sorted list of `<op> <identifier>` lines.
fn commit_message(batch: &CommitBatch) -> String {
    let mut lines: Vec<String> = batch
        .items
        .iter()
        .map(|item| format!("{} {}", item.operation.as_str(), item.identifier.canonical()))
        .collect();
    lines.sort();

    format!("auto-commit: {} change(s)\n\n{}", batch.items.len(), lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::{CommitItem, ResourceIdentifier};

    fn batch() -> CommitBatch {
        CommitBatch {
            items: vec![
                CommitItem {
                    operation: Operation::Create,
                    identifier: ResourceIdentifier::new("apps", "v1", "deployments", "team-a", "web"),
                    object: serde_json::json!({"metadata": {"name": "web"}}),
                    base_folder: "clusters/a".to_string(),
                },
                CommitItem {
                    operation: Operation::Delete,
                    identifier: ResourceIdentifier::new("", "v1", "configmaps", "team-a", "cfg"),
                    object: serde_json::json!({}),
                    base_folder: "clusters/a".to_string(),
                },
            ],
        }
    }

    #[test]
    fn commit_message_header_counts_items() {
        let message = commit_message(&batch());
        assert!(message.starts_with("auto-commit: 2 change(s)\n\n"));
    }

    #[test]
    fn commit_message_lines_are_sorted() {
        let message = commit_message(&batch());
        let body: Vec<&str> = message.split("\n\n").nth(1).unwrap().lines().collect();
        let mut sorted = body.clone();
        sorted.sort();
        assert_eq!(body, sorted);
    }

    #[test]
    fn classify_failure_detects_authentication() {
        let err = classify_failure("https://example.com/r.git", "remote: Authentication failed");
        assert!(matches!(err, GitError::AuthenticationFailed { .. }));
    }

    #[test]
    fn classify_failure_detects_non_fast_forward() {
        let err = classify_failure("https://example.com/r.git", "! [rejected] main -> main (non-fast-forward)");
        assert!(matches!(err, GitError::NonFastForward { .. }));
    }

    #[test]
    fn classify_failure_falls_back_to_command_failed() {
        let err = classify_failure("https://example.com/r.git", "some unrecognized failure");
        assert!(matches!(err, GitError::CommandFailed(_)));
    }

    #[test]
    fn stage_credentials_writes_askpass_script() {
        let dir = tempfile::tempdir().unwrap();
        let working_dir = dir.path().join("repo");
        let staging = stage_credentials(
            &working_dir,
            &GitCredentials::TokenAuth {
                username: "git".to_string(),
                token: "sekret".to_string(),
            },
        )
        .unwrap();

        match staging {
            CredentialStaging::Token { askpass_path } => {
                let script = std::fs::read_to_string(&askpass_path).unwrap();
                assert!(script.contains("'sekret'"));
                assert!(askpass_path.parent().unwrap() != working_dir);
            }
            _ => panic!("expected token staging"),
        }
    }

    #[test]
    fn stage_credentials_writes_ssh_key_and_known_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let working_dir = dir.path().join("repo");
        let staging = stage_credentials(
            &working_dir,
            &GitCredentials::SshAuth {
                private_key_pem: "-----BEGIN KEY-----".to_string(),
                known_hosts: "github.com ssh-rsa AAAA".to_string(),
            },
        )
        .unwrap();

        match staging {
            CredentialStaging::Ssh { key_path, known_hosts_path } => {
                assert_eq!(std::fs::read_to_string(&key_path).unwrap(), "-----BEGIN KEY-----");
                assert_eq!(std::fs::read_to_string(&known_hosts_path).unwrap(), "github.com ssh-rsa AAAA");
            }
            _ => panic!("expected ssh staging"),
        }
    }

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
