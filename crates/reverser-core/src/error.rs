//! Error taxonomy for the pipeline.
//!
//! Ingestion paths never fail: the Rule Store, Correlation Store, Watch
//! Manager, Event Router and Destination Stream absorb and count errors
//! rather than propagating them. Only the Branch Worker and the Rule
//! Reconciler surface failures to callers.

use thiserror::Error;

/// Failures the Git Repository Facade can report. Each variant maps to a
/// fixed retry policy in [`reverser_retry::decide`] via [`GitError::is_retryable`].
#[derive(Debug, Error)]
pub enum GitError {
    #[error("authentication failed for {repo_url}")]
    AuthenticationFailed { repo_url: String },

    #[error("repository not found: {repo_url}")]
    RepositoryNotFound { repo_url: String },

    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    #[error("non-fast-forward push to {branch}")]
    NonFastForward { branch: String },

    #[error("git operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("git command failed: {0}")]
    CommandFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Whether the Branch Worker should retry this failure with backoff, or
    /// mark the worker Faulted immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            GitError::AuthenticationFailed { .. } | GitError::RepositoryNotFound { .. } => false,
            GitError::NetworkTransient(_)
            | GitError::NonFastForward { .. }
            | GitError::Timeout(_)
            | GitError::CommandFailed(_)
            | GitError::Io(_) => true,
        }
    }
}

/// Failures the Rule Reconciler can surface on a source object's status.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("resources list must contain at least one entry")]
    EmptyResources,

    #[error("baseFolder {0:?} is invalid: must not start with '/' and must not contain '..' segments")]
    InvalidBaseFolder(String),

    #[error("namespaceSelector is set but mode is not FromSelector")]
    UnexpectedNamespaceSelector,

    #[error("mode is FromSelector but namespaceSelector is unset")]
    MissingNamespaceSelector,

    #[error("destination branch {branch:?} is not in repository's allowedBranches")]
    BranchNotAllowed { branch: String },

    #[error("unknown repository reference {0:?}")]
    UnknownRepoRef(String),
}

/// Reported when two destinations collide on `(repo, branch, baseFolder)`.
#[derive(Debug, Error)]
#[error("destination {this} conflicts with {other} on (repo={repo}, branch={branch}, baseFolder={base_folder})")]
pub struct ConfigConflict {
    pub this: String,
    pub other: String,
    pub repo: String,
    pub branch: String,
    pub base_folder: String,
}

/// Sanitizer failures. The offending
/// event is dropped and logged; the destination is not faulted.
#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("object is not a JSON object at its root")]
    NotAnObject,

    #[error("failed to render canonical YAML: {0}")]
    YamlRender(#[from] serde_yaml::Error),
}
