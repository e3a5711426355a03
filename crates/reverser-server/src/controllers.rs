//! CRD reconcilers for the four kinds: `NamespacedRule`, `ClusterRule`,
//! `Destination`, `RepositoryConfig`.
//!
//! Each runs its own `kube::runtime::Controller` loop against the same
//! shared [`Context`]. Validation failures and config conflicts never
//! panic: they are written to the object's status condition and logged,
//! then retried on the next reconcile.
//!
//! `ClusterRule.spec.gitRepoConfigRef` is resolved as a reference to a
//! `Destination` object (not directly to a `RepositoryConfig`), mirroring
//! how `NamespacedRule.spec.targetRef` works. This keeps branch/baseFolder
//! centralized on `Destination` for both rule kinds; see DESIGN.md.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use reverser_config::ReverserConfig;
use reverser_core::router::DestinationKey;
use reverser_core::worker::FaultSender;
use reverser_core::{
    BranchWorker, BranchWorkerHandle, CorrelationStore, DestinationStream, EventRouter, GitFacade,
    Metrics, ReconcilerManager, RuleStore, ValidationError, WatchManager,
};
use reverser_crd::{
    ClusterRule, CredentialsRef, Destination, DestinationStatus, NamespacedRule, RepositoryConfig,
    RepositoryConfigSpec, RepositoryConfigStatus, RulePhase, RuleStatus,
};
use reverser_retry::BackoffConfig;
use reverser_types::GitCredentials;

use crate::error::{Error, Result};
use crate::validate;

struct RepoEntry {
    git: Arc<GitFacade>,
    worker_handle: Arc<BranchWorkerHandle>,
}

/// Per-`(repoKey, branch)` Git facade and Branch Worker, shared across every
/// destination that lands in the same branch.
#[derive(Default)]
struct RepoRegistry {
    entries: DashMap<(String, String), RepoEntry>,
}

/// Shared state every reconciler runs against.
pub struct Context {
    pub client: Client,
    pub config: Arc<ReverserConfig>,
    pub rule_store: Arc<RuleStore>,
    pub correlation: Arc<CorrelationStore>,
    pub router: Arc<EventRouter>,
    pub watch: Arc<WatchManager>,
    pub reconciler: Arc<ReconcilerManager>,
    pub metrics: Arc<Metrics>,
    pub recorder: Recorder,
    pub fault_tx: FaultSender,
    pub data_dir: PathBuf,
    pub worker_cancel: CancellationToken,
    /// Set once the startup CRD probes have run, for the `/readyz` handler.
    pub rules_loaded: std::sync::atomic::AtomicBool,
    repos: RepoRegistry,
    /// `(repo, branch, baseFolder)` -> uid of the `Destination` that claimed
    /// it first, for `ConfigConflict` detection.
    destination_owners: DashMap<DestinationKey, String>,
}

#[allow(clippy::too_many_arguments)]
impl Context {
    pub fn new(
        client: Client,
        config: Arc<ReverserConfig>,
        rule_store: Arc<RuleStore>,
        correlation: Arc<CorrelationStore>,
        router: Arc<EventRouter>,
        watch: Arc<WatchManager>,
        reconciler: Arc<ReconcilerManager>,
        metrics: Arc<Metrics>,
        fault_tx: FaultSender,
        data_dir: PathBuf,
        worker_cancel: CancellationToken,
    ) -> Self {
        let reporter = Reporter { controller: "reverser-server".to_string(), instance: None };
        let recorder = Recorder::new(client.clone(), reporter);
        Self {
            client,
            config,
            rule_store,
            correlation,
            router,
            watch,
            reconciler,
            metrics,
            recorder,
            fault_tx,
            data_dir,
            worker_cancel,
            rules_loaded: std::sync::atomic::AtomicBool::new(false),
            repos: RepoRegistry::default(),
            destination_owners: DashMap::new(),
        }
    }

    /// Look up (or build and start) the Branch Worker for `(repo_key,
    /// branch)`, cloning the repository into its working directory on first
    /// use.
    async fn ensure_repo_worker(
        &self,
        repo_key: &str,
        branch: &str,
        repo_spec: &RepositoryConfigSpec,
        credentials: GitCredentials,
    ) -> Result<(Arc<BranchWorkerHandle>, Arc<GitFacade>)> {
        let cache_key = (repo_key.to_string(), branch.to_string());
        if let Some(entry) = self.repos.entries.get(&cache_key) {
            return Ok((entry.worker_handle.clone(), entry.git.clone()));
        }

        let working_dir = self.data_dir.join(path_component(repo_key)).join(path_component(branch));
        let git = Arc::new(GitFacade::new(
            repo_spec.repo_url.clone(),
            credentials,
            working_dir,
            self.config.git.author_name.clone(),
            self.config.git.author_email.clone(),
            self.config.git.operation_timeout,
            self.config.git.push_cycle_timeout,
        )?);
        git.ensure_clone().await?;
        git.checkout(branch).await?;

        let (handle, mailbox) =
            BranchWorkerHandle::new(self.config.worker.mailbox_capacity, self.config.worker.overflow_capacity);
        let handle = Arc::new(handle);
        let backoff = BackoffConfig {
            max_attempts: self.config.worker.max_retries,
            ..BackoffConfig::branch_worker_default()
        };
        let worker = BranchWorker::new(
            repo_key.to_string(),
            branch.to_string(),
            mailbox,
            handle.clone(),
            git.clone(),
            backoff,
            self.config.worker.max_batch,
            self.config.worker.flush_interval,
            self.config.worker.shutdown_timeout,
            self.metrics.clone(),
            self.fault_tx.clone(),
        );
        tokio::spawn(worker.run(self.worker_cancel.child_token()));

        self.repos.entries.insert(cache_key, RepoEntry { git: git.clone(), worker_handle: handle.clone() });
        Ok((handle, git))
    }

    /// Ready once the Rule Store has loaded at least once and every known
    /// destination's state machine is at least `Seeding`.
    pub fn is_ready(&self) -> bool {
        self.rules_loaded.load(std::sync::atomic::Ordering::Relaxed) && self.reconciler.all_attached_at_least_seeding()
    }
}

fn path_component(raw: &str) -> String {
    raw.replace("..", "_").replace('/', "_")
}

fn repo_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn ready_condition(generation: Option<i64>, ok: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: "Ready".to_string(),
        status: if ok { "True".to_string() } else { "False".to_string() },
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

async fn publish_event(
    recorder: &Recorder,
    event_type: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
    object: &impl Resource<DynamicType = ()>,
) {
    let event = Event {
        type_: event_type,
        reason: reason.to_string(),
        note,
        action: action.to_string(),
        secondary: None,
    };
    if let Err(err) = recorder.publish(&event, &object.object_ref(&())).await {
        warn!(error = %err, "failed to publish kubernetes event");
    }
}

async fn fetch_namespace_labels(client: &Client, namespace: &str) -> BTreeMap<String, String> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.get(namespace).await {
        Ok(ns) => ns.metadata.labels.unwrap_or_default(),
        Err(err) => {
            warn!(namespace, error = %err, "failed to fetch namespace labels, treating as unlabeled");
            BTreeMap::new()
        }
    }
}

/// Resolve Git credentials from the `Secret` a `RepositoryConfig` points at.
/// Accepts `{username, token}` (token auth) or `{privateKey, knownHosts}`
/// (SSH auth) keys.
async fn resolve_credentials(
    client: &Client,
    repo_namespace: &str,
    credentials_ref: &CredentialsRef,
) -> Result<GitCredentials> {
    let ns = credentials_ref.namespace.as_deref().unwrap_or(repo_namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns);
    let secret = secrets.get(&credentials_ref.name).await?;
    let data = secret.data.unwrap_or_default();
    let field = |key: &str| data.get(key).map(|v| String::from_utf8_lossy(&v.0).to_string());

    if let (Some(username), Some(token)) = (field("username"), field("token")) {
        return Ok(GitCredentials::TokenAuth { username, token });
    }
    if let (Some(private_key_pem), Some(known_hosts)) = (field("privateKey"), field("knownHosts")) {
        return Ok(GitCredentials::SshAuth { private_key_pem, known_hosts });
    }
    Err(Error::Other(format!(
        "secret {ns}/{} does not contain a recognized credential shape",
        credentials_ref.name
    )))
}

/// Patch the shared `RuleStatus` shape onto either `NamespacedRule` or
/// `ClusterRule`.
async fn patch_rule_status<K>(api: &Api<K>, name: &str, generation: Option<i64>, phase: RulePhase, message: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let status = RuleStatus {
        phase: Some(phase),
        observed_generation: generation,
        conditions: vec![ready_condition(generation, phase == RulePhase::Installed, "Reconciled", message)],
    };
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(json!({ "status": status }))).await?;
    Ok(())
}

// --- NamespacedRule -------------------------------------------------------

#[instrument(skip(doc, ctx), fields(name = %doc.name_any(), namespace = doc.namespace().as_deref()))]
async fn reconcile_namespaced_rule(doc: Arc<NamespacedRule>, ctx: Arc<Context>) -> Result<Action> {
    let ns = doc.namespace().ok_or_else(|| Error::MissingNamespace(doc.name_any()))?;
    let name = doc.name_any();
    let api: Api<NamespacedRule> = Api::namespaced(ctx.client.clone(), &ns);

    match try_compile_namespaced(&doc, &ns, &ctx).await {
        Ok(rule) => {
            ctx.rule_store.upsert_namespaced(&ns, &name, rule);
            ctx.watch.reconcile_informers().await;
            patch_rule_status(&api, &name, doc.meta().generation, RulePhase::Installed, "rule compiled and installed").await?;
            publish_event(&ctx.recorder, EventType::Normal, "RuleInstalled", "Reconcile", Some("rule compiled and installed".to_string()), doc.as_ref()).await;
            Ok(Action::requeue(Duration::from_secs(300)))
        }
        Err(err) => {
            ctx.rule_store.delete_namespaced(&ns, &name);
            ctx.watch.reconcile_informers().await;
            patch_rule_status(&api, &name, doc.meta().generation, RulePhase::Invalid, &err.to_string()).await?;
            publish_event(&ctx.recorder, EventType::Warning, "RuleInvalid", "Reconcile", Some(err.to_string()), doc.as_ref()).await;
            Ok(Action::requeue(Duration::from_secs(60)))
        }
    }
}

async fn try_compile_namespaced(doc: &NamespacedRule, ns: &str, ctx: &Context) -> Result<reverser_types::CompiledRule> {
    let destinations: Api<Destination> = Api::namespaced(ctx.client.clone(), ns);
    let destination = destinations
        .get(&doc.spec.target_ref.name)
        .await
        .map_err(|_| ValidationError::UnknownRepoRef(doc.spec.target_ref.name.clone()))?;

    let repo_configs: Api<RepositoryConfig> = Api::namespaced(ctx.client.clone(), ns);
    let repo_config = repo_configs
        .get(&destination.spec.repo_ref.name)
        .await
        .map_err(|_| ValidationError::UnknownRepoRef(destination.spec.repo_ref.name.clone()))?;

    validate::validate_destination(&destination.spec, &repo_config.spec)?;

    let namespace_labels = fetch_namespace_labels(&ctx.client, ns).await;
    if !validate::namespaced_rule_allowed(&repo_config.spec.access_policy, &namespace_labels) {
        return Err(Error::Other(format!(
            "repository {ns}/{} access policy rejects namespaced rules from {ns}",
            destination.spec.repo_ref.name
        )));
    }

    let key = repo_key(ns, &destination.spec.repo_ref.name);
    Ok(validate::compile_namespaced_rule(ns, &doc.name_any(), doc.uid(), &doc.spec, &key, &destination.spec)?)
}

// --- ClusterRule -----------------------------------------------------------

#[instrument(skip(doc, ctx), fields(name = %doc.name_any()))]
async fn reconcile_cluster_rule(doc: Arc<ClusterRule>, ctx: Arc<Context>) -> Result<Action> {
    let name = doc.name_any();
    let api: Api<ClusterRule> = Api::all(ctx.client.clone());

    match try_compile_cluster(&doc, &ctx).await {
        Ok(rule) => {
            ctx.rule_store.upsert_cluster(&name, rule);
            ctx.watch.reconcile_informers().await;
            patch_rule_status(&api, &name, doc.meta().generation, RulePhase::Installed, "rule compiled and installed").await?;
            publish_event(&ctx.recorder, EventType::Normal, "RuleInstalled", "Reconcile", Some("rule compiled and installed".to_string()), doc.as_ref()).await;
            Ok(Action::requeue(Duration::from_secs(300)))
        }
        Err(err) => {
            ctx.rule_store.delete_cluster(&name);
            ctx.watch.reconcile_informers().await;
            patch_rule_status(&api, &name, doc.meta().generation, RulePhase::Invalid, &err.to_string()).await?;
            publish_event(&ctx.recorder, EventType::Warning, "RuleInvalid", "Reconcile", Some(err.to_string()), doc.as_ref()).await;
            Ok(Action::requeue(Duration::from_secs(60)))
        }
    }
}

async fn try_compile_cluster(doc: &ClusterRule, ctx: &Context) -> Result<reverser_types::CompiledRule> {
    let dest_ns = doc.spec.git_repo_config_ref.namespace.clone();
    let dest_name = doc.spec.git_repo_config_ref.name.clone();

    let destinations: Api<Destination> = Api::namespaced(ctx.client.clone(), &dest_ns);
    let destination = destinations
        .get(&dest_name)
        .await
        .map_err(|_| ValidationError::UnknownRepoRef(dest_name.clone()))?;

    let repo_configs: Api<RepositoryConfig> = Api::namespaced(ctx.client.clone(), &dest_ns);
    let repo_config = repo_configs
        .get(&destination.spec.repo_ref.name)
        .await
        .map_err(|_| ValidationError::UnknownRepoRef(destination.spec.repo_ref.name.clone()))?;

    validate::validate_destination(&destination.spec, &repo_config.spec)?;

    if !repo_config.spec.access_policy.allow_cluster_rules {
        return Err(Error::Other(format!(
            "repository {dest_ns}/{} does not allow cluster rules",
            destination.spec.repo_ref.name
        )));
    }

    let key = repo_key(&dest_ns, &destination.spec.repo_ref.name);
    Ok(validate::compile_cluster_rule(&doc.name_any(), doc.uid(), &doc.spec, &key, &destination.spec)?)
}

// --- RepositoryConfig --------------------------------------------------

#[instrument(skip(doc, ctx), fields(name = %doc.name_any(), namespace = doc.namespace().as_deref()))]
async fn reconcile_repository_config(doc: Arc<RepositoryConfig>, ctx: Arc<Context>) -> Result<Action> {
    let ns = doc.namespace().ok_or_else(|| Error::MissingNamespace(doc.name_any()))?;
    let name = doc.name_any();
    let api: Api<RepositoryConfig> = Api::namespaced(ctx.client.clone(), &ns);

    let (phase, message) = if doc.spec.access_policy.is_valid() {
        (RulePhase::Installed, "access policy is well-formed".to_string())
    } else {
        (
            RulePhase::Invalid,
            "namespaceSelector must be set if and only if mode is FromSelector".to_string(),
        )
    };

    let status = RepositoryConfigStatus {
        phase: Some(phase),
        conditions: vec![ready_condition(doc.meta().generation, phase == RulePhase::Installed, "Reconciled", &message)],
    };
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(json!({ "status": status }))).await?;

    let event_type = if phase == RulePhase::Installed { EventType::Normal } else { EventType::Warning };
    publish_event(&ctx.recorder, event_type, "RepositoryConfigReconciled", "Reconcile", Some(message), doc.as_ref()).await;

    Ok(Action::requeue(Duration::from_secs(300)))
}

// --- Destination ------------------------------------------------------

#[instrument(skip(doc, ctx), fields(name = %doc.name_any(), namespace = doc.namespace().as_deref()))]
async fn reconcile_destination(doc: Arc<Destination>, ctx: Arc<Context>) -> Result<Action> {
    let ns = doc.namespace().ok_or_else(|| Error::MissingNamespace(doc.name_any()))?;
    let name = doc.name_any();
    let key: DestinationKey = (repo_key(&ns, &doc.spec.repo_ref.name), doc.spec.branch.clone(), doc.spec.base_folder.clone());

    if doc.meta().deletion_timestamp.is_some() {
        ctx.destination_owners.remove(&key);
        ctx.reconciler.detach(&key);
        info!(namespace = %ns, name = %name, "destination removed, gate closed, git files left in place");
        return Ok(Action::await_change());
    }

    let api: Api<Destination> = Api::namespaced(ctx.client.clone(), &ns);

    match attach_destination(&doc, &ns, &key, &ctx).await {
        Ok(()) => {
            let status = DestinationStatus {
                phase: Some(RulePhase::Installed),
                conflicts_with: None,
                conditions: vec![ready_condition(doc.meta().generation, true, "Reconciled", "destination attached")],
            };
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(json!({ "status": status }))).await?;
            publish_event(&ctx.recorder, EventType::Normal, "DestinationAttached", "Reconcile", Some("destination attached".to_string()), doc.as_ref()).await;
            Ok(Action::requeue(Duration::from_secs(300)))
        }
        Err(err) => {
            let (phase, conflicts_with) = match &err {
                Error::ConfigConflict(conflict) => (RulePhase::Conflicted, Some(conflict.other.clone())),
                _ => (RulePhase::Invalid, None),
            };
            let status = DestinationStatus {
                phase: Some(phase),
                conflicts_with,
                conditions: vec![ready_condition(doc.meta().generation, false, "Reconciled", &err.to_string())],
            };
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(json!({ "status": status }))).await?;
            publish_event(&ctx.recorder, EventType::Warning, "DestinationInvalid", "Reconcile", Some(err.to_string()), doc.as_ref()).await;
            Ok(Action::requeue(Duration::from_secs(60)))
        }
    }
}

async fn attach_destination(doc: &Destination, ns: &str, key: &DestinationKey, ctx: &Context) -> Result<()> {
    let uid = doc.uid().ok_or_else(|| Error::MissingUid(doc.name_any()))?;
    if let Some(owner) = ctx.destination_owners.get(key) {
        if *owner != uid {
            return Err(reverser_core::ConfigConflict {
                this: format!("{ns}/{}", doc.name_any()),
                other: owner.clone(),
                repo: key.0.clone(),
                branch: key.1.clone(),
                base_folder: key.2.clone(),
            }
            .into());
        }
        return Ok(());
    }

    let repo_configs: Api<RepositoryConfig> = Api::namespaced(ctx.client.clone(), ns);
    let repo_config = repo_configs
        .get(&doc.spec.repo_ref.name)
        .await
        .map_err(|_| ValidationError::UnknownRepoRef(doc.spec.repo_ref.name.clone()))?;

    validate::validate_destination(&doc.spec, &repo_config.spec)?;

    let credentials = resolve_credentials(&ctx.client, ns, &repo_config.spec.credentials_ref).await?;
    let repo_key_str = repo_key(ns, &doc.spec.repo_ref.name);
    let (worker_handle, git) = ctx
        .ensure_repo_worker(&repo_key_str, &doc.spec.branch, &repo_config.spec, credentials)
        .await?;

    let stream = Arc::new(DestinationStream::new(key.clone(), worker_handle.clone()));
    ctx.reconciler.attach(key.clone(), stream, worker_handle, git, doc.spec.base_folder.clone());
    ctx.destination_owners.insert(key.clone(), uid);
    Ok(())
}

// --- error policy and startup --------------------------------------------

fn error_policy<K>(doc: Arc<K>, err: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let name = doc.name_any();
    error!(error = %err, object = %name, "reconciliation failed, scheduling retry");

    let recorder = ctx.recorder.clone();
    let message = err.to_string();
    let oref = doc.object_ref(&());
    tokio::spawn(async move {
        let event = Event {
            type_: EventType::Warning,
            reason: "ReconcileFailed".to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(&event, &oref).await {
            warn!(error = %err, "failed to publish kubernetes event");
        }
    });

    Action::requeue(Duration::from_secs(60))
}

/// Probe that a CRD is installed before starting its controller loop, to
/// fail fast with a clear log line instead of an opaque watch error.
async fn probe_installed<K>(client: &Client, kind: &str) -> bool
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let api: Api<K> = Api::all(client.clone());
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => true,
        Err(err) => {
            error!(kind, error = %err, "failed to list custom resource, CRD may not be installed");
            false
        }
    }
}

/// Spawn all four CRD reconciler loops against the shared context. Each
/// runs until `cancel` fires.
pub async fn spawn_controllers(ctx: Arc<Context>, cancel: CancellationToken) {
    probe_installed::<NamespacedRule>(&ctx.client, "NamespacedRule").await;
    probe_installed::<ClusterRule>(&ctx.client, "ClusterRule").await;
    probe_installed::<Destination>(&ctx.client, "Destination").await;
    probe_installed::<RepositoryConfig>(&ctx.client, "RepositoryConfig").await;
    ctx.rules_loaded.store(true, std::sync::atomic::Ordering::Relaxed);

    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let api: Api<NamespacedRule> = Api::all(ctx.client.clone());
            Controller::new(api, watcher::Config::default())
                .graceful_shutdown_on(cancel.cancelled_owned())
                .run(reconcile_namespaced_rule, error_policy::<NamespacedRule>, ctx)
                .filter_map(|res| async move { res.ok() })
                .for_each(|_| futures::future::ready(()))
                .await;
        });
    }
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let api: Api<ClusterRule> = Api::all(ctx.client.clone());
            Controller::new(api, watcher::Config::default())
                .graceful_shutdown_on(cancel.cancelled_owned())
                .run(reconcile_cluster_rule, error_policy::<ClusterRule>, ctx)
                .filter_map(|res| async move { res.ok() })
                .for_each(|_| futures::future::ready(()))
                .await;
        });
    }
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let api: Api<Destination> = Api::all(ctx.client.clone());
            Controller::new(api, watcher::Config::default())
                .graceful_shutdown_on(cancel.cancelled_owned())
                .run(reconcile_destination, error_policy::<Destination>, ctx)
                .filter_map(|res| async move { res.ok() })
                .for_each(|_| futures::future::ready(()))
                .await;
        });
    }
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let api: Api<RepositoryConfig> = Api::all(ctx.client.clone());
            Controller::new(api, watcher::Config::default())
                .graceful_shutdown_on(cancel.cancelled_owned())
                .run(reconcile_repository_config, error_policy::<RepositoryConfig>, ctx)
                .filter_map(|res| async move { res.ok() })
                .for_each(|_| futures::future::ready(()))
                .await;
        });
    }
}

/// Drain `WorkerFault`s into the Reconciler Manager, translating Branch
/// Worker failures into `Faulted` destinations.
pub async fn run_fault_listener(
    mut faults: tokio::sync::mpsc::Receiver<reverser_core::WorkerFault>,
    reconciler: Arc<ReconcilerManager>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            fault = faults.recv() => {
                match fault {
                    Some(fault) => reconciler.handle_fault(&fault),
                    None => return,
                }
            }
        }
    }
}
