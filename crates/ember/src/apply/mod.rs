//! The apply orchestrator: drives the cache and execute plans, routes
//! progress to the host application, pairs the two workers through
//! per-package syncpoints, and rolls back from the most recent boundary on
//! failure.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use ember_bundle_types::{
    manifest::{BundleManifest, Container},
    ActionState, PackageKind, Variables,
};
use ember_cache::{CacheEngine, CacheError, CacheProgress, ProgressResult};

use crate::packages::{
    self, ExecuteError, ExecuteOutcome, ExecutionRequest, ProcessRunner,
};
use crate::plan::{
    ActionIndex, CacheAction, ExecuteAction, Plan, PlanEntry, ProviderAction,
};
use crate::registration::{RegistrationError, RegistrationStore, SessionInfo};

/// How many times one acquire source is retried per apply after
/// verification failures.
const MAX_ACQUIRE_ATTEMPTS: u32 = 2;

/// One payload to pull out of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractEntry {
    /// The payload id.
    pub payload_id: String,
    /// The payload's path inside the container.
    pub source_path: PathBuf,
    /// Where to write the extracted bytes.
    pub destination: PathBuf,
}

/// The seam to the archive format of containers. The engine decides what to
/// extract and where; implementations own the container format.
#[async_trait]
pub trait ContainerExtractor: Send + Sync {
    /// Extracts the listed payloads from a container.
    async fn extract(
        &self,
        container: &Container,
        container_path: &Path,
        entries: &[ExtractEntry],
    ) -> io::Result<()>;
}

/// An extractor for hosts without container support; every extraction
/// fails.
#[derive(Debug, Default)]
pub struct UnsupportedExtractor;

#[async_trait]
impl ContainerExtractor for UnsupportedExtractor {
    async fn extract(
        &self,
        container: &Container,
        _container_path: &Path,
        _entries: &[ExtractEntry],
    ) -> io::Result<()> {
        Err(io::Error::other(format!(
            "no container extractor available for '{}'",
            container.id
        )))
    }
}

/// Progress and cancellation routing to the host application.
pub trait HostCallbacks: Send + Sync {
    /// Cache transfer progress. `Cancel`/`Stop` aborts the apply.
    fn on_cache_progress(&self, progress: CacheProgress<'_>) -> ProgressResult {
        let _ = progress;
        ProgressResult::Continue
    }

    /// A package is about to execute. `Cancel`/`Stop` aborts the apply with
    /// rollback.
    fn on_execute_package_begin(&self, package_id: &str, action: ActionState) -> ProgressResult {
        let _ = (package_id, action);
        ProgressResult::Continue
    }

    /// A package finished executing.
    fn on_execute_package_complete(&self, package_id: &str, outcome: &ExecuteOutcome) {
        let _ = (package_id, outcome);
    }
}

/// A host application that never cancels and shows nothing.
#[derive(Debug, Default)]
pub struct NoopCallbacks;

impl HostCallbacks for NoopCallbacks {}

/// Whether the machine must restart after this apply.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum RestartState {
    /// No restart needed.
    #[default]
    None,
    /// A package requires a restart to finish.
    Required,
    /// A package initiated the restart itself.
    Initiated,
}

/// The result of a successful apply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// The restart disposition.
    pub restart: RestartState,
    /// Package ids that executed, in order.
    pub executed_packages: Vec<String>,
    /// Packages that were rolled back inside a non-vital boundary.
    pub rolled_back_packages: Vec<String>,
}

/// An error that ended the apply.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The host application canceled.
    #[error("the apply was canceled")]
    UserExit,

    /// Caching a vital package failed.
    #[error("caching package '{package}' failed")]
    Cache {
        /// The package id.
        package: String,
        /// The cache failure.
        #[source]
        source: CacheError,
    },

    /// Extracting a container failed.
    #[error("extracting container '{container}' failed")]
    Extract {
        /// The container id.
        container: String,
        /// The extraction failure.
        #[source]
        source: io::Error,
    },

    /// A package execution failed inside a vital boundary.
    #[error(transparent)]
    Execute(#[from] ExecuteError),

    /// A registration write failed.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The plan referenced an object the manifest does not define. This
    /// indicates state divergence and is fatal without rollback.
    #[error("plan references unknown object '{0}'")]
    PlanInvariant(String),
}

/// Everything the apply needs, wired once by the engine host.
pub struct ApplyContext {
    /// The manifest.
    pub manifest: Arc<BundleManifest>,
    /// The cache engine.
    pub cache: Arc<CacheEngine>,
    /// The registration store.
    pub registration: RegistrationStore,
    /// The process seam for package executions.
    pub runner: Arc<dyn ProcessRunner>,
    /// The container extraction seam.
    pub extractor: Arc<dyn ContainerExtractor>,
    /// The host application.
    pub callbacks: Arc<dyn HostCallbacks>,
    /// The variable snapshot; read-only during apply.
    pub variables: Arc<Variables>,
    /// Path of the running bundle executable.
    pub bundle_executable: PathBuf,
    /// Command line persisted for resume.
    pub resume_command_line: String,
    /// Engine version written into registration.
    pub engine_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SyncpointState {
    Pending,
    Cached,
    Failed { user_exit: bool },
}

type Syncpoints = HashMap<String, (watch::Sender<SyncpointState>, watch::Receiver<SyncpointState>)>;

fn make_syncpoints(plan: &Plan) -> Syncpoints {
    plan.live_cache_actions()
        .filter_map(|action| match action {
            CacheAction::SignalSyncpoint { package_id } => Some(package_id.clone()),
            _ => None,
        })
        .map(|package_id| {
            let (tx, rx) = watch::channel(SyncpointState::Pending);
            (package_id, (tx, rx))
        })
        .collect()
}

/// Applies a finalized plan. See the crate documentation for the worker and
/// rollback model.
pub async fn apply(context: &ApplyContext, plan: &Plan) -> Result<ApplyResult, ApplyError> {
    let syncpoints = make_syncpoints(plan);

    if plan.registration_ops.cache_bundle {
        context
            .cache
            .complete_bundle(
                plan.per_machine,
                &context.manifest.registration.bundle_id,
                &context.bundle_executable,
            )
            .await
            .map_err(|source| ApplyError::Cache {
                package: context.manifest.registration.bundle_id.clone(),
                source,
            })?;
    }

    let result = if context.manifest.parallel_cache {
        let cache_future = run_cache_plan(context, plan, &syncpoints);
        let execute_future = run_execute_plan(context, plan, &syncpoints);
        let (cache_result, execute_result) = tokio::join!(cache_future, execute_future);
        // An execute failure outranks a cache failure of the same apply
        // unless the cache failure explains it.
        match (cache_result, execute_result) {
            (_, Ok(result)) => Ok(result),
            (Err(cache_err), Err(ApplyError::UserExit)) => Err(cache_err),
            (_, Err(execute_err)) => Err(execute_err),
        }
    } else {
        run_cache_plan(context, plan, &syncpoints).await?;
        run_execute_plan(context, plan, &syncpoints).await
    };

    // Post-apply cache cleanup is best effort either way.
    for package_id in &plan.clean_actions {
        if let Some(package) = context.manifest.package(package_id) {
            let _ = context
                .cache
                .remove_package(package.per_machine, &package.id, &package.cache_id)
                .await;
        }
    }
    let _ = context.cache.remove_working_folder().await;

    // A successful non-uninstall apply settles the session it opened:
    // resume moves to the add/remove state and the reboot marker is armed
    // when a restart is pending.
    if let Ok(apply_result) = &result {
        let session_began = plan
            .live_execute_actions()
            .any(|action| matches!(action, ExecuteAction::Registration { keep: true }));
        if session_began {
            context.registration.complete_session(
                &context.manifest.registration.bundle_id,
                plan.per_machine,
                true,
                apply_result.restart != RestartState::None,
            )?;
        }
    }

    result
}

// ---- cache worker ----

struct PackageSpan {
    package_id: String,
    complete_index: ActionIndex,
    vital: bool,
}

async fn run_cache_plan(
    context: &ApplyContext,
    plan: &Plan,
    syncpoints: &Syncpoints,
) -> Result<(), ApplyError> {
    let actions = &plan.cache_actions;
    let mut attempts: HashMap<ActionIndex, u32> = HashMap::new();
    let mut force_run: HashSet<ActionIndex> = HashSet::new();
    let mut current_span: Option<PackageSpan> = None;
    let mut index = 0usize;

    while index < actions.len() {
        let entry: &PlanEntry<CacheAction> = &actions[index];
        if entry.deleted {
            index += 1;
            continue;
        }

        match run_cache_action(context, plan, &entry.action, &force_run, index).await {
            Ok(()) => {
                force_run.remove(&index);
                match &entry.action {
                    CacheAction::PackageStart {
                        package_id,
                        complete_index,
                        ..
                    } => {
                        let vital = context
                            .manifest
                            .package(package_id)
                            .map(|p| p.vital)
                            .unwrap_or(true);
                        current_span = Some(PackageSpan {
                            package_id: package_id.clone(),
                            complete_index: *complete_index,
                            vital,
                        });
                    }
                    CacheAction::PackageStop { .. } => current_span = None,
                    CacheAction::SignalSyncpoint { package_id } => {
                        if let Some((tx, _)) = syncpoints.get(package_id) {
                            // A package that already failed keeps its failed
                            // state even though its signal is still walked.
                            tx.send_if_modified(|state| {
                                if *state == SyncpointState::Pending {
                                    *state = SyncpointState::Cached;
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                    }
                    _ => {}
                }
                index += 1;
            }
            Err(failure) => {
                let user_exit = matches!(
                    &failure,
                    CacheFailure::Cache(CacheError::Acquire(
                        ember_cache::AcquireError::UserExit(_)
                    ))
                );

                // A verification failure resumes at the try-again action,
                // bounded per acquire source.
                if !user_exit {
                    if let Some(try_again) = cache_try_again(&entry.action) {
                        let attempt = attempts.entry(try_again).or_insert(0);
                        *attempt += 1;
                        if *attempt < MAX_ACQUIRE_ATTEMPTS {
                            tracing::warn!(
                                action = index,
                                resume_at = try_again,
                                attempt = *attempt,
                                "cache action failed, retrying from acquire"
                            );
                            force_run.insert(try_again);
                            index = try_again;
                            continue;
                        }
                    }
                }

                // The package failed for this apply.
                let span = current_span.take();
                let (package_id, vital, complete_index) = match &span {
                    Some(span) => (
                        span.package_id.clone(),
                        span.vital,
                        Some(span.complete_index),
                    ),
                    None => (context.manifest.registration.bundle_id.clone(), true, None),
                };

                if let Some((tx, _)) = syncpoints.get(&package_id) {
                    let _ = tx.send(SyncpointState::Failed { user_exit });
                }

                let error = failure.into_apply_error(&package_id);
                if user_exit || vital {
                    // Fail any other pending syncpoints so the execute
                    // worker cannot deadlock.
                    for (tx, _) in syncpoints.values() {
                        tx.send_if_modified(|state| {
                            if *state == SyncpointState::Pending {
                                *state = SyncpointState::Failed { user_exit };
                                true
                            } else {
                                false
                            }
                        });
                    }
                    return Err(error);
                }

                tracing::warn!(
                    package = %package_id,
                    error = %error,
                    "caching non-vital package failed, skipping"
                );
                match complete_index {
                    Some(complete_index) => index = complete_index,
                    None => index += 1,
                }
            }
        }
    }
    Ok(())
}

enum CacheFailure {
    Cache(CacheError),
    Extract { container: String, source: io::Error },
    Invariant(String),
}

impl CacheFailure {
    fn into_apply_error(self, package_id: &str) -> ApplyError {
        match self {
            CacheFailure::Cache(CacheError::Acquire(ember_cache::AcquireError::UserExit(_))) => {
                ApplyError::UserExit
            }
            CacheFailure::Cache(source) => ApplyError::Cache {
                package: package_id.to_owned(),
                source,
            },
            CacheFailure::Extract { container, source } => {
                ApplyError::Extract { container, source }
            }
            CacheFailure::Invariant(id) => ApplyError::PlanInvariant(id),
        }
    }
}

fn cache_try_again(action: &CacheAction) -> Option<ActionIndex> {
    match action {
        CacheAction::ExtractContainer { try_again, .. }
        | CacheAction::CachePayload { try_again, .. }
        | CacheAction::LayoutPayload { try_again, .. }
        | CacheAction::LayoutContainer { try_again, .. } => Some(*try_again),
        _ => None,
    }
}

fn catalog_path_for(context: &ApplyContext, catalog_id: Option<&String>) -> Option<PathBuf> {
    let catalog = context.manifest.payload(catalog_id?.as_str())?;
    let path = context.cache.resolve_payload_working_path(catalog);
    path.is_file().then_some(path)
}

async fn run_cache_action(
    context: &ApplyContext,
    plan: &Plan,
    action: &CacheAction,
    force_run: &HashSet<ActionIndex>,
    index: ActionIndex,
) -> Result<(), CacheFailure> {
    let callbacks = Arc::clone(&context.callbacks);
    let progress = move |p: CacheProgress<'_>| callbacks.on_cache_progress(p);

    match action {
        CacheAction::AcquireContainer {
            container_id,
            skip_until_retried,
        } => {
            if *skip_until_retried && !force_run.contains(&index) {
                return Ok(());
            }
            let container = context
                .manifest
                .container(container_id)
                .ok_or_else(|| CacheFailure::Invariant(container_id.clone()))?;
            let working = context.cache.resolve_container_working_path(container);
            context
                .cache
                .acquire_container(container, &working, &progress)
                .await
                .map_err(CacheFailure::Cache)?;
            context
                .cache
                .verify_container_at(container, &working)
                .await
                .map_err(CacheFailure::Cache)?;
            Ok(())
        }
        CacheAction::AcquirePayload {
            payload_id,
            skip_until_retried,
        } => {
            if *skip_until_retried && !force_run.contains(&index) {
                return Ok(());
            }
            let payload = context
                .manifest
                .payload(payload_id)
                .ok_or_else(|| CacheFailure::Invariant(payload_id.clone()))?;
            let working = context.cache.resolve_payload_working_path(payload);
            context
                .cache
                .acquire_payload(payload, &working, &progress)
                .await
                .map_err(CacheFailure::Cache)?;
            Ok(())
        }
        CacheAction::ExtractContainer {
            container_id,
            payload_ids,
            ..
        } => {
            let container = context
                .manifest
                .container(container_id)
                .ok_or_else(|| CacheFailure::Invariant(container_id.clone()))?;
            let container_path = if container.attached {
                context.bundle_executable.clone()
            } else {
                context.cache.resolve_container_working_path(container)
            };
            let entries: Vec<ExtractEntry> = payload_ids
                .iter()
                .filter_map(|id| context.manifest.payload(id))
                .map(|payload| ExtractEntry {
                    payload_id: payload.id.clone(),
                    source_path: payload.source_path.clone(),
                    destination: context.cache.resolve_payload_working_path(payload),
                })
                .collect();
            context
                .extractor
                .extract(container, &container_path, &entries)
                .await
                .map_err(|source| CacheFailure::Extract {
                    container: container.id.clone(),
                    source,
                })
        }
        CacheAction::CachePayload {
            package_id,
            payload_id,
            move_file,
            ..
        } => {
            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| CacheFailure::Invariant(package_id.clone()))?;
            let payload = context
                .manifest
                .payload(payload_id)
                .ok_or_else(|| CacheFailure::Invariant(payload_id.clone()))?;
            let working = context.cache.resolve_payload_working_path(payload);
            let catalog = catalog_path_for(context, payload.catalog.as_ref());
            context
                .cache
                .complete_payload(
                    package.per_machine,
                    payload,
                    &package.cache_id,
                    &working,
                    *move_file,
                    catalog.as_deref(),
                )
                .await
                .map(|_| ())
                .map_err(CacheFailure::Cache)
        }
        CacheAction::LayoutPayload {
            payload_id,
            move_file,
            ..
        } => {
            let payload = context
                .manifest
                .payload(payload_id)
                .ok_or_else(|| CacheFailure::Invariant(payload_id.clone()))?;
            let layout = plan
                .layout_directory
                .clone()
                .unwrap_or_else(|| context.bundle_executable.parent().unwrap_or(Path::new(".")).to_owned());
            let working = context.cache.resolve_payload_working_path(payload);
            let catalog = catalog_path_for(context, payload.catalog.as_ref());
            context
                .cache
                .layout_payload(payload, &layout, &working, *move_file, catalog.as_deref())
                .await
                .map(|_| ())
                .map_err(CacheFailure::Cache)
        }
        CacheAction::LayoutContainer {
            container_id,
            move_file,
            ..
        } => {
            let container = context
                .manifest
                .container(container_id)
                .ok_or_else(|| CacheFailure::Invariant(container_id.clone()))?;
            let layout = plan
                .layout_directory
                .clone()
                .unwrap_or_else(|| context.bundle_executable.parent().unwrap_or(Path::new(".")).to_owned());
            let working = if container.attached {
                context.bundle_executable.clone()
            } else {
                context.cache.resolve_container_working_path(container)
            };
            context
                .cache
                .layout_container(container, &layout, &working, *move_file && !container.attached)
                .await
                .map(|_| ())
                .map_err(CacheFailure::Cache)
        }
        CacheAction::LayoutBundle => {
            let layout = plan
                .layout_directory
                .clone()
                .unwrap_or_else(|| context.bundle_executable.parent().unwrap_or(Path::new(".")).to_owned());
            let file_name = context
                .bundle_executable
                .file_name()
                .map(|n| n.to_owned())
                .unwrap_or_default();
            let destination = layout.join(file_name);
            if destination != context.bundle_executable {
                fs_err::tokio::create_dir_all(&layout)
                    .await
                    .map_err(|e| CacheFailure::Cache(CacheError::Io(e)))?;
                fs_err::tokio::copy(&context.bundle_executable, &destination)
                    .await
                    .map_err(|e| CacheFailure::Cache(CacheError::Io(e)))?;
            }
            Ok(())
        }
        CacheAction::PackageStart { .. }
        | CacheAction::PackageStop { .. }
        | CacheAction::SignalSyncpoint { .. }
        | CacheAction::Checkpoint { .. }
        | CacheAction::RollbackPackage { .. } => Ok(()),
    }
}

// ---- execute worker ----

struct ExecuteState {
    last_checkpoint: u32,
    boundary: Option<(String, bool)>,
    executed_packages: Vec<String>,
    rolled_back_packages: Vec<String>,
    restart: RestartState,
    any_package_executed: bool,
}

async fn run_execute_plan(
    context: &ApplyContext,
    plan: &Plan,
    syncpoints: &Syncpoints,
) -> Result<ApplyResult, ApplyError> {
    let mut state = ExecuteState {
        last_checkpoint: 0,
        boundary: None,
        executed_packages: Vec::new(),
        rolled_back_packages: Vec::new(),
        restart: RestartState::None,
        any_package_executed: false,
    };

    let actions = &plan.execute_actions;
    let mut index = 0usize;

    while index < actions.len() {
        let entry = &actions[index];
        if entry.deleted {
            index += 1;
            continue;
        }

        match run_execute_action(context, plan, &entry.action, syncpoints, &mut state).await {
            Ok(()) => {
                index += 1;
            }
            Err(error) => {
                if matches!(error, ApplyError::UserExit) && !state.any_package_executed {
                    return Err(error);
                }

                let vital_boundary = state.boundary.as_ref().map(|(_, v)| *v).unwrap_or(true);
                tracing::warn!(
                    error = %error,
                    checkpoint = state.last_checkpoint,
                    vital_boundary,
                    "execute action failed, rolling back to boundary"
                );

                rollback_from_checkpoint(context, plan, &mut state).await;

                if vital_boundary {
                    return Err(error);
                }

                // Skip forward to the next boundary and keep going.
                let mut next_index = index + 1;
                while next_index < actions.len() {
                    if let ExecuteAction::RollbackBoundary { .. } = &actions[next_index].action {
                        break;
                    }
                    next_index += 1;
                }
                index = next_index;
            }
        }
    }

    Ok(ApplyResult {
        restart: state.restart,
        executed_packages: state.executed_packages,
        rolled_back_packages: state.rolled_back_packages,
    })
}

fn record_outcome(state: &mut ExecuteState, outcome: ExecuteOutcome) {
    match outcome {
        ExecuteOutcome::Success => {}
        ExecuteOutcome::RestartRequired => {
            if state.restart == RestartState::None {
                state.restart = RestartState::Required;
            }
        }
        ExecuteOutcome::RestartInitiated => state.restart = RestartState::Initiated,
    }
}

fn cached_payload_path(
    context: &ApplyContext,
    package_id: &str,
) -> Result<PathBuf, ApplyError> {
    let package = context
        .manifest
        .package(package_id)
        .ok_or_else(|| ApplyError::PlanInvariant(package_id.to_owned()))?;
    let payload_id = package
        .payload_refs
        .first()
        .ok_or_else(|| ApplyError::PlanInvariant(package_id.to_owned()))?;
    let payload = context
        .manifest
        .payload(payload_id)
        .ok_or_else(|| ApplyError::PlanInvariant(payload_id.clone()))?;
    Ok(context
        .cache
        .completed_payload_path(package.per_machine, &package.cache_id, payload))
}

async fn run_package_process(
    context: &ApplyContext,
    state: &mut ExecuteState,
    package_id: &str,
    action: ActionState,
    request: Option<ExecutionRequest>,
    interpret: impl Fn(i32) -> Result<ExecuteOutcome, ExecuteError>,
) -> Result<(), ApplyError> {
    let Some(request) = request else {
        return Ok(());
    };

    match context
        .callbacks
        .on_execute_package_begin(package_id, action)
    {
        ProgressResult::Cancel | ProgressResult::Stop => return Err(ApplyError::UserExit),
        _ => {}
    }

    state.any_package_executed = true;
    let exit_code = context
        .runner
        .run(&request)
        .await
        .map_err(|source| ExecuteError::Io {
            package: package_id.to_owned(),
            source,
        })?;

    let outcome = interpret(exit_code)?;
    context
        .callbacks
        .on_execute_package_complete(package_id, &outcome);
    record_outcome(state, outcome);
    state.executed_packages.push(package_id.to_owned());
    Ok(())
}

async fn run_execute_action(
    context: &ApplyContext,
    plan: &Plan,
    action: &ExecuteAction,
    syncpoints: &Syncpoints,
    state: &mut ExecuteState,
) -> Result<(), ApplyError> {
    match action {
        ExecuteAction::Checkpoint { id } => {
            state.last_checkpoint = *id;
            Ok(())
        }
        ExecuteAction::RollbackBoundary { boundary_id, vital } => {
            state.boundary = Some((boundary_id.clone(), *vital));
            Ok(())
        }
        ExecuteAction::WaitSyncpoint { package_id } => {
            let Some((_, rx)) = syncpoints.get(package_id) else {
                return Ok(());
            };
            let mut rx = rx.clone();
            let result = rx
                .wait_for(|s| *s != SyncpointState::Pending)
                .await
                .map(|state| state.clone());
            match result {
                Ok(SyncpointState::Cached) => Ok(()),
                Ok(SyncpointState::Failed { user_exit: true }) => Err(ApplyError::UserExit),
                Ok(SyncpointState::Failed { user_exit: false }) | Err(_) => {
                    Err(ApplyError::Cache {
                        package: package_id.clone(),
                        source: CacheError::Io(io::Error::other(
                            "package caching failed before execution",
                        )),
                    })
                }
                Ok(SyncpointState::Pending) => unreachable!(),
            }
        }
        ExecuteAction::Registration { keep } => {
            let bundle_provider = ember_bundle_types::manifest::DependencyProvider {
                key: context.manifest.registration.provider_key.clone(),
                version: Some(context.manifest.version),
                display_name: Some(context.manifest.registration.display_name.clone()),
                imported: false,
            };
            let bundle_id = &context.manifest.registration.bundle_id;
            if *keep {
                let session = SessionInfo {
                    registration: &context.manifest.registration,
                    version: context.manifest.version,
                    per_machine: plan.per_machine,
                    cache_path: &context.bundle_executable,
                    resume_command_line: &context.resume_command_line,
                    estimated_size: plan.estimated_size,
                    engine_version: &context.engine_version,
                };
                context.registration.begin_session(&session)?;
                context.registration.write_persisted_variables(
                    bundle_id,
                    plan.per_machine,
                    &context.variables,
                )?;
                if plan.dependency_registration
                    == crate::plan::DependencyRegistrationAction::Register
                {
                    context.registration.register_provider(
                        plan.per_machine,
                        &bundle_provider,
                        bundle_id,
                    )?;
                }
            } else {
                if plan.dependency_registration
                    != crate::plan::DependencyRegistrationAction::None
                {
                    // Covers both uninstall and the rollback of a fresh
                    // install. When another bundle owns the key by now this
                    // logs and leaves it registered.
                    context.registration.unregister_provider(
                        plan.per_machine,
                        &bundle_provider.key,
                        bundle_id,
                    )?;
                }
                context.registration.complete_session(
                    bundle_id,
                    plan.per_machine,
                    false,
                    state.restart != RestartState::None,
                )?;
            }
            Ok(())
        }
        ExecuteAction::PackageProvider {
            package_id,
            provider_key,
            action,
        } => {
            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let provider = package
                .providers
                .iter()
                .find(|p| &p.key == provider_key)
                .ok_or_else(|| ApplyError::PlanInvariant(provider_key.clone()))?;
            match action {
                ProviderAction::Register => {
                    context
                        .registration
                        .register_provider(package.per_machine, provider, package_id)?;
                }
                ProviderAction::Unregister => {
                    context.registration.unregister_provider(
                        package.per_machine,
                        provider_key,
                        package_id,
                    )?;
                }
            }
            Ok(())
        }
        ExecuteAction::PackageDependency {
            package_id,
            provider_key,
            action,
        } => {
            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let bundle_id = &context.manifest.registration.bundle_id;
            match action {
                ProviderAction::Register => {
                    context.registration.register_dependent(
                        package.per_machine,
                        provider_key,
                        bundle_id,
                    )?;
                }
                ProviderAction::Unregister => {
                    context.registration.unregister_dependent(
                        package.per_machine,
                        provider_key,
                        bundle_id,
                    )?;
                }
            }
            Ok(())
        }
        ExecuteAction::ExePackage { package_id, action } => {
            // A pseudo package (related bundle) carries its own command
            // line.
            if let Some(pseudo) = plan
                .pseudo_packages
                .iter()
                .find(|p| &p.bundle_id == package_id)
            {
                let request = pseudo.execution_request();
                return run_package_process(context, state, package_id, *action, request, |code| {
                    packages::default_exit_code_outcome(package_id, code)
                })
                .await;
            }

            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let exe = package
                .as_exe()
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let program = cached_payload_path(context, package_id)?;
            let request =
                packages::exe::build_request(package, exe, *action, &program, &context.variables);
            run_package_process(context, state, package_id, *action, request, |code| {
                packages::exe::interpret_exit_code(exe, package_id, code)
            })
            .await
        }
        ExecuteAction::MsiPackage {
            package_id,
            action,
            feature_actions,
            slipstream_patches,
        } => {
            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let msi = package
                .as_msi()
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let msi_path = cached_payload_path(context, package_id)?;

            let patch_paths: Vec<PathBuf> = slipstream_patches
                .iter()
                .filter(|patch| patch.action.is_active())
                .filter_map(|patch| cached_payload_path(context, &patch.msp_package_id).ok())
                .collect();

            let request = packages::msi::build_request(
                package,
                msi,
                *action,
                &msi_path,
                feature_actions,
                &patch_paths,
                &context.variables,
            );
            run_package_process(context, state, package_id, *action, request, |code| {
                packages::default_exit_code_outcome(package_id, code)
            })
            .await
        }
        ExecuteAction::MspTarget {
            package_id,
            action,
            target_product_code,
        } => {
            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let msp = package
                .as_msp()
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let msp_path = cached_payload_path(context, package_id)?;
            let request = packages::msp::build_request(
                package,
                msp,
                *action,
                &msp_path,
                target_product_code,
                &context.variables,
            );
            run_package_process(context, state, package_id, *action, request, |code| {
                packages::default_exit_code_outcome(package_id, code)
            })
            .await
        }
        ExecuteAction::MsuPackage { package_id, action } => {
            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            let PackageKind::Msu(msu) = &package.kind else {
                return Err(ApplyError::PlanInvariant(package_id.clone()));
            };
            let msu_path = cached_payload_path(context, package_id)?;
            let request = packages::msu::build_request(package, msu, *action, &msu_path);
            run_package_process(context, state, package_id, *action, request, |code| {
                packages::default_exit_code_outcome(package_id, code)
            })
            .await
        }
        ExecuteAction::CompatiblePackage {
            package_id,
            product_code,
        } => {
            let request = ExecutionRequest {
                package_id: package_id.clone(),
                program: "msiexec".to_owned(),
                arguments: vec![
                    "/x".to_owned(),
                    product_code.clone(),
                    "/qn".to_owned(),
                    "REBOOT=ReallySuppress".to_owned(),
                ],
            };
            run_package_process(
                context,
                state,
                package_id,
                ActionState::Uninstall,
                Some(request),
                |code| packages::default_exit_code_outcome(package_id, code),
            )
            .await
        }
        ExecuteAction::UncachePackage { package_id } => {
            let package = context
                .manifest
                .package(package_id)
                .ok_or_else(|| ApplyError::PlanInvariant(package_id.clone()))?;
            // Best effort; a busy cache folder must not fail the apply.
            if let Err(err) = context
                .cache
                .remove_package(package.per_machine, package_id, &package.cache_id)
                .await
            {
                tracing::warn!(package = %package_id, error = %err, "failed to remove package cache");
            }
            Ok(())
        }
    }
}

/// Runs the rollback prefix from the most recent boundary backwards. The
/// walk starts just before the in-flight package's checkpoint (the one
/// after the highest checkpoint reached), so the partial work of the failed
/// package and every completed package inside the boundary are both undone.
async fn rollback_from_checkpoint(context: &ApplyContext, plan: &Plan, state: &mut ExecuteState) {
    let rollback = &plan.rollback_actions;

    let in_flight = state.last_checkpoint + 1;
    let start = rollback
        .iter()
        .position(|entry| {
            !entry.deleted
                && matches!(&entry.action, ExecuteAction::Checkpoint { id } if *id == in_flight)
        })
        .map(|position| position.saturating_sub(1))
        .or_else(|| {
            rollback.iter().rposition(|entry| {
                !entry.deleted
                    && matches!(&entry.action, ExecuteAction::Checkpoint { id } if *id <= state.last_checkpoint)
            })
        });
    let Some(start) = start else {
        return;
    };

    for entry in rollback[..=start].iter().rev() {
        if entry.deleted {
            continue;
        }
        match &entry.action {
            // The enclosing boundary scopes the rollback.
            ExecuteAction::RollbackBoundary { boundary_id, .. } => {
                if state.boundary.as_ref().map(|(id, _)| id) == Some(boundary_id) {
                    break;
                }
            }
            action => {
                let mut rollback_state = ExecuteState {
                    last_checkpoint: 0,
                    boundary: None,
                    executed_packages: Vec::new(),
                    rolled_back_packages: Vec::new(),
                    restart: state.restart,
                    any_package_executed: true,
                };
                if let Err(err) = Box::pin(run_execute_action(
                    context,
                    plan,
                    action,
                    &HashMap::new(),
                    &mut rollback_state,
                ))
                .await
                {
                    // Rollback is best effort; the original error wins.
                    tracing::warn!(error = %err, "rollback action failed");
                }
                state
                    .rolled_back_packages
                    .extend(rollback_state.executed_packages);
            }
        }
    }

    // Remove caches of packages whose install was undone. Registration is
    // not touched here: the walked range carries the Registration{keep:false}
    // mirror when the failing boundary encloses the session begin, and a
    // failure behind a later boundary must leave the record of the packages
    // that stay installed.
    for entry in &plan.rollback_cache_actions {
        if entry.deleted {
            continue;
        }
        if let CacheAction::RollbackPackage { package_id } = &entry.action {
            if let Some(package) = context.manifest.package(package_id) {
                let _ = context
                    .cache
                    .remove_package(package.per_machine, package_id, &package.cache_id)
                    .await;
            }
        }
    }
}
