//! Planning: translates the requested bundle action and the detect result
//! into fully ordered cache and execute action lists, plus their rollback
//! mirrors.
//!
//! Planning is a pure function of (manifest, detection, requested states,
//! variables): it performs no I/O and is deterministic. Action lists grow in
//! place; finalization marks pruned actions deleted and produces compacted
//! lists with back-indices remapped.

mod cache_plan;
mod execute_plan;

use std::path::PathBuf;

use indexmap::IndexMap;
use thiserror::Error;

use ember_bundle_types::{
    manifest::BundleManifest, ActionState, BundleAction, FeatureAction, RequestState,
};
use ember_condition::ConditionError;

use crate::detect::Detection;
use crate::related::PseudoPackage;

/// Index of an action inside one plan list.
pub type ActionIndex = usize;

/// One cache-plan action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    /// Acquire a container into the working folder.
    AcquireContainer {
        /// The container to acquire.
        container_id: String,
        /// Skip this acquire until a downstream verification fails.
        skip_until_retried: bool,
    },
    /// Extract payloads from an acquired container.
    ExtractContainer {
        /// The container to extract from.
        container_id: String,
        /// The payloads to pull out, in extraction order.
        payload_ids: Vec<String>,
        /// Where to resume when extraction or verification fails.
        try_again: ActionIndex,
    },
    /// Acquire a loose payload into the working folder.
    AcquirePayload {
        /// The payload to acquire.
        payload_id: String,
        /// Skip this acquire until a downstream verification fails.
        skip_until_retried: bool,
    },
    /// Verify and place a payload into the completed package cache.
    CachePayload {
        /// The package whose cache receives the payload.
        package_id: String,
        /// The payload to place.
        payload_id: String,
        /// Move rather than copy out of the working folder.
        move_file: bool,
        /// Where to resume when verification fails.
        try_again: ActionIndex,
    },
    /// Verify and place a payload into the layout directory.
    LayoutPayload {
        /// The payload to place.
        payload_id: String,
        /// Move rather than copy out of the working folder.
        move_file: bool,
        /// Where to resume when verification fails.
        try_again: ActionIndex,
    },
    /// Place a container into the layout directory.
    LayoutContainer {
        /// The container to place.
        container_id: String,
        /// Move rather than copy out of the working folder.
        move_file: bool,
        /// Where to resume when verification fails.
        try_again: ActionIndex,
    },
    /// Copy the bundle executable itself into the layout directory.
    LayoutBundle,
    /// Marks the start of one package's cache actions.
    PackageStart {
        /// The package being cached.
        package_id: String,
        /// Index of the matching [`CacheAction::PackageStop`].
        complete_index: ActionIndex,
        /// Number of payloads cached for this package.
        payload_count: usize,
        /// Total bytes cached for this package.
        size: u64,
    },
    /// Marks the end of one package's cache actions.
    PackageStop {
        /// The package being cached.
        package_id: String,
    },
    /// Signal the execute worker that this package's payloads are cached.
    SignalSyncpoint {
        /// The package whose syncpoint fires.
        package_id: String,
    },
    /// A resume checkpoint in the cache plan.
    Checkpoint {
        /// The checkpoint id.
        id: u32,
    },
    /// Remove a package's cached payloads while rolling back.
    RollbackPackage {
        /// The package whose cache is removed.
        package_id: String,
    },
}

/// Whether a provider key is added or removed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProviderAction {
    /// Register the provider key.
    Register,
    /// Unregister the provider key.
    Unregister,
}

/// A patch applied as part of its target MSI's transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlipstreamPatch {
    /// The MSP package slipstreamed in.
    pub msp_package_id: String,
    /// The action for the patch within the MSI transaction.
    pub action: ActionState,
}

/// One execute- or rollback-plan action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteAction {
    /// A resume checkpoint; rollback resumes from the highest reached id.
    Checkpoint {
        /// The checkpoint id, matching between execute and rollback.
        id: u32,
    },
    /// Opens a rollback boundary.
    RollbackBoundary {
        /// The boundary id.
        boundary_id: String,
        /// A failure inside a vital boundary fails the whole apply.
        vital: bool,
    },
    /// Block until the package's cache syncpoint is signaled.
    WaitSyncpoint {
        /// The package whose syncpoint is awaited.
        package_id: String,
    },
    /// Remove a package's cached payloads.
    UncachePackage {
        /// The package whose cache is removed.
        package_id: String,
    },
    /// Register or unregister the bundle as a dependent on a package's
    /// provider key.
    PackageDependency {
        /// The package owning the provider.
        package_id: String,
        /// The provider key.
        provider_key: String,
        /// Add or remove.
        action: ProviderAction,
    },
    /// Register or unregister a package's own provider key.
    PackageProvider {
        /// The package owning the provider.
        package_id: String,
        /// The provider key.
        provider_key: String,
        /// Add or remove.
        action: ProviderAction,
    },
    /// Execute an EXE package (or a related-bundle pseudo package).
    ExePackage {
        /// The package to run.
        package_id: String,
        /// The resolved action.
        action: ActionState,
    },
    /// Execute an MSI package.
    MsiPackage {
        /// The package to run.
        package_id: String,
        /// The resolved action.
        action: ActionState,
        /// Per-feature actions.
        feature_actions: Vec<(String, FeatureAction)>,
        /// Patches applied within this MSI's transaction.
        slipstream_patches: Vec<SlipstreamPatch>,
    },
    /// Apply or remove an MSP package against one target product.
    MspTarget {
        /// The patch package.
        package_id: String,
        /// The resolved action.
        action: ActionState,
        /// The target product code.
        target_product_code: String,
    },
    /// Execute an OS update package.
    MsuPackage {
        /// The package to run.
        package_id: String,
        /// The resolved action.
        action: ActionState,
    },
    /// Write or remove the bundle's persisted registration.
    Registration {
        /// Keep (write) or discard (remove) the registration.
        keep: bool,
    },
    /// Uninstall the orphaned compatible product discovered through the
    /// provider key.
    CompatiblePackage {
        /// The package whose provider discovered the product.
        package_id: String,
        /// The orphaned product code to remove.
        product_code: String,
    },
}

/// One slot in a plan list. Pruned actions are marked deleted and swept at
/// finalize so indices stay stable while the plan grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry<T> {
    /// The action.
    pub action: T,
    /// Pruned by a later planning pass.
    pub deleted: bool,
}

impl<T> PlanEntry<T> {
    fn new(action: T) -> Self {
        Self {
            action,
            deleted: false,
        }
    }
}

/// Which registration writes this apply performs.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RegistrationOps {
    /// Cache the bundle executable into the completed bundle folder.
    pub cache_bundle: bool,
    /// Write (or remove) the persisted registration record.
    pub write_registration: bool,
    /// Refresh the estimated size in the registration record.
    pub update_size: bool,
}

/// Whether the bundle's own provider key is added or removed by this apply.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DependencyRegistrationAction {
    /// Leave the provider key alone.
    #[default]
    None,
    /// Register the bundle provider key.
    Register,
    /// Unregister the bundle provider key.
    Unregister,
}

/// The resolved plan states of one package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPackage {
    /// The state the host application requested.
    pub requested: RequestState,
    /// The action the execute plan performs.
    pub execute: ActionState,
    /// The action the rollback plan performs.
    pub rollback: ActionState,
    /// The package's payloads are cached by this plan.
    pub cache: bool,
    /// The package's cached payloads are removed after this apply.
    pub uncache: bool,
}

/// A planned dependent-key registration, mirrored into the execute plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedProvider {
    /// The package owning the provider key.
    pub package_id: String,
    /// The provider key.
    pub provider_key: String,
    /// Add or remove.
    pub action: ProviderAction,
}

/// An error produced during planning.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A package condition failed to parse.
    #[error("condition of package '{package}' failed to parse")]
    Condition {
        /// The package id.
        package: String,
        /// The parse failure.
        #[source]
        source: ConditionError,
    },

    /// Layout was requested without a layout directory.
    #[error("layout planning requires a layout directory")]
    LayoutDirectoryMissing,
}

/// The input to [`plan`].
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// The bundle action.
    pub action: BundleAction,
    /// Target directory for layout planning.
    pub layout_directory: Option<PathBuf>,
    /// Per-package request overrides from the host application.
    pub overrides: IndexMap<String, RequestState>,
    /// Ancestor bundle ids, for cycle breaking across related bundles.
    pub ancestors: Vec<String>,
    /// Provider keys whose dependency checks are suppressed.
    pub ignored_dependencies: Vec<String>,
}

impl PlanRequest {
    /// A request with no overrides.
    pub fn new(action: BundleAction) -> Self {
        Self {
            action,
            layout_directory: None,
            overrides: IndexMap::new(),
            ancestors: Vec::new(),
            ignored_dependencies: Vec::new(),
        }
    }
}

/// The product of planning: every list the apply phase walks.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The bundle action this plan implements.
    pub action: BundleAction,
    /// Any scheduled package is per-machine.
    pub per_machine: bool,
    /// Registration writes this apply performs.
    pub registration_ops: RegistrationOps,
    /// Bundle provider key disposition.
    pub dependency_registration: DependencyRegistrationAction,
    /// Ordered cache actions.
    pub cache_actions: Vec<PlanEntry<CacheAction>>,
    /// Cache removals performed while rolling back.
    pub rollback_cache_actions: Vec<PlanEntry<CacheAction>>,
    /// Ordered execute actions.
    pub execute_actions: Vec<PlanEntry<ExecuteAction>>,
    /// The rollback mirror of the execute list, applied in reverse.
    pub rollback_actions: Vec<PlanEntry<ExecuteAction>>,
    /// Cache removals performed after a successful apply.
    pub clean_actions: Vec<String>,
    /// Dependent-key registrations, mirroring the execute plan.
    pub registration_actions: Vec<PlannedProvider>,
    /// Resolved per-package states, in plan order.
    pub resolved: IndexMap<String, ResolvedPackage>,
    /// Pseudo packages fabricated for related bundles.
    pub pseudo_packages: Vec<PseudoPackage>,
    /// Target directory of layout actions.
    pub layout_directory: Option<PathBuf>,
    /// Uninstall was requested but dependents remain.
    pub disallow_removal: bool,
    /// Estimated installed size of everything scheduled.
    pub estimated_size: u64,
    /// Total bytes the cache plan moves.
    pub cache_size_total: u64,
    /// Total progress ticks across both workers.
    pub progress_ticks_total: u64,
    next_checkpoint: u32,
}

impl Plan {
    fn new(action: BundleAction) -> Self {
        Self {
            action,
            per_machine: false,
            registration_ops: RegistrationOps::default(),
            dependency_registration: DependencyRegistrationAction::default(),
            cache_actions: Vec::new(),
            rollback_cache_actions: Vec::new(),
            execute_actions: Vec::new(),
            rollback_actions: Vec::new(),
            clean_actions: Vec::new(),
            registration_actions: Vec::new(),
            resolved: IndexMap::new(),
            pseudo_packages: Vec::new(),
            layout_directory: None,
            disallow_removal: false,
            estimated_size: 0,
            cache_size_total: 0,
            progress_ticks_total: 0,
            next_checkpoint: 0,
        }
    }

    pub(crate) fn push_cache(&mut self, action: CacheAction) -> ActionIndex {
        self.cache_actions.push(PlanEntry::new(action));
        self.cache_actions.len() - 1
    }

    pub(crate) fn push_execute(&mut self, action: ExecuteAction) -> ActionIndex {
        self.execute_actions.push(PlanEntry::new(action));
        self.execute_actions.len() - 1
    }

    pub(crate) fn push_rollback(&mut self, action: ExecuteAction) -> ActionIndex {
        self.rollback_actions.push(PlanEntry::new(action));
        self.rollback_actions.len() - 1
    }

    pub(crate) fn next_checkpoint_id(&mut self) -> u32 {
        self.next_checkpoint += 1;
        self.next_checkpoint
    }

    /// The live (non-deleted) execute actions.
    pub fn live_execute_actions(&self) -> impl Iterator<Item = &ExecuteAction> {
        self.execute_actions
            .iter()
            .filter(|entry| !entry.deleted)
            .map(|entry| &entry.action)
    }

    /// The live (non-deleted) cache actions.
    pub fn live_cache_actions(&self) -> impl Iterator<Item = &CacheAction> {
        self.cache_actions
            .iter()
            .filter(|entry| !entry.deleted)
            .map(|entry| &entry.action)
    }

    /// Sweeps deleted actions and remaps every back-index onto the
    /// compacted lists. Indices of surviving actions stay ordered.
    pub fn finalize(&mut self) {
        // Map old cache indices to new positions.
        let mut remap = vec![usize::MAX; self.cache_actions.len()];
        let mut next = 0usize;
        for (old, entry) in self.cache_actions.iter().enumerate() {
            if !entry.deleted {
                remap[old] = next;
                next += 1;
            }
        }

        self.cache_actions.retain(|entry| !entry.deleted);
        for entry in &mut self.cache_actions {
            match &mut entry.action {
                CacheAction::ExtractContainer { try_again, .. }
                | CacheAction::CachePayload { try_again, .. }
                | CacheAction::LayoutPayload { try_again, .. }
                | CacheAction::LayoutContainer { try_again, .. } => {
                    *try_again = remap[*try_again];
                }
                CacheAction::PackageStart { complete_index, .. } => {
                    *complete_index = remap[*complete_index];
                }
                _ => {}
            }
        }

        self.execute_actions.retain(|entry| !entry.deleted);
        self.rollback_actions.retain(|entry| !entry.deleted);
        self.rollback_cache_actions.retain(|entry| !entry.deleted);
    }
}

/// Builds the plan. Pure in (manifest, detection, requested states,
/// variables); see the module documentation.
pub fn plan(
    manifest: &BundleManifest,
    detection: &Detection,
    variables: &ember_bundle_types::Variables,
    request: &PlanRequest,
) -> Result<Plan, PlanError> {
    let mut plan = Plan::new(request.action);

    if request.action == BundleAction::Layout {
        let layout_directory = request
            .layout_directory
            .clone()
            .ok_or(PlanError::LayoutDirectoryMissing)?;
        tracing::info!(directory = %layout_directory.display(), "planning layout");
        plan.layout_directory = Some(layout_directory);
        cache_plan::plan_layout(&mut plan, manifest);
        return Ok(plan);
    }

    // An uninstall is blocked while other bundles depend on us; everything
    // is skipped and the registration stays.
    if request.action == BundleAction::Uninstall && !detection.dependents.is_empty() {
        plan.disallow_removal = true;
        tracing::info!(
            dependents = detection.dependents.len(),
            "uninstall skipped due to dependents"
        );
    }

    execute_plan::resolve_package_states(&mut plan, manifest, detection, variables, request)?;

    cache_plan::plan_package_caching(&mut plan, manifest, detection);

    execute_plan::plan_execute_actions(&mut plan, manifest, detection, variables, request);

    execute_plan::plan_related_bundles(&mut plan, manifest, detection, request);

    execute_plan::finalize_slipstream_patches(&mut plan, manifest);

    execute_plan::plan_registration_ops(&mut plan, detection);

    plan.finalize();

    tracing::info!(
        cache_actions = plan.cache_actions.len(),
        execute_actions = plan.execute_actions.len(),
        per_machine = plan.per_machine,
        "plan complete"
    );
    Ok(plan)
}
