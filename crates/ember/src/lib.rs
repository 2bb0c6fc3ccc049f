#![deny(missing_docs)]

//! The bundle bootstrapper engine: detects which packages of a bundle are
//! already on the machine, plans an ordered sequence of cache and
//! execute/rollback actions for a requested action, and applies the plan
//! with per-package syncpoints and boundary-scoped rollback.
//!
//! The flow is `manifest → detect → plan → apply`:
//!
//! - [`detect::detect`] reconciles on-machine state (installed products,
//!   related bundles, feature states, cache completeness) with the
//!   manifest, reading through the [`machine::MachineInspector`] and
//!   [`hive::Hive`] seams;
//! - [`plan::plan`] is a pure function of the manifest, the detection and
//!   the requested per-package states, producing the cache plan, execute
//!   plan and their rollback mirrors;
//! - [`apply::apply`] drives the cache and execute workers, pairing them
//!   through per-package syncpoints and rolling back from the most recent
//!   boundary on failure.
//!
//! OS specifics (the registry, Windows Installer queries, Authenticode,
//! ACLs, container formats, process spawning and the elevation pipe
//! transport) all sit behind traits, with in-memory implementations used
//! by tests and non-Windows hosts.

pub mod apply;
pub mod cli;
pub mod detect;
pub mod embedded;
pub mod hive;
pub mod machine;
pub mod packages;
pub mod pipe;
pub mod plan;
pub mod registration;
pub mod related;
pub mod search;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use ember_bundle_types::{manifest::BundleManifest, BundleAction, Variables};
use ember_cache::CacheEngine;

pub use apply::{ApplyContext, ApplyError, ApplyResult, HostCallbacks, RestartState};
pub use detect::{DetectError, Detection};
pub use plan::{Plan, PlanError, PlanRequest};

/// The engine version written into registration records.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An error from the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Detect failed.
    #[error(transparent)]
    Detect(#[from] DetectError),

    /// Planning failed.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Apply failed.
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Wires the manifest, the variable store and every backend seam together
/// and exposes the detect/plan/apply flow. Hosts that need finer control
/// call the phase modules directly.
pub struct Engine {
    manifest: Arc<BundleManifest>,
    variables: Variables,
    machine: Arc<dyn machine::MachineInspector>,
    hive: Arc<dyn hive::Hive>,
    registration: registration::RegistrationStore,
    cache: Arc<CacheEngine>,
    runner: Arc<dyn packages::ProcessRunner>,
    extractor: Arc<dyn apply::ContainerExtractor>,
    callbacks: Arc<dyn HostCallbacks>,
    bundle_executable: PathBuf,
    ignored_dependencies: Vec<String>,
}

/// Configures an [`Engine`].
pub struct EngineBuilder {
    manifest: Arc<BundleManifest>,
    machine: Option<Arc<dyn machine::MachineInspector>>,
    hive: Option<Arc<dyn hive::Hive>>,
    cache: Option<Arc<CacheEngine>>,
    runner: Option<Arc<dyn packages::ProcessRunner>>,
    extractor: Option<Arc<dyn apply::ContainerExtractor>>,
    callbacks: Option<Arc<dyn HostCallbacks>>,
    bundle_executable: Option<PathBuf>,
    ignored_dependencies: Vec<String>,
}

impl EngineBuilder {
    /// Sets the machine inspector. Defaults to an empty in-memory machine.
    pub fn with_machine(mut self, machine: Arc<dyn machine::MachineInspector>) -> Self {
        self.machine = Some(machine);
        self
    }

    /// Sets the registration hive. Defaults to an in-memory hive.
    pub fn with_hive(mut self, hive: Arc<dyn hive::Hive>) -> Self {
        self.hive = Some(hive);
        self
    }

    /// Sets the cache engine. Defaults to system cache locations with the
    /// no-op backends.
    pub fn with_cache(mut self, cache: Arc<CacheEngine>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the process runner. Defaults to spawning real processes.
    pub fn with_process_runner(mut self, runner: Arc<dyn packages::ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Sets the container extractor. Defaults to unsupported.
    pub fn with_container_extractor(
        mut self,
        extractor: Arc<dyn apply::ContainerExtractor>,
    ) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Sets the host application callbacks. Defaults to a silent host.
    pub fn with_callbacks(mut self, callbacks: Arc<dyn HostCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Sets the path of the running bundle executable.
    pub fn with_bundle_executable(mut self, path: PathBuf) -> Self {
        self.bundle_executable = Some(path);
        self
    }

    /// Suppresses dependency checks for the given provider keys.
    pub fn with_ignored_dependencies(mut self, keys: Vec<String>) -> Self {
        self.ignored_dependencies = keys;
        self
    }

    /// Builds the engine and seeds the variable store: the engine
    /// built-ins first, then the manifest's variable declarations.
    pub fn finish(self) -> Engine {
        let manifest = self.manifest;
        let bundle_executable = self
            .bundle_executable
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_default();

        let mut variables = Variables::new();
        variables.set_string("BundleName", &manifest.registration.display_name);
        variables.set_version("BundleVersion", manifest.version);
        variables.set_string("BundleProviderKey", &manifest.registration.provider_key);
        if let Some(directory) = bundle_executable.parent() {
            variables.set_string("BundleSourceDirectory", directory.display().to_string());
        }
        variables.set_numeric("BundleElevated", 0);
        variables.set_numeric("RebootPending", 0);
        for declaration in &manifest.variables {
            variables.set_with_flags(
                &declaration.name,
                declaration.value.clone(),
                declaration.hidden,
                declaration.persisted,
            );
        }

        let hive = self
            .hive
            .unwrap_or_else(|| Arc::new(hive::MemoryHive::new()));
        Engine {
            registration: registration::RegistrationStore::new(Arc::clone(&hive)),
            machine: self
                .machine
                .unwrap_or_else(|| Arc::new(machine::MemoryMachine::new())),
            hive,
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(CacheEngine::builder().finish())),
            runner: self
                .runner
                .unwrap_or_else(|| Arc::new(packages::SystemProcessRunner)),
            extractor: self
                .extractor
                .unwrap_or_else(|| Arc::new(apply::UnsupportedExtractor)),
            callbacks: self
                .callbacks
                .unwrap_or_else(|| Arc::new(apply::NoopCallbacks)),
            manifest,
            variables,
            bundle_executable,
            ignored_dependencies: self.ignored_dependencies,
        }
    }
}

impl Engine {
    /// Starts configuring an engine for a manifest.
    pub fn builder(manifest: Arc<BundleManifest>) -> EngineBuilder {
        EngineBuilder {
            manifest,
            machine: None,
            hive: None,
            cache: None,
            runner: None,
            extractor: None,
            callbacks: None,
            bundle_executable: None,
            ignored_dependencies: Vec::new(),
        }
    }

    /// The manifest the engine runs.
    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// The variable store.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Mutable access to the variable store, for host overrides before
    /// planning.
    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    /// Runs the manifest's searches, populating variables from machine
    /// state.
    pub fn run_searches(&mut self) {
        search::run_searches(
            &self.manifest.searches,
            &mut self.variables,
            self.machine.as_ref(),
            self.hive.as_ref(),
        );
    }

    /// Runs detection. Variables persisted by a previous session are
    /// restored first so detect conditions see them.
    pub fn detect(&mut self) -> Result<Detection, EngineError> {
        let per_machine = self.manifest.chain.iter().any(|p| p.per_machine);
        self.registration.read_persisted_variables(
            &self.manifest.registration.bundle_id,
            per_machine,
            &mut self.variables,
        );
        let detection = detect::detect(
            &self.manifest,
            &mut self.variables,
            self.machine.as_ref(),
            &self.registration,
            self.cache.locations(),
            &self.ignored_dependencies,
        )?;
        Ok(detection)
    }

    /// Builds the plan for a request against a detection. The action and
    /// layout directory become visible to conditions through the
    /// `BundleAction` and `BundleLayoutDirectory` variables.
    pub fn plan(
        &mut self,
        detection: &Detection,
        request: &PlanRequest,
    ) -> Result<Plan, EngineError> {
        self.variables
            .set_numeric("BundleAction", request.action as i64);
        if let Some(layout_directory) = &request.layout_directory {
            self.variables
                .set_string("BundleLayoutDirectory", layout_directory.display().to_string());
        }
        Ok(plan::plan(&self.manifest, detection, &self.variables, request)?)
    }

    /// Applies a plan.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyResult, EngineError> {
        let resume_command_line = match plan.action {
            BundleAction::Uninstall => "-uninstall -quiet -runonce".to_owned(),
            _ => "-quiet -runonce".to_owned(),
        };
        let context = ApplyContext {
            manifest: Arc::clone(&self.manifest),
            cache: Arc::clone(&self.cache),
            registration: self.registration.clone(),
            runner: Arc::clone(&self.runner),
            extractor: Arc::clone(&self.extractor),
            callbacks: Arc::clone(&self.callbacks),
            // The apply workers share a read-only snapshot; the live store
            // stays with the engine for the next plan round.
            variables: Arc::new(self.variables.snapshot()),
            bundle_executable: self.bundle_executable.clone(),
            resume_command_line,
            engine_version: ENGINE_VERSION.to_owned(),
        };
        Ok(apply::apply(&context, plan).await?)
    }

    /// The registration store, for hosts inspecting persisted state.
    pub fn registration(&self) -> &registration::RegistrationStore {
        &self.registration
    }
}
