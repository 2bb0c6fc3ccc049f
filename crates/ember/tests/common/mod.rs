//! Shared fixtures: an in-memory host (machine, hive, recording process
//! runner) and an engine wired against temporary cache roots.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use ember::machine::MemoryMachine;
use ember::hive::MemoryHive;
use ember::packages::{ExecutionRequest, ProcessRunner};
use ember::Engine;
use ember_bundle_types::parse_manifest;
use ember_cache::{CacheEngine, CacheLocations, SourceSearch, WorkingFolder};
use ember_digest::{compute_bytes_digest, Sha1};

/// Records every execution and answers with configured exit codes
/// (default 0).
#[derive(Default)]
pub struct RecordingRunner {
    requests: Mutex<Vec<ExecutionRequest>>,
    exit_codes: Mutex<HashMap<String, i32>>,
}

impl RecordingRunner {
    pub fn set_exit_code(&self, package_id: &str, exit_code: i32) {
        self.exit_codes
            .lock()
            .insert(package_id.to_owned(), exit_code);
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn run(&self, request: &ExecutionRequest) -> io::Result<i32> {
        self.requests.lock().push(request.clone());
        Ok(self
            .exit_codes
            .lock()
            .get(&request.package_id)
            .copied()
            .unwrap_or(0))
    }
}

pub struct TestHost {
    pub temp: tempfile::TempDir,
    pub machine: Arc<MemoryMachine>,
    pub hive: Arc<MemoryHive>,
    pub runner: Arc<RecordingRunner>,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().unwrap(),
            machine: Arc::new(MemoryMachine::new()),
            hive: Arc::new(MemoryHive::new()),
            runner: Arc::new(RecordingRunner::default()),
        }
    }

    pub fn locations(&self) -> CacheLocations {
        CacheLocations::with_roots(
            self.temp.path().join("user-cache"),
            self.temp.path().join("machine-cache"),
        )
    }

    /// Writes `files` next to a dummy bundle executable and returns an
    /// engine whose local source search finds them.
    pub fn engine(&self, manifest_xml: &str, files: &[(&str, &[u8])]) -> Engine {
        self.engine_with(manifest_xml, files, |builder| builder)
    }

    pub fn engine_with(
        &self,
        manifest_xml: &str,
        files: &[(&str, &[u8])],
        customize: impl FnOnce(ember::EngineBuilder) -> ember::EngineBuilder,
    ) -> Engine {
        let bundle_dir = self.temp.path().join("bundle");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        let bundle_executable = bundle_dir.join("setup.exe");
        std::fs::write(&bundle_executable, b"bundle stub").unwrap();
        for (name, content) in files {
            std::fs::write(bundle_dir.join(name), content).unwrap();
        }

        let cache = CacheEngine::builder()
            .with_locations(self.locations())
            .with_working_folder(WorkingFolder::at(self.temp.path().join("working")))
            .with_source_search(SourceSearch {
                bundle_directory: Some(bundle_dir),
                last_used_source: None,
                layout_directory: None,
            })
            .finish();

        let manifest = Arc::new(parse_manifest(manifest_xml.as_bytes()).unwrap());
        let builder = Engine::builder(manifest)
            .with_machine(self.machine.clone())
            .with_hive(self.hive.clone())
            .with_cache(Arc::new(cache))
            .with_process_runner(self.runner.clone())
            .with_bundle_executable(bundle_executable);
        customize(builder).finish()
    }
}

/// Hex SHA-1 of the given bytes, for manifest hash attributes.
pub fn sha1_hex(bytes: &[u8]) -> String {
    format!("{:x}", compute_bytes_digest::<Sha1>(bytes))
}
