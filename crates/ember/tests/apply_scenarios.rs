//! End-to-end apply scenarios over the in-memory host: fresh install with
//! registration, cancel during cache, verification retry exhaustion,
//! Authenticode gating, restart recording, and boundary-scoped rollback.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;

use ember::apply::{ApplyError, HostCallbacks, RestartState};
use ember::plan::PlanRequest;
use ember::Engine;
use ember_bundle_types::{parse_manifest, BundleAction, ResumeType};
use ember_cache::{
    CacheEngine, CacheError, CacheLocations, CacheProgress, ChainCertificate, ProgressResult,
    RevocationMode, SignatureBackend, SignatureBackendError, SourceSearch, VerificationError,
    WorkingFolder,
};

use common::{sha1_hex, TestHost};

fn exe_manifest(payload_hash: &str) -> String {
    format!(
        r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{{BUNDLE-1}}" DisplayName="Test Bundle" ProviderKey="test.bundle" />
  <Payload Id="exeA" FilePath="app.exe" Hash="{payload_hash}" Size="9" />
  <RollbackBoundary Id="bnd0" Vital="yes" />
  <Chain>
    <ExePackage Id="pkgA" DetectCondition="pkgAInstalled" InstallArguments="/install /quiet"
                UninstallArguments="/uninstall /quiet" RollbackBoundaryForward="bnd0">
      <PayloadRef Id="exeA" />
      <Provides Key="app.provider" />
    </ExePackage>
  </Chain>
</BundleManifest>"#
    )
}

async fn plan_and_apply(
    engine: &mut Engine,
    action: BundleAction,
) -> Result<ember::ApplyResult, ember::EngineError> {
    let detection = engine.detect()?;
    let plan = engine.plan(&detection, &PlanRequest::new(action))?;
    engine.apply(&plan).await
}

#[tokio::test]
async fn fresh_install_applies_and_registers() {
    let host = TestHost::new();
    let manifest = exe_manifest(&sha1_hex(b"exe bytes"));
    let mut engine = host.engine(&manifest, &[("app.exe", b"exe bytes")]);

    let result = plan_and_apply(&mut engine, BundleAction::Install)
        .await
        .unwrap();

    assert_eq!(result.restart, RestartState::None);
    assert_eq!(result.executed_packages, vec!["pkgA".to_owned()]);

    // The package executed from its cached location with the authored
    // arguments.
    let requests = host.runner.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].program.ends_with("app.exe"));
    assert!(requests[0].program.contains("user-cache"));
    assert_eq!(requests[0].arguments, vec!["/install", "/quiet"]);

    // Registration landed and the session settled into the installed state.
    let state = engine.registration().read_state("{BUNDLE-1}", false);
    assert_eq!(state.resume, ResumeType::Arp);
    assert!(state.installed);

    // The bundle is a dependent on its package's provider key.
    assert_eq!(
        engine.registration().dependents(false, "app.provider", &[]),
        vec!["{BUNDLE-1}".to_owned()]
    );
}

#[tokio::test]
async fn uninstall_removes_registration() {
    let host = TestHost::new();
    let manifest = exe_manifest(&sha1_hex(b"exe bytes"));
    let mut engine = host.engine(&manifest, &[("app.exe", b"exe bytes")]);

    plan_and_apply(&mut engine, BundleAction::Install)
        .await
        .unwrap();

    // The detect condition reports the package present now.
    engine.variables_mut().set_numeric("pkgAInstalled", 1);
    plan_and_apply(&mut engine, BundleAction::Uninstall)
        .await
        .unwrap();

    let state = engine.registration().read_state("{BUNDLE-1}", false);
    assert_eq!(state.resume, ResumeType::None);
    assert!(!state.installed);
    assert_eq!(
        engine.registration().provider_owner(false, "test.bundle"),
        None
    );

    let requests = host.runner.requests();
    assert_eq!(requests.last().unwrap().arguments, vec!["/uninstall", "/quiet"]);
}

struct CancelDuringCache;

impl HostCallbacks for CancelDuringCache {
    fn on_cache_progress(&self, _progress: CacheProgress<'_>) -> ProgressResult {
        ProgressResult::Cancel
    }
}

#[tokio::test]
async fn cancel_during_cache_is_user_exit() {
    let host = TestHost::new();
    let manifest = exe_manifest(&sha1_hex(b"exe bytes"));
    let mut engine = host.engine_with(&manifest, &[("app.exe", b"exe bytes")], |builder| {
        builder.with_callbacks(Arc::new(CancelDuringCache))
    });

    let detection = engine.detect().unwrap();
    let plan = engine
        .plan(&detection, &PlanRequest::new(BundleAction::Install))
        .unwrap();
    let result = engine.apply(&plan).await;

    assert_matches!(
        result,
        Err(ember::EngineError::Apply(ApplyError::UserExit))
    );
    // No execute action ran.
    assert!(host.runner.requests().is_empty());
    // Neither a staged nor a partial working file survives.
    assert!(!host
        .temp
        .path()
        .join("user-cache/.unverified/exeA")
        .exists());
    assert!(!host.temp.path().join("working/exeA").exists());
}

struct CountingCallbacks {
    cache_transfers: AtomicU32,
}

impl HostCallbacks for CountingCallbacks {
    fn on_cache_progress(&self, _progress: CacheProgress<'_>) -> ProgressResult {
        self.cache_transfers.fetch_add(1, Ordering::SeqCst);
        ProgressResult::Continue
    }
}

#[tokio::test]
async fn verification_failure_retries_acquire_once() {
    let host = TestHost::new();
    // Manifest hash disagrees with the file on disk, so every verification
    // fails.
    let manifest = exe_manifest(&sha1_hex(b"different bytes"));
    let callbacks = Arc::new(CountingCallbacks {
        cache_transfers: AtomicU32::new(0),
    });
    let mut engine = host.engine_with(&manifest, &[("app.exe", b"exe bytes")], {
        let callbacks = Arc::clone(&callbacks);
        move |builder| builder.with_callbacks(callbacks)
    });

    let result = plan_and_apply(&mut engine, BundleAction::Install).await;

    assert_matches!(
        result,
        Err(ember::EngineError::Apply(ApplyError::Cache {
            source: CacheError::Verify(VerificationError::HashMismatch { .. }),
            ..
        }))
    );
    // The acquire ran twice: the initial attempt and one retry.
    assert_eq!(callbacks.cache_transfers.load(Ordering::SeqCst), 2);
    assert!(host.runner.requests().is_empty());
}

struct MismatchedChainBackend {
    calls: AtomicU32,
}

#[async_trait]
impl SignatureBackend for MismatchedChainBackend {
    async fn signer_chain(
        &self,
        _path: &Path,
        _revocation: RevocationMode,
    ) -> Result<Vec<ChainCertificate>, SignatureBackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ChainCertificate {
            public_key_id: "0000".to_owned(),
            thumbprint: "1111".to_owned(),
        }])
    }

    async fn verify_catalog(
        &self,
        _catalog: &Path,
        _file: &Path,
        _revocation: RevocationMode,
    ) -> Result<(), SignatureBackendError> {
        Err(SignatureBackendError::NotSigned)
    }
}

#[tokio::test]
async fn authenticode_gated_payload_fails_after_one_retry() {
    let host = TestHost::new();
    let manifest = format!(
        r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{{BUNDLE-1}}" DisplayName="Test Bundle" ProviderKey="test.bundle" />
  <Payload Id="exeA" FilePath="app.exe" Size="9"
           CertificateRootPublicKeyIdentifier="AABB" />
  <Chain>
    <ExePackage Id="pkgA" DetectCondition="pkgAInstalled" InstallArguments="/i">
      <PayloadRef Id="exeA" />
    </ExePackage>
  </Chain>
</BundleManifest>"#
    );

    let bundle_dir = host.temp.path().join("bundle");
    std::fs::create_dir_all(&bundle_dir).unwrap();
    std::fs::write(bundle_dir.join("app.exe"), b"exe bytes").unwrap();
    let bundle_executable = bundle_dir.join("setup.exe");
    std::fs::write(&bundle_executable, b"stub").unwrap();

    let backend = Arc::new(MismatchedChainBackend {
        calls: AtomicU32::new(0),
    });
    let cache = CacheEngine::builder()
        .with_locations(host.locations())
        .with_working_folder(WorkingFolder::at(host.temp.path().join("working")))
        .with_source_search(SourceSearch {
            bundle_directory: Some(bundle_dir),
            last_used_source: None,
            layout_directory: None,
        })
        .with_signature_backend(backend.clone())
        .finish();

    let mut engine = Engine::builder(Arc::new(parse_manifest(manifest.as_bytes()).unwrap()))
        .with_machine(host.machine.clone())
        .with_hive(host.hive.clone())
        .with_cache(Arc::new(cache))
        .with_process_runner(host.runner.clone())
        .with_bundle_executable(bundle_executable)
        .finish();

    let result = plan_and_apply(&mut engine, BundleAction::Install).await;
    assert_matches!(
        result,
        Err(ember::EngineError::Apply(ApplyError::Cache {
            source: CacheError::Verify(VerificationError::CertificateMismatch { .. }),
            ..
        }))
    );
    // One verification per acquire: the initial attempt and one retry.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
}

fn two_package_manifest(second_boundary_vital: &str) -> String {
    format!(
        r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{{BUNDLE-1}}" DisplayName="Test Bundle" ProviderKey="test.bundle" />
  <Payload Id="exe1" FilePath="one.exe" Hash="{h1}" Size="3" />
  <Payload Id="exe2" FilePath="two.exe" Hash="{h2}" Size="3" />
  <RollbackBoundary Id="bndA" Vital="yes" />
  <RollbackBoundary Id="bndB" Vital="{second_boundary_vital}" />
  <Chain>
    <ExePackage Id="pkg1" DetectCondition="pkg1Installed" InstallArguments="/i1"
                UninstallArguments="/x1" RollbackBoundaryForward="bndA">
      <PayloadRef Id="exe1" />
    </ExePackage>
    <ExePackage Id="pkg2" DetectCondition="pkg2Installed" InstallArguments="/i2"
                UninstallArguments="/x2" RollbackBoundaryForward="bndB">
      <PayloadRef Id="exe2" />
    </ExePackage>
  </Chain>
</BundleManifest>"#,
        h1 = sha1_hex(b"one"),
        h2 = sha1_hex(b"two"),
    )
}

#[tokio::test]
async fn failure_in_vital_boundary_rolls_back_and_fails() {
    let host = TestHost::new();
    let manifest = two_package_manifest("yes");
    let mut engine = host.engine(&manifest, &[("one.exe", b"one"), ("two.exe", b"two")]);
    host.runner.set_exit_code("pkg2", 1603);

    let result = plan_and_apply(&mut engine, BundleAction::Install).await;
    assert_matches!(result, Err(ember::EngineError::Apply(ApplyError::Execute(_))));

    // pkg2 failed inside its own (vital) boundary; its rollback ran, and
    // pkg1 behind the earlier boundary stayed put.
    let arguments: Vec<Vec<String>> = host
        .runner
        .requests()
        .into_iter()
        .map(|r| r.arguments)
        .collect();
    assert_eq!(
        arguments,
        vec![
            vec!["/i1".to_owned()],
            vec!["/i2".to_owned()],
            vec!["/x2".to_owned()],
        ]
    );

    // pkg1 is still installed, so the registration record must survive;
    // only the resume value betrays the interrupted apply.
    let state = engine.registration().read_state("{BUNDLE-1}", false);
    assert_eq!(state.resume, ResumeType::Interrupted);
}

#[tokio::test]
async fn failure_in_non_vital_boundary_continues() {
    let host = TestHost::new();
    let manifest = two_package_manifest("no");
    let mut engine = host.engine(&manifest, &[("one.exe", b"one"), ("two.exe", b"two")]);
    host.runner.set_exit_code("pkg2", 1603);

    let result = plan_and_apply(&mut engine, BundleAction::Install)
        .await
        .unwrap();

    // pkg1 succeeded and the apply finished despite pkg2's failure.
    assert_eq!(result.executed_packages, vec!["pkg1".to_owned()]);

    // pkg2's rollback was attempted (and recorded) before continuing.
    let arguments: Vec<Vec<String>> = host
        .runner
        .requests()
        .into_iter()
        .map(|r| r.arguments)
        .collect();
    assert_eq!(
        arguments,
        vec![
            vec!["/i1".to_owned()],
            vec!["/i2".to_owned()],
            vec!["/x2".to_owned()],
        ]
    );
}

#[tokio::test]
async fn parallel_cache_reaches_the_same_outcome() {
    let host = TestHost::new();
    let manifest = two_package_manifest("yes").replace("<Chain>", r#"<Chain ParallelCache="yes">"#);
    let mut engine = host.engine(&manifest, &[("one.exe", b"one"), ("two.exe", b"two")]);

    let result = plan_and_apply(&mut engine, BundleAction::Install)
        .await
        .unwrap();

    // The execute worker waited on each package's syncpoint, so both ran
    // in chain order even with caching concurrent.
    assert_eq!(
        result.executed_packages,
        vec!["pkg1".to_owned(), "pkg2".to_owned()]
    );
    assert!(host
        .temp
        .path()
        .join("user-cache/pkg1/one.exe")
        .is_file());
    assert!(host
        .temp
        .path()
        .join("user-cache/pkg2/two.exe")
        .is_file());
}

#[tokio::test]
async fn restart_required_is_recorded_and_armed() {
    let host = TestHost::new();
    let manifest = exe_manifest(&sha1_hex(b"exe bytes"));
    let mut engine = host.engine(&manifest, &[("app.exe", b"exe bytes")]);
    host.runner.set_exit_code("pkgA", 3010);

    let result = plan_and_apply(&mut engine, BundleAction::Install)
        .await
        .unwrap();
    assert_eq!(result.restart, RestartState::Required);

    // The volatile reboot marker wins over the persisted resume value.
    let state = engine.registration().read_state("{BUNDLE-1}", false);
    assert_eq!(state.resume, ResumeType::RebootPending);
}
