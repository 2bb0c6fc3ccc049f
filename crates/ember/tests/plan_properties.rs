//! Planner properties: determinism, rollback correspondence, at-most-once
//! moves, try-again back-pointers, boundary symmetry, and the end-to-end
//! plan shapes for fresh install, minor upgrade, blocked uninstall and
//! slipstream finalization.

mod common;

use ember::plan::{CacheAction, ExecuteAction, PlanRequest, ProviderAction};
use ember::machine::InstalledProduct;
use ember_bundle_types::{ActionState, BundleAction, BundleVersion};

use common::{sha1_hex, TestHost};

fn single_msi_manifest(version: &str) -> String {
    format!(
        r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{{BUNDLE-1}}" DisplayName="Test Bundle" ProviderKey="test.bundle" />
  <Container Id="cab1" FilePath="bundle.cab" Size="100"
             Hash="{cab_hash}" />
  <Payload Id="msiA" FilePath="a.msi" Packaging="embedded" Container="cab1"
           Hash="{msi_hash}" Size="10" />
  <RollbackBoundary Id="bnd0" Vital="yes" />
  <Chain>
    <MsiPackage Id="pkgA" ProductCode="{{P1}}" Version="{version}" CacheId="pkgA-v1"
                UpgradeCode="{{UC-1}}" RollbackBoundaryForward="bnd0" InstallSize="4096">
      <PayloadRef Id="msiA" />
      <Provides Key="product.key" Version="{version}" />
    </MsiPackage>
  </Chain>
</BundleManifest>"#,
        cab_hash = sha1_hex(b"cab bytes"),
        msi_hash = sha1_hex(b"msi bytes"),
    )
}

fn plan_install(host: &TestHost, manifest: &str) -> ember::Plan {
    let mut engine = host.engine(manifest, &[]);
    let detection = engine.detect().unwrap();
    engine
        .plan(&detection, &PlanRequest::new(BundleAction::Install))
        .unwrap()
}

#[test]
fn fresh_install_plan_shape() {
    let host = TestHost::new();
    let plan = plan_install(&host, &single_msi_manifest("1.0.0.0"));

    // Cache plan: the package span wraps acquire, extract and placement,
    // then signals the execute worker.
    let cache: Vec<&CacheAction> = plan.live_cache_actions().collect();
    assert!(matches!(cache[0], CacheAction::PackageStart { package_id, payload_count: 1, .. } if package_id == "pkgA"));
    assert!(matches!(cache[1], CacheAction::AcquireContainer { container_id, skip_until_retried: false } if container_id == "cab1"));
    assert!(matches!(cache[2], CacheAction::ExtractContainer { container_id, payload_ids, .. }
        if container_id == "cab1" && payload_ids == &vec!["msiA".to_owned()]));
    assert!(matches!(cache[3], CacheAction::CachePayload { payload_id, move_file: true, .. } if payload_id == "msiA"));
    assert!(matches!(cache[4], CacheAction::PackageStop { .. }));
    assert!(matches!(cache[5], CacheAction::SignalSyncpoint { package_id } if package_id == "pkgA"));
    assert_eq!(cache.len(), 6);

    // Execute plan: boundary, syncpoint wait, registration, dependency
    // bookkeeping, the install itself, and its checkpoint.
    let execute: Vec<&ExecuteAction> = plan.live_execute_actions().collect();
    assert!(matches!(execute[0], ExecuteAction::RollbackBoundary { boundary_id, vital: true } if boundary_id == "bnd0"));
    assert!(matches!(execute[1], ExecuteAction::WaitSyncpoint { package_id } if package_id == "pkgA"));
    assert!(matches!(execute[2], ExecuteAction::Registration { keep: true }));
    assert!(matches!(execute[3], ExecuteAction::PackageProvider { action: ProviderAction::Register, .. }));
    assert!(matches!(execute[4], ExecuteAction::PackageDependency { action: ProviderAction::Register, .. }));
    assert!(matches!(execute[5], ExecuteAction::MsiPackage { package_id, action: ActionState::Install, .. } if package_id == "pkgA"));
    assert!(matches!(execute[6], ExecuteAction::Checkpoint { id: 1 }));

    // The rollback plan mirrors the execute plan with inverse operations.
    let rollback: Vec<&ExecuteAction> = plan
        .rollback_actions
        .iter()
        .filter(|e| !e.deleted)
        .map(|e| &e.action)
        .collect();
    assert!(matches!(rollback[0], ExecuteAction::RollbackBoundary { boundary_id, .. } if boundary_id == "bnd0"));
    assert!(matches!(rollback[1], ExecuteAction::Registration { keep: false }));
    assert!(matches!(rollback[2], ExecuteAction::PackageProvider { action: ProviderAction::Unregister, .. }));
    assert!(matches!(rollback[3], ExecuteAction::PackageDependency { action: ProviderAction::Unregister, .. }));
    assert!(matches!(rollback[4], ExecuteAction::MsiPackage { action: ActionState::Uninstall, .. }));
    assert!(matches!(rollback[5], ExecuteAction::Checkpoint { id: 1 }));

    assert_eq!(plan.estimated_size, 4096);
    assert!(!plan.per_machine);
}

#[test]
fn planning_is_deterministic() {
    let host = TestHost::new();
    let manifest = single_msi_manifest("1.0.0.0");

    let first = plan_install(&host, &manifest);
    let second = plan_install(&host, &manifest);

    assert_eq!(first.cache_actions, second.cache_actions);
    assert_eq!(first.execute_actions, second.execute_actions);
    assert_eq!(first.rollback_actions, second.rollback_actions);
    assert_eq!(first.resolved, second.resolved);
}

#[test]
fn rollback_corresponds_to_execute() {
    let host = TestHost::new();
    let plan = plan_install(&host, &single_msi_manifest("1.0.0.0"));

    for action in plan.live_execute_actions() {
        let ExecuteAction::MsiPackage {
            package_id,
            action: execute_state,
            ..
        } = action
        else {
            continue;
        };
        assert!(execute_state.is_active());
        // The mirror exists with the reverse operation.
        assert!(plan.rollback_actions.iter().any(|entry| matches!(
            &entry.action,
            ExecuteAction::MsiPackage { package_id: mirror, action: ActionState::Uninstall, .. }
            if mirror == package_id
        )));
    }
}

#[test]
fn try_again_points_at_earlier_acquire() {
    let host = TestHost::new();
    let plan = plan_install(&host, &single_msi_manifest("1.0.0.0"));

    for (index, entry) in plan.cache_actions.iter().enumerate() {
        let try_again = match &entry.action {
            CacheAction::ExtractContainer { try_again, .. }
            | CacheAction::CachePayload { try_again, .. }
            | CacheAction::LayoutPayload { try_again, .. }
            | CacheAction::LayoutContainer { try_again, .. } => *try_again,
            _ => continue,
        };
        assert!(try_again <= index);
        assert!(matches!(
            &plan.cache_actions[try_again].action,
            CacheAction::AcquireContainer { .. }
                | CacheAction::ExtractContainer { .. }
                | CacheAction::AcquirePayload { .. }
        ));
    }
}

#[test]
fn boundaries_are_symmetric() {
    let host = TestHost::new();
    let plan = plan_install(&host, &single_msi_manifest("1.0.0.0"));

    let execute_boundaries: Vec<&str> = plan
        .live_execute_actions()
        .filter_map(|a| match a {
            ExecuteAction::RollbackBoundary { boundary_id, .. } => Some(boundary_id.as_str()),
            _ => None,
        })
        .collect();
    let rollback_boundaries: Vec<&str> = plan
        .rollback_actions
        .iter()
        .filter(|e| !e.deleted)
        .filter_map(|e| match &e.action {
            ExecuteAction::RollbackBoundary { boundary_id, .. } => Some(boundary_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(execute_boundaries, rollback_boundaries);
    assert_eq!(execute_boundaries, vec!["bnd0"]);
}

fn shared_payload_manifest() -> String {
    let hash = sha1_hex(b"shared bytes");
    format!(
        r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{{BUNDLE-1}}" DisplayName="Test Bundle" ProviderKey="test.bundle" />
  <Payload Id="shared" FilePath="shared.exe" Hash="{hash}" Size="12" />
  <Chain>
    <ExePackage Id="pkg1" DetectCondition="pkg1Installed" InstallArguments="/i" UninstallArguments="/x">
      <PayloadRef Id="shared" />
    </ExePackage>
    <ExePackage Id="pkg2" DetectCondition="pkg2Installed" InstallArguments="/i" UninstallArguments="/x">
      <PayloadRef Id="shared" />
    </ExePackage>
  </Chain>
</BundleManifest>"#
    )
}

#[test]
fn shared_payload_moves_at_most_once() {
    let host = TestHost::new();
    let plan = plan_install(&host, &shared_payload_manifest());

    // One acquire serves both packages.
    let acquires = plan
        .live_cache_actions()
        .filter(|a| matches!(a, CacheAction::AcquirePayload { payload_id, .. } if payload_id == "shared"))
        .count();
    assert_eq!(acquires, 1);

    // Exactly one placement carries the move; the other degraded to copy.
    let moves = plan
        .live_cache_actions()
        .filter(|a| matches!(a, CacheAction::CachePayload { payload_id, move_file: true, .. } if payload_id == "shared"))
        .count();
    assert_eq!(moves, 1);
    let copies = plan
        .live_cache_actions()
        .filter(|a| matches!(a, CacheAction::CachePayload { payload_id, move_file: false, .. } if payload_id == "shared"))
        .count();
    assert_eq!(copies, 1);
}

#[test]
fn package_spans_are_well_formed() {
    let host = TestHost::new();
    let plan = plan_install(&host, &shared_payload_manifest());

    for (index, entry) in plan.cache_actions.iter().enumerate() {
        if let CacheAction::PackageStart {
            package_id,
            complete_index,
            ..
        } = &entry.action
        {
            assert!(*complete_index > index);
            assert!(matches!(
                &plan.cache_actions[*complete_index].action,
                CacheAction::PackageStop { package_id: stop } if stop == package_id
            ));
        }
    }
}

#[test]
fn minor_upgrade_is_planned() {
    let host = TestHost::new();
    host.machine.add_product(
        InstalledProduct {
            product_code: "{P1}".to_owned(),
            version: BundleVersion::new(1, 0, 0, 0),
            language: 1033,
            per_machine: false,
        },
        Some("{UC-1}"),
    );

    let plan = plan_install(&host, &single_msi_manifest("1.1.0.0"));
    assert!(plan.live_execute_actions().any(|a| matches!(
        a,
        ExecuteAction::MsiPackage {
            action: ActionState::MinorUpgrade,
            ..
        }
    )));
}

#[test]
fn uninstall_with_dependents_is_blocked() {
    let host = TestHost::new();
    let manifest = single_msi_manifest("1.0.0.0");

    let mut engine = host.engine(&manifest, &[]);
    // Another bundle registered itself as depending on us.
    engine
        .registration()
        .register_dependent(false, "test.bundle", "{OTHER-BUNDLE}")
        .unwrap();

    let detection = engine.detect().unwrap();
    assert_eq!(detection.dependents, vec!["{OTHER-BUNDLE}".to_owned()]);

    let plan = engine
        .plan(&detection, &PlanRequest::new(BundleAction::Uninstall))
        .unwrap();

    assert!(plan.disallow_removal);
    // Every package execute is skipped and the registration stays.
    assert!(!plan.live_execute_actions().any(|a| matches!(
        a,
        ExecuteAction::MsiPackage { .. }
            | ExecuteAction::ExePackage { .. }
            | ExecuteAction::MspTarget { .. }
            | ExecuteAction::MsuPackage { .. }
    )));
    assert!(!plan.registration_ops.write_registration);
}

#[test]
fn ignored_dependents_do_not_block_uninstall() {
    let host = TestHost::new();
    let manifest = single_msi_manifest("1.0.0.0");
    host.machine.add_product(
        InstalledProduct {
            product_code: "{P1}".to_owned(),
            version: BundleVersion::new(1, 0, 0, 0),
            language: 1033,
            per_machine: false,
        },
        None,
    );

    let mut engine = host.engine_with(&manifest, &[], |builder| {
        builder.with_ignored_dependencies(vec!["{OTHER-BUNDLE}".to_owned()])
    });
    engine
        .registration()
        .register_dependent(false, "test.bundle", "{OTHER-BUNDLE}")
        .unwrap();

    let detection = engine.detect().unwrap();
    assert!(detection.dependents.is_empty());

    let plan = engine
        .plan(&detection, &PlanRequest::new(BundleAction::Uninstall))
        .unwrap();
    assert!(!plan.disallow_removal);
    assert!(plan.live_execute_actions().any(|a| matches!(
        a,
        ExecuteAction::MsiPackage {
            action: ActionState::Uninstall,
            ..
        }
    )));
}

fn slipstream_manifest() -> String {
    format!(
        r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{{BUNDLE-1}}" DisplayName="Test Bundle" ProviderKey="test.bundle" />
  <Payload Id="msiA" FilePath="a.msi" Hash="{msi_hash}" Size="10" />
  <Payload Id="mspA" FilePath="a.msp" Hash="{msp_hash}" Size="5" />
  <Chain>
    <MsiPackage Id="pkgA" ProductCode="{{P1}}" Version="1.1.0.0">
      <PayloadRef Id="msiA" />
      <SlipstreamMsp Id="patchA" />
    </MsiPackage>
    <MspPackage Id="patchA" PatchCode="{{PA}}">
      <PayloadRef Id="mspA" />
      <TargetCode Id="{{P1}}" />
    </MspPackage>
  </Chain>
</BundleManifest>"#,
        msi_hash = sha1_hex(b"msi bytes"),
        msp_hash = sha1_hex(b"msp bytes"),
    )
}

#[test]
fn slipstream_patch_rides_the_msi() {
    let host = TestHost::new();
    // The target product is installed at an older version, so the MSI minor
    // upgrades and the patch would otherwise apply standalone.
    host.machine.add_product(
        InstalledProduct {
            product_code: "{P1}".to_owned(),
            version: BundleVersion::new(1, 0, 0, 0),
            language: 1033,
            per_machine: false,
        },
        None,
    );

    let plan = plan_install(&host, &slipstream_manifest());

    let msi = plan
        .live_execute_actions()
        .find_map(|a| match a {
            ExecuteAction::MsiPackage {
                package_id,
                slipstream_patches,
                ..
            } if package_id == "pkgA" => Some(slipstream_patches),
            _ => None,
        })
        .expect("msi action present");
    assert_eq!(msi.len(), 1);
    assert_eq!(msi[0].msp_package_id, "patchA");

    // No standalone patch action against the slipstreamed target remains.
    assert!(!plan.live_execute_actions().any(|a| matches!(
        a,
        ExecuteAction::MspTarget {
            package_id,
            target_product_code,
            ..
        } if package_id == "patchA" && target_product_code == "{P1}"
    )));
}

#[test]
fn layout_plan_covers_bundle_containers_and_payloads() {
    let host = TestHost::new();
    let manifest = single_msi_manifest("1.0.0.0");
    let mut engine = host.engine(&manifest, &[]);
    let detection = engine.detect().unwrap();

    let mut request = PlanRequest::new(BundleAction::Layout);
    request.layout_directory = Some(host.temp.path().join("layout"));
    let plan = engine.plan(&detection, &request).unwrap();

    let cache: Vec<&CacheAction> = plan.live_cache_actions().collect();
    assert!(matches!(cache[0], CacheAction::LayoutBundle));
    assert!(cache
        .iter()
        .any(|a| matches!(a, CacheAction::LayoutContainer { container_id, .. } if container_id == "cab1")));
    // The embedded payload rides inside the container; no loose layout.
    assert!(!cache
        .iter()
        .any(|a| matches!(a, CacheAction::LayoutPayload { .. })));
    assert!(plan.execute_actions.is_empty());
}

#[test]
fn cached_package_skips_acquisition() {
    let host = TestHost::new();
    let manifest = single_msi_manifest("1.0.0.0");

    // Pre-populate the completed cache.
    let folder = host.temp.path().join("user-cache").join("pkgA-v1");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("a.msi"), b"msi bytes").unwrap();

    let plan = plan_install(&host, &manifest);

    // The payload is complete in the cache, so nothing in the plan caches
    // the package and the acquire never runs unless verification fails.
    assert!(!plan
        .live_cache_actions()
        .any(|a| matches!(a, CacheAction::CachePayload { .. })));
}
