//! The execute planner: resolves per-package action states, emits the
//! ordered execute and rollback action lists with boundaries, syncpoints,
//! dependency housekeeping and checkpoints, plans related bundles, and runs
//! the slipstream finalization pass.

use ember_bundle_types::{
    manifest::{BundleManifest, Package, PackageKind},
    ActionState, BundleAction, CachePolicy, RequestState,
};
use ember_condition::Condition;

use crate::detect::{DetectedPackage, Detection};
use crate::machine::PatchApplyState;
use crate::packages;
use crate::related;

use super::{
    DependencyRegistrationAction, ExecuteAction, Plan, PlanError, PlanRequest, PlannedProvider,
    ProviderAction, ResolvedPackage, SlipstreamPatch,
};

fn package_order<'m>(manifest: &'m BundleManifest, action: BundleAction) -> Vec<&'m Package> {
    if action.is_uninstall() {
        manifest.chain.iter().rev().collect()
    } else {
        manifest.chain.iter().collect()
    }
}

fn default_request_state(
    package: &Package,
    action: BundleAction,
    variables: &ember_bundle_types::Variables,
) -> Result<RequestState, PlanError> {
    Ok(match action {
        BundleAction::Install
        | BundleAction::UpdateReplace
        | BundleAction::UpdateReplaceEmbedded => match &package.install_condition {
            Some(condition) => {
                let parsed =
                    Condition::parse(condition).map_err(|source| PlanError::Condition {
                        package: package.id.clone(),
                        source,
                    })?;
                if parsed.evaluate(variables) {
                    RequestState::Present
                } else {
                    RequestState::Absent
                }
            }
            None => RequestState::Present,
        },
        BundleAction::Repair => RequestState::Repair,
        BundleAction::Uninstall => RequestState::Absent,
        BundleAction::Modify => RequestState::None,
        BundleAction::Cache => RequestState::Cache,
        BundleAction::Layout => RequestState::None,
    })
}

/// Whether an MSP package has anything to do, given its resolved action and
/// the detected target states.
fn msp_has_applicable_targets(detected: &DetectedPackage, action: ActionState) -> bool {
    match action {
        ActionState::Install => detected
            .msp_targets
            .iter()
            .any(|t| t.patch_state == PatchApplyState::Absent),
        ActionState::Uninstall | ActionState::Repair => detected
            .msp_targets
            .iter()
            .any(|t| t.patch_state == PatchApplyState::Applied),
        _ => false,
    }
}

/// Resolves requested, execute and rollback states for every package, in
/// plan order, and derives the plan-wide size and scope summaries.
pub(super) fn resolve_package_states(
    plan: &mut Plan,
    manifest: &BundleManifest,
    detection: &Detection,
    variables: &ember_bundle_types::Variables,
    request: &PlanRequest,
) -> Result<(), PlanError> {
    let empty = DetectedPackage::default();

    for package in package_order(manifest, request.action) {
        let detected = detection.package(&package.id).unwrap_or(&empty);

        let requested = if plan.disallow_removal {
            RequestState::None
        } else {
            match request.overrides.get(&package.id) {
                Some(&overridden) => overridden,
                None => default_request_state(package, request.action, variables)?,
            }
        };

        let (mut execute, mut rollback) = packages::calculate(package, detected, requested);

        // An MSP with no applicable target has nothing to execute.
        if matches!(package.kind, PackageKind::Msp(_))
            && execute.is_active()
            && !msp_has_applicable_targets(detected, execute)
        {
            execute = ActionState::None;
            rollback = ActionState::None;
        }

        let cache = (execute.is_active() && execute != ActionState::Uninstall
            || requested == RequestState::Cache)
            && !detected.cached;
        let uncache = execute == ActionState::Uninstall && package.cache_policy != CachePolicy::Always;

        if matches!(
            execute,
            ActionState::Install
                | ActionState::MinorUpgrade
                | ActionState::MajorUpgrade
                | ActionState::Repair
        ) {
            plan.estimated_size += package.install_size;
        }
        if package.per_machine && (execute.is_active() || cache) {
            plan.per_machine = true;
        }

        tracing::info!(
            package = %package.id,
            state = %detected.state,
            requested = %requested,
            execute = %execute,
            rollback = %rollback,
            cache,
            "planned package"
        );

        plan.resolved.insert(
            package.id.clone(),
            ResolvedPackage {
                requested,
                execute,
                rollback,
                cache,
                uncache,
            },
        );
    }
    Ok(())
}

fn push_provider_actions(
    plan: &mut Plan,
    package: &Package,
    execute: ActionState,
) {
    let (execute_action, rollback_action) = if execute == ActionState::Uninstall {
        (ProviderAction::Unregister, ProviderAction::Register)
    } else {
        (ProviderAction::Register, ProviderAction::Unregister)
    };

    for provider in &package.providers {
        plan.push_execute(ExecuteAction::PackageProvider {
            package_id: package.id.clone(),
            provider_key: provider.key.clone(),
            action: execute_action,
        });
        plan.push_rollback(ExecuteAction::PackageProvider {
            package_id: package.id.clone(),
            provider_key: provider.key.clone(),
            action: rollback_action,
        });

        plan.push_execute(ExecuteAction::PackageDependency {
            package_id: package.id.clone(),
            provider_key: provider.key.clone(),
            action: execute_action,
        });
        plan.push_rollback(ExecuteAction::PackageDependency {
            package_id: package.id.clone(),
            provider_key: provider.key.clone(),
            action: rollback_action,
        });

        plan.registration_actions.push(PlannedProvider {
            package_id: package.id.clone(),
            provider_key: provider.key.clone(),
            action: execute_action,
        });
    }
}

fn build_package_action(
    package: &Package,
    detected: &DetectedPackage,
    action: ActionState,
    variables: &ember_bundle_types::Variables,
) -> Vec<ExecuteAction> {
    if action == ActionState::None {
        return Vec::new();
    }
    match &package.kind {
        PackageKind::Exe(_) => vec![ExecuteAction::ExePackage {
            package_id: package.id.clone(),
            action,
        }],
        PackageKind::Msu(_) => vec![ExecuteAction::MsuPackage {
            package_id: package.id.clone(),
            action,
        }],
        PackageKind::Msi(msi) => {
            let feature_actions =
                packages::msi::plan_feature_actions(msi, &detected.features, action, variables);
            vec![ExecuteAction::MsiPackage {
                package_id: package.id.clone(),
                action,
                feature_actions,
                slipstream_patches: Vec::new(),
            }]
        }
        PackageKind::Msp(_) => {
            let wanted = match action {
                ActionState::Uninstall | ActionState::Repair => PatchApplyState::Applied,
                _ => PatchApplyState::Absent,
            };
            detected
                .msp_targets
                .iter()
                .filter(|t| t.patch_state == wanted)
                .map(|t| ExecuteAction::MspTarget {
                    package_id: package.id.clone(),
                    action,
                    target_product_code: t.product_code.clone(),
                })
                .collect()
        }
    }
}

/// Emits the execute and rollback action lists for the bundle's own chain.
pub(super) fn plan_execute_actions(
    plan: &mut Plan,
    manifest: &BundleManifest,
    detection: &Detection,
    variables: &ember_bundle_types::Variables,
    request: &PlanRequest,
) {
    let empty = DetectedPackage::default();
    let uninstalling = request.action.is_uninstall();
    let order = package_order(manifest, request.action);

    // Registration is kept from the first non-permanent package on install
    // and dropped after the last one on uninstall.
    let registration_package: Option<&str> = if uninstalling {
        order
            .iter()
            .filter(|p| {
                !p.permanent
                    && plan
                        .resolved
                        .get(&p.id)
                        .is_some_and(|r| r.execute.is_active())
            })
            .next_back()
            .map(|p| p.id.as_str())
    } else {
        order
            .iter()
            .find(|p| {
                !p.permanent
                    && plan
                        .resolved
                        .get(&p.id)
                        .is_some_and(|r| r.execute.is_active())
            })
            .map(|p| p.id.as_str())
    };

    let mut current_boundary: Option<String> = None;

    for package in order {
        let resolved = plan.resolved.get(&package.id).cloned().unwrap_or_default();
        let detected = detection.package(&package.id).unwrap_or(&empty);

        if !resolved.execute.is_active() && !resolved.cache {
            continue;
        }

        // Open the package's boundary when it differs from the current one.
        let boundary_id = if uninstalling {
            package
                .rollback_boundary_backward
                .as_ref()
                .or(package.rollback_boundary_forward.as_ref())
        } else {
            package.rollback_boundary_forward.as_ref()
        };
        if let Some(boundary_id) = boundary_id {
            if current_boundary.as_deref() != Some(boundary_id) {
                let vital = manifest
                    .rollback_boundary(boundary_id)
                    .map(|b| b.vital)
                    .unwrap_or(true);
                plan.push_execute(ExecuteAction::RollbackBoundary {
                    boundary_id: boundary_id.clone(),
                    vital,
                });
                plan.push_rollback(ExecuteAction::RollbackBoundary {
                    boundary_id: boundary_id.clone(),
                    vital,
                });
                current_boundary = Some(boundary_id.clone());
            }
        }

        if resolved.cache {
            plan.push_execute(ExecuteAction::WaitSyncpoint {
                package_id: package.id.clone(),
            });
        }

        if !resolved.execute.is_active() {
            continue;
        }

        if !uninstalling && registration_package == Some(package.id.as_str()) {
            plan.push_execute(ExecuteAction::Registration { keep: true });
            plan.push_rollback(ExecuteAction::Registration { keep: false });
        }

        push_provider_actions(plan, package, resolved.execute);

        for action in build_package_action(package, detected, resolved.execute, variables) {
            plan.push_execute(action);
            plan.progress_ticks_total += 1;
        }
        for action in build_package_action(package, detected, resolved.rollback, variables) {
            plan.push_rollback(action);
        }

        // An orphaned compatible product goes away with the package.
        if resolved.execute == ActionState::Uninstall {
            if let Some(compatible) = &detected.compatible_product {
                plan.push_execute(ExecuteAction::CompatiblePackage {
                    package_id: package.id.clone(),
                    product_code: compatible.product_code.clone(),
                });
            }
        }

        let checkpoint = plan.next_checkpoint_id();
        plan.push_execute(ExecuteAction::Checkpoint { id: checkpoint });
        plan.push_rollback(ExecuteAction::Checkpoint { id: checkpoint });

        if resolved.uncache {
            plan.push_execute(ExecuteAction::UncachePackage {
                package_id: package.id.clone(),
            });
        }

        if uninstalling && registration_package == Some(package.id.as_str()) {
            plan.push_execute(ExecuteAction::Registration { keep: false });
            plan.push_rollback(ExecuteAction::Registration { keep: true });
        }
    }
}

/// Plans actions for related bundles discovered during detect, after the
/// bundle's own chain. Bundles in the ancestor chain are skipped to break
/// cycles.
pub(super) fn plan_related_bundles(
    plan: &mut Plan,
    manifest: &BundleManifest,
    detection: &Detection,
    request: &PlanRequest,
) {
    // Bundles we are about to remove as upgrades; dependents among them do
    // not get repaired.
    let upgraded: Vec<&str> = detection
        .related_bundles
        .iter()
        .filter(|rb| {
            rb.kind == ember_bundle_types::RelatedBundleKind::Upgrade
                && manifest.version > rb.version
        })
        .map(|rb| rb.bundle_id.as_str())
        .collect();

    for related_bundle in &detection.related_bundles {
        if request
            .ancestors
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&related_bundle.bundle_id))
        {
            tracing::debug!(
                bundle = %related_bundle.bundle_id,
                "skipping related bundle already in ancestor chain"
            );
            continue;
        }

        let being_upgraded = upgraded
            .iter()
            .any(|id| id.eq_ignore_ascii_case(&related_bundle.bundle_id));
        let action = related::related_bundle_action(
            related_bundle.kind,
            manifest.version,
            related_bundle.version,
            request.action,
            being_upgraded,
        );
        if !action.is_active() {
            continue;
        }

        let pseudo = related::fabricate_pseudo_package(
            related_bundle,
            action,
            &request.ancestors,
            &manifest.registration.bundle_id,
        );
        tracing::info!(
            bundle = %pseudo.bundle_id,
            kind = %pseudo.kind,
            action = %action,
            "planned related bundle"
        );

        plan.push_execute(ExecuteAction::ExePackage {
            package_id: pseudo.bundle_id.clone(),
            action,
        });
        let checkpoint = plan.next_checkpoint_id();
        plan.push_execute(ExecuteAction::Checkpoint { id: checkpoint });
        plan.push_rollback(ExecuteAction::Checkpoint { id: checkpoint });
        plan.progress_ticks_total += 1;

        plan.pseudo_packages.push(pseudo);
    }
}

/// The slipstream finalization pass: records each slipstreamed MSP on its
/// target MSI's action and prunes the now-redundant standalone patch
/// actions. Slipstreaming is suppressed while the base MSI uninstalls or
/// repairs.
pub(super) fn finalize_slipstream_patches(plan: &mut Plan, manifest: &BundleManifest) {
    struct SlipstreamTarget {
        msi_index: usize,
        msp_ids: Vec<String>,
        product_code: String,
    }

    let mut targets = Vec::new();
    for (index, entry) in plan.execute_actions.iter().enumerate() {
        if entry.deleted {
            continue;
        }
        let ExecuteAction::MsiPackage {
            package_id, action, ..
        } = &entry.action
        else {
            continue;
        };
        if !matches!(
            action,
            ActionState::Install | ActionState::MinorUpgrade | ActionState::MajorUpgrade
        ) {
            continue;
        }
        let Some(msi) = manifest.package(package_id).and_then(Package::as_msi) else {
            continue;
        };
        if msi.slipstream_msps.is_empty() {
            continue;
        }
        targets.push(SlipstreamTarget {
            msi_index: index,
            msp_ids: msi.slipstream_msps.clone(),
            product_code: msi.product_code.clone(),
        });
    }

    for target in targets {
        if let ExecuteAction::MsiPackage {
            slipstream_patches, ..
        } = &mut plan.execute_actions[target.msi_index].action
        {
            for msp_id in &target.msp_ids {
                slipstream_patches.push(SlipstreamPatch {
                    msp_package_id: msp_id.clone(),
                    action: ActionState::Install,
                });
            }
        }

        // Standalone patch actions against this product are now redundant.
        for list in [&mut plan.execute_actions, &mut plan.rollback_actions] {
            for entry in list.iter_mut() {
                if let ExecuteAction::MspTarget {
                    package_id,
                    target_product_code,
                    ..
                } = &entry.action
                {
                    if target.msp_ids.contains(package_id)
                        && *target_product_code == target.product_code
                    {
                        entry.deleted = true;
                    }
                }
            }
        }
    }
}

/// Derives the registration operations and bundle provider disposition from
/// the bundle action.
pub(super) fn plan_registration_ops(plan: &mut Plan, _detection: &Detection) {
    match plan.action {
        BundleAction::Install
        | BundleAction::Modify
        | BundleAction::Repair
        | BundleAction::Cache
        | BundleAction::UpdateReplace
        | BundleAction::UpdateReplaceEmbedded => {
            plan.registration_ops.cache_bundle = true;
            plan.registration_ops.write_registration = true;
            plan.registration_ops.update_size = true;
            plan.dependency_registration = DependencyRegistrationAction::Register;
        }
        BundleAction::Uninstall => {
            if !plan.disallow_removal {
                plan.registration_ops.write_registration = true;
                plan.dependency_registration = DependencyRegistrationAction::Unregister;
            }
        }
        BundleAction::Layout => {}
    }
}
