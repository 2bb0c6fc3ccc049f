//! The cache planner: emits the acquire/extract/stage/verify/place action
//! sequence for every package the plan caches, and the layout sequence for
//! layout actions.

use std::collections::HashMap;

use ember_bundle_types::{
    manifest::{BundleManifest, Package},
    CachePolicy, Packaging,
};

use crate::detect::Detection;

use super::{ActionIndex, CacheAction, Plan};

#[derive(Default)]
struct CacheBuild {
    /// Payload id -> index of its (single) acquire action.
    payload_acquires: HashMap<String, ActionIndex>,
    /// Payload id -> index of the action currently holding `move=true`.
    payload_moves: HashMap<String, ActionIndex>,
}

fn clear_skip(plan: &mut Plan, index: ActionIndex) {
    match &mut plan.cache_actions[index].action {
        CacheAction::AcquireContainer {
            skip_until_retried, ..
        }
        | CacheAction::AcquirePayload {
            skip_until_retried, ..
        } => *skip_until_retried = false,
        _ => {}
    }
}

fn degrade_prior_move(plan: &mut Plan, build: &mut CacheBuild, payload_id: &str) {
    if let Some(&prior) = build.payload_moves.get(payload_id) {
        match &mut plan.cache_actions[prior].action {
            CacheAction::CachePayload { move_file, .. }
            | CacheAction::LayoutPayload { move_file, .. } => {
                // The payload is shared; the earlier reference copies and the
                // newest one consumes the working file.
                *move_file = false;
            }
            _ => {}
        }
    }
}

/// Emits the per-payload acquire chain for one payload and returns the
/// try-again index its placement action points back to.
fn plan_payload_acquisition(
    plan: &mut Plan,
    build: &mut CacheBuild,
    manifest: &BundleManifest,
    container_extracts: &mut HashMap<String, (ActionIndex, ActionIndex)>,
    payload_id: &str,
    payload_cached: bool,
) -> ActionIndex {
    let payload = &manifest.payloads[payload_id];

    if let (Packaging::Embedded, Some(container_id)) = (payload.packaging, &payload.container) {
        let (extract_index, try_again) = match container_extracts.get(container_id) {
            Some(&existing) => existing,
            None => {
                let container = &manifest.containers[container_id];
                let acquire_index = (!container.attached).then(|| {
                    plan.push_cache(CacheAction::AcquireContainer {
                        container_id: container_id.clone(),
                        skip_until_retried: true,
                    })
                });
                let extract_index = plan.push_cache(CacheAction::ExtractContainer {
                    container_id: container_id.clone(),
                    payload_ids: Vec::new(),
                    try_again: 0,
                });
                // An attached container has no acquire; retries re-run the
                // extraction itself.
                let try_again = acquire_index.unwrap_or(extract_index);
                if let CacheAction::ExtractContainer {
                    try_again: slot, ..
                } = &mut plan.cache_actions[extract_index].action
                {
                    *slot = try_again;
                }
                container_extracts.insert(container_id.clone(), (extract_index, try_again));
                (extract_index, try_again)
            }
        };

        if let CacheAction::ExtractContainer { payload_ids, .. } =
            &mut plan.cache_actions[extract_index].action
        {
            payload_ids.push(payload_id.to_owned());
        }
        if !payload_cached {
            clear_skip(plan, try_again);
        }
        return try_again;
    }

    // Loose payload: reuse a single acquire across every package that
    // references it.
    match build.payload_acquires.get(payload_id) {
        Some(&acquire_index) => {
            if !payload_cached {
                clear_skip(plan, acquire_index);
            }
            acquire_index
        }
        None => {
            let acquire_index = plan.push_cache(CacheAction::AcquirePayload {
                payload_id: payload_id.to_owned(),
                skip_until_retried: payload_cached,
            });
            build.payload_acquires.insert(payload_id.to_owned(), acquire_index);
            acquire_index
        }
    }
}

fn plan_one_package(
    plan: &mut Plan,
    build: &mut CacheBuild,
    manifest: &BundleManifest,
    detection: &Detection,
    package: &Package,
) {
    let payload_ids: Vec<String> = package
        .payload_refs
        .iter()
        .filter(|id| !manifest.payloads[id.as_str()].layout_only)
        .cloned()
        .collect();
    let size: u64 = payload_ids
        .iter()
        .map(|id| manifest.payloads[id.as_str()].size)
        .sum();

    let start_index = plan.push_cache(CacheAction::PackageStart {
        package_id: package.id.clone(),
        complete_index: 0,
        payload_count: payload_ids.len(),
        size,
    });

    let cached_payloads = detection
        .package(&package.id)
        .map(|d| d.cached_payloads.clone())
        .unwrap_or_default();

    let mut container_extracts = HashMap::new();
    for payload_id in &payload_ids {
        let payload_cached = cached_payloads.contains(payload_id);
        let try_again = plan_payload_acquisition(
            plan,
            build,
            manifest,
            &mut container_extracts,
            payload_id,
            payload_cached,
        );

        degrade_prior_move(plan, build, payload_id);
        let cache_index = plan.push_cache(CacheAction::CachePayload {
            package_id: package.id.clone(),
            payload_id: payload_id.clone(),
            move_file: true,
            try_again,
        });
        build.payload_moves.insert(payload_id.clone(), cache_index);
    }

    let stop_index = plan.push_cache(CacheAction::PackageStop {
        package_id: package.id.clone(),
    });
    if let CacheAction::PackageStart { complete_index, .. } =
        &mut plan.cache_actions[start_index].action
    {
        *complete_index = stop_index;
    }

    plan.push_cache(CacheAction::SignalSyncpoint {
        package_id: package.id.clone(),
    });

    plan.cache_size_total += size;
    plan.progress_ticks_total += payload_ids.len() as u64;
}

/// Emits cache actions for every package the resolved states schedule for
/// caching, in plan order, plus the rollback and clean bookkeeping.
pub(super) fn plan_package_caching(
    plan: &mut Plan,
    manifest: &BundleManifest,
    detection: &Detection,
) {
    let mut build = CacheBuild::default();

    let package_order: Vec<&Package> = if plan.action.is_uninstall() {
        manifest.chain.iter().rev().collect()
    } else {
        manifest.chain.iter().collect()
    };

    for package in package_order {
        let Some(resolved) = plan.resolved.get(&package.id) else {
            continue;
        };
        let resolved_cache = resolved.cache;
        let resolved_rollback = resolved.rollback;
        let resolved_execute_active = resolved.execute.is_active();
        if resolved_cache {
            plan_one_package(plan, &mut build, manifest, detection, package);
        }

        // A package whose install is rolled back also loses its fresh cache.
        if resolved_rollback == ember_bundle_types::ActionState::Uninstall
            && !detection.package(&package.id).is_some_and(|d| d.cached)
        {
            plan.rollback_cache_actions
                .push(super::PlanEntry::new(CacheAction::RollbackPackage {
                    package_id: package.id.clone(),
                }));
        }

        if resolved_execute_active && package.cache_policy == CachePolicy::No {
            plan.clean_actions.push(package.id.clone());
        }
    }
}

/// Emits the layout action sequence: the bundle executable, every container,
/// and every loose payload, to the layout directory.
pub(super) fn plan_layout(plan: &mut Plan, manifest: &BundleManifest) {
    let mut build = CacheBuild::default();

    plan.push_cache(CacheAction::LayoutBundle);

    for container in manifest.containers.values() {
        let acquire_index = (!container.attached).then(|| {
            plan.push_cache(CacheAction::AcquireContainer {
                container_id: container.id.clone(),
                skip_until_retried: false,
            })
        });
        let layout_index = plan.push_cache(CacheAction::LayoutContainer {
            container_id: container.id.clone(),
            move_file: true,
            try_again: 0,
        });
        let try_again = acquire_index.unwrap_or(layout_index);
        if let CacheAction::LayoutContainer {
            try_again: slot, ..
        } = &mut plan.cache_actions[layout_index].action
        {
            *slot = try_again;
        }
        plan.cache_size_total += container.size;
        plan.progress_ticks_total += 1;
    }

    // Loose payloads: everything not riding inside a container.
    for payload in manifest.payloads.values() {
        if payload.packaging == Packaging::Embedded {
            continue;
        }
        let acquire_index = match build.payload_acquires.get(&payload.id) {
            Some(&index) => index,
            None => {
                let index = plan.push_cache(CacheAction::AcquirePayload {
                    payload_id: payload.id.clone(),
                    skip_until_retried: false,
                });
                build.payload_acquires.insert(payload.id.clone(), index);
                index
            }
        };

        degrade_prior_move(plan, &mut build, &payload.id);
        let layout_index = plan.push_cache(CacheAction::LayoutPayload {
            payload_id: payload.id.clone(),
            move_file: true,
            try_again: acquire_index,
        });
        build.payload_moves.insert(payload.id.clone(), layout_index);
        plan.cache_size_total += payload.size;
        plan.progress_ticks_total += 1;
    }
}
