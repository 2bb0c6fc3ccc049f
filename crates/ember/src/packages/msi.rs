//! The MSI package driver: assembles the `msiexec` command line for the
//! resolved action, including feature lists, authored properties, upgrade
//! properties and slipstreamed patches.

use std::path::Path;

use itertools::Itertools;

use ember_bundle_types::{
    manifest::{MsiPackage, Package},
    ActionState, FeatureAction, Variables,
};

use super::ExecutionRequest;

/// The property string appended for a same-product-code version upgrade.
pub const MINOR_UPGRADE_PROPERTIES: [&str; 3] =
    ["REINSTALL=ALL", "REINSTALLMODE=vomus", "REBOOT=ReallySuppress"];

/// The property string appended for an in-place repair.
pub const REPAIR_PROPERTIES: [&str; 3] =
    ["REINSTALL=ALL", "REINSTALLMODE=cmus", "REBOOT=ReallySuppress"];

fn push_feature_lists(
    arguments: &mut Vec<String>,
    feature_actions: &[(String, FeatureAction)],
) {
    let join = |wanted: FeatureAction| {
        feature_actions
            .iter()
            .filter(|(_, action)| *action == wanted)
            .map(|(id, _)| id.as_str())
            .join(",")
    };

    let add_local = join(FeatureAction::AddLocal);
    if !add_local.is_empty() {
        arguments.push(format!("ADDLOCAL={add_local}"));
    }
    let add_source = join(FeatureAction::AddSource);
    if !add_source.is_empty() {
        arguments.push(format!("ADDSOURCE={add_source}"));
    }
    let reinstall = join(FeatureAction::Reinstall);
    if !reinstall.is_empty() {
        arguments.push(format!("REINSTALL={reinstall}"));
    }
    let remove = join(FeatureAction::Remove);
    if !remove.is_empty() {
        arguments.push(format!("REMOVE={remove}"));
    }
}

/// Builds the execution request for an MSI package, or `None` when the
/// action needs no process. `slipstream_patches` are the cached paths of
/// patches applied within this install's transaction.
#[allow(clippy::too_many_arguments)]
pub fn build_request(
    package: &Package,
    msi: &MsiPackage,
    action: ActionState,
    msi_path: &Path,
    feature_actions: &[(String, FeatureAction)],
    slipstream_patches: &[std::path::PathBuf],
    variables: &Variables,
) -> Option<ExecutionRequest> {
    let mut arguments: Vec<String> = Vec::new();

    match action {
        ActionState::Install | ActionState::MajorUpgrade => {
            arguments.push("/i".to_owned());
            arguments.push(msi_path.display().to_string());
            arguments.push("/qn".to_owned());
            arguments.push("REBOOT=ReallySuppress".to_owned());
        }
        ActionState::MinorUpgrade => {
            arguments.push("/i".to_owned());
            arguments.push(msi_path.display().to_string());
            arguments.push("/qn".to_owned());
            arguments.extend(MINOR_UPGRADE_PROPERTIES.iter().map(|s| (*s).to_owned()));
        }
        ActionState::Repair => {
            arguments.push("/i".to_owned());
            arguments.push(msi_path.display().to_string());
            arguments.push("/qn".to_owned());
            arguments.extend(REPAIR_PROPERTIES.iter().map(|s| (*s).to_owned()));
        }
        ActionState::Modify => {
            arguments.push("/i".to_owned());
            arguments.push(msi_path.display().to_string());
            arguments.push("/qn".to_owned());
            arguments.push("REBOOT=ReallySuppress".to_owned());
        }
        ActionState::Uninstall => {
            arguments.push("/x".to_owned());
            arguments.push(msi.product_code.clone());
            arguments.push("/qn".to_owned());
            arguments.push("REBOOT=ReallySuppress".to_owned());
        }
        ActionState::None => return None,
    }

    if action != ActionState::Uninstall {
        push_feature_lists(&mut arguments, feature_actions);

        if !slipstream_patches.is_empty() {
            let patches = slipstream_patches
                .iter()
                .map(|p| p.display().to_string())
                .join(";");
            arguments.push(format!("PATCH={patches}"));
        }
    }

    for property in &msi.properties {
        arguments.push(format!(
            "{}={}",
            property.id,
            variables.format_string(&property.value)
        ));
    }

    Some(ExecutionRequest {
        package_id: package.id.clone(),
        program: "msiexec".to_owned(),
        arguments,
    })
}

/// Resolves per-feature actions for this execute from the authored feature
/// conditions and the detected feature states.
pub fn plan_feature_actions(
    msi: &MsiPackage,
    detected_features: &indexmap::IndexMap<String, ember_bundle_types::FeatureState>,
    action: ActionState,
    variables: &Variables,
) -> Vec<(String, FeatureAction)> {
    use ember_bundle_types::FeatureState as FS;

    if !matches!(
        action,
        ActionState::Install
            | ActionState::MinorUpgrade
            | ActionState::MajorUpgrade
            | ActionState::Modify
            | ActionState::Repair
    ) {
        return Vec::new();
    }

    msi.features
        .iter()
        .map(|feature| {
            let wanted_local = match &feature.add_local_condition {
                None => true,
                Some(condition) => ember_condition::evaluate_condition(condition, variables)
                    .unwrap_or(true),
            };
            let wanted_source = match &feature.add_source_condition {
                None => false,
                Some(condition) => ember_condition::evaluate_condition(condition, variables)
                    .unwrap_or(false),
            };
            let current = detected_features
                .get(&feature.id)
                .copied()
                .unwrap_or(FS::Unknown);

            let feature_action = if action == ActionState::Repair {
                match current {
                    FS::Local | FS::Source => FeatureAction::Reinstall,
                    _ => FeatureAction::None,
                }
            } else if wanted_local {
                match current {
                    FS::Local => FeatureAction::None,
                    _ => FeatureAction::AddLocal,
                }
            } else if wanted_source {
                match current {
                    FS::Source => FeatureAction::None,
                    _ => FeatureAction::AddSource,
                }
            } else {
                match current {
                    FS::Local | FS::Source | FS::Advertised => FeatureAction::Remove,
                    _ => FeatureAction::None,
                }
            };

            (feature.id.clone(), feature_action)
        })
        .collect()
}
