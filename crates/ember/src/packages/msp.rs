//! The MSP package driver: builds `msiexec` command lines that apply or
//! remove a patch against one target product.

use std::path::Path;

use ember_bundle_types::{
    manifest::{MspPackage, Package},
    ActionState, Variables,
};

use super::ExecutionRequest;

/// Builds the execution request for one (patch, target product) pair, or
/// `None` when the action needs no process.
pub fn build_request(
    package: &Package,
    msp: &MspPackage,
    action: ActionState,
    msp_path: &Path,
    target_product_code: &str,
    variables: &Variables,
) -> Option<ExecutionRequest> {
    let mut arguments: Vec<String> = Vec::new();

    match action {
        ActionState::Install | ActionState::Repair | ActionState::MinorUpgrade
        | ActionState::MajorUpgrade | ActionState::Modify => {
            arguments.push("/update".to_owned());
            arguments.push(msp_path.display().to_string());
            arguments.push(format!("TARGETPRODUCTCODE={target_product_code}"));
        }
        ActionState::Uninstall => {
            arguments.push("/uninstall".to_owned());
            arguments.push(msp.patch_code.clone());
            arguments.push("/package".to_owned());
            arguments.push(target_product_code.to_owned());
        }
        ActionState::None => return None,
    }

    arguments.push("/qn".to_owned());
    arguments.push("REBOOT=ReallySuppress".to_owned());

    for property in &msp.properties {
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
