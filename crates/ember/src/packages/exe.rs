//! The EXE package driver: builds the child command line for the resolved
//! action and interprets the exit code through the package's mapping table.

use std::path::Path;

use ember_bundle_types::{
    manifest::{ExePackage, ExitCodeBehavior, Package},
    ActionState, Variables,
};

use super::{default_exit_code_outcome, ExecuteError, ExecuteOutcome, ExecutionRequest};

/// Splits a formatted argument string on whitespace, honoring double
/// quotes around arguments with embedded spaces.
pub(crate) fn split_arguments(text: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    arguments.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        arguments.push(current);
    }
    arguments
}

/// Builds the execution request for an EXE package, or `None` when the
/// action needs no process.
pub fn build_request(
    package: &Package,
    exe: &ExePackage,
    action: ActionState,
    executable_path: &Path,
    variables: &Variables,
) -> Option<ExecutionRequest> {
    let arguments = match action {
        ActionState::Install | ActionState::MinorUpgrade | ActionState::MajorUpgrade => {
            exe.install_arguments.as_deref()
        }
        ActionState::Repair | ActionState::Modify => exe.repair_arguments.as_deref(),
        ActionState::Uninstall => exe.uninstall_arguments.as_deref(),
        ActionState::None => return None,
    };

    let arguments = arguments
        .map(|text| split_arguments(&variables.format_string(text)))
        .unwrap_or_default();

    Some(ExecutionRequest {
        package_id: package.id.clone(),
        program: executable_path.display().to_string(),
        arguments,
    })
}

/// Interprets an exit code through the package's mapping table, falling
/// back to the Windows Installer conventions.
pub fn interpret_exit_code(
    exe: &ExePackage,
    package_id: &str,
    exit_code: i32,
) -> Result<ExecuteOutcome, ExecuteError> {
    let mapped = exe
        .exit_codes
        .iter()
        .find(|mapping| mapping.code == Some(exit_code))
        .or_else(|| exe.exit_codes.iter().find(|mapping| mapping.code.is_none()));

    match mapped {
        Some(mapping) => match mapping.behavior {
            ExitCodeBehavior::Success => Ok(ExecuteOutcome::Success),
            ExitCodeBehavior::ScheduleReboot => Ok(ExecuteOutcome::RestartRequired),
            ExitCodeBehavior::ForceReboot => Ok(ExecuteOutcome::RestartInitiated),
            ExitCodeBehavior::Error => Err(ExecuteError::ExitCode {
                package: package_id.to_owned(),
                exit_code,
            }),
        },
        None => default_exit_code_outcome(package_id, exit_code),
    }
}
