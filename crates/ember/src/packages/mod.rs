//! The polymorphic package drivers. Every installer technology shares one
//! capability set (calculate plan states, build the concrete execution
//! request, interpret the exit code), dispatched over the package kind
//! rather than through inheritance.

pub mod exe;
pub mod msi;
pub mod msp;
pub mod msu;

use std::io;

use async_trait::async_trait;

use ember_bundle_types::{
    manifest::{Package, PackageKind},
    ActionState, DetectState, RelationOperation, RequestState,
};

use crate::detect::DetectedPackage;

/// A fully resolved command to hand to the process seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// The package (or pseudo package) being executed.
    pub package_id: String,
    /// The program to run.
    pub program: String,
    /// The arguments, already split.
    pub arguments: Vec<String>,
}

/// What a package execution amounted to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The package succeeded.
    Success,
    /// The package succeeded; a restart is required to finish.
    RestartRequired,
    /// The package succeeded and initiated the restart itself.
    RestartInitiated,
}

/// An error from executing a package.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The child process could not be started or awaited.
    #[error("failed to run package '{package}'")]
    Io {
        /// The package id.
        package: String,
        /// The process failure.
        #[source]
        source: io::Error,
    },

    /// The child process exited with a code mapped to failure.
    #[error("package '{package}' failed with exit code {exit_code}")]
    ExitCode {
        /// The package id.
        package: String,
        /// The failing exit code.
        exit_code: i32,
    },
}

/// The seam that actually spawns installer processes. The engines build the
/// command lines; implementations only run them.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs the request to completion and returns the raw exit code.
    async fn run(&self, request: &ExecutionRequest) -> io::Result<i32>;
}

/// Runs requests as real child processes.
#[derive(Debug, Default)]
pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, request: &ExecutionRequest) -> io::Result<i32> {
        tracing::info!(
            package = %request.package_id,
            program = %request.program,
            "spawning package process"
        );
        let status = tokio::process::Command::new(&request.program)
            .args(&request.arguments)
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}

// Exit codes shared by the Windows Installer family.
pub(crate) const EXIT_SUCCESS: i32 = 0;
pub(crate) const EXIT_SUCCESS_REBOOT_INITIATED: i32 = 1641;
pub(crate) const EXIT_SUCCESS_REBOOT_REQUIRED: i32 = 3010;

/// The default exit-code interpretation used by the MSI family and by EXE
/// packages without an explicit mapping.
pub(crate) fn default_exit_code_outcome(
    package_id: &str,
    exit_code: i32,
) -> Result<ExecuteOutcome, ExecuteError> {
    match exit_code {
        EXIT_SUCCESS => Ok(ExecuteOutcome::Success),
        EXIT_SUCCESS_REBOOT_REQUIRED => Ok(ExecuteOutcome::RestartRequired),
        EXIT_SUCCESS_REBOOT_INITIATED => Ok(ExecuteOutcome::RestartInitiated),
        other => Err(ExecuteError::ExitCode {
            package: package_id.to_owned(),
            exit_code: other,
        }),
    }
}

/// Resolves the execute action from the cross product of detected and
/// requested state.
fn base_execute_action(
    detected: DetectState,
    requested: RequestState,
    permanent: bool,
) -> ActionState {
    use ActionState as A;
    use DetectState as D;
    use RequestState as R;

    match requested {
        R::Present => match detected {
            D::Present | D::Superseded => A::None,
            D::Absent | D::Cached | D::Obsolete | D::Unknown => A::Install,
        },
        R::Absent => {
            if permanent {
                A::None
            } else {
                match detected {
                    D::Absent | D::Unknown => A::None,
                    _ => A::Uninstall,
                }
            }
        }
        R::ForceAbsent => match detected {
            D::Absent | D::Unknown => A::None,
            _ => A::Uninstall,
        },
        R::Repair => match detected {
            D::Present => A::Repair,
            D::Superseded => A::None,
            D::Absent | D::Cached | D::Obsolete | D::Unknown => A::Install,
        },
        R::Cache | R::None => A::None,
    }
}

/// Applies the per-technology overrides on top of the base table.
fn override_execute_action(
    package: &Package,
    detected: &DetectedPackage,
    requested: RequestState,
    action: ActionState,
) -> ActionState {
    match &package.kind {
        PackageKind::Msi(_) => {
            // A same-product-code older install upgrades in place when the
            // package is wanted.
            if detected.state == DetectState::Present
                && detected.relation == RelationOperation::MinorUpdate
                && matches!(requested, RequestState::Present | RequestState::Repair)
            {
                return ActionState::MinorUpgrade;
            }
            // Installing while related products are on the machine makes
            // this a major upgrade.
            if action == ActionState::Install
                && detected.related_products.iter().any(|p| !p.only_detect)
            {
                return ActionState::MajorUpgrade;
            }
            action
        }
        PackageKind::Exe(exe) => {
            // An EXE without an uninstall command cannot be removed.
            if action == ActionState::Uninstall && exe.uninstall_arguments.is_none() {
                return ActionState::None;
            }
            if action == ActionState::Repair && exe.repair_arguments.is_none() {
                return ActionState::None;
            }
            action
        }
        PackageKind::Msu(msu) => {
            // Removing an OS update requires its KB id.
            if action == ActionState::Uninstall && msu.kb.is_none() {
                return ActionState::None;
            }
            action
        }
        PackageKind::Msp(_) => action,
    }
}

/// Resolves the rollback action mirroring an execute action. Permanence and
/// the no-cache rule pin rollback to none where reversal is impossible.
fn rollback_action(
    package: &Package,
    detected: &DetectedPackage,
    execute: ActionState,
) -> ActionState {
    use ActionState as A;
    match execute {
        A::Install | A::MajorUpgrade => {
            if matches!(
                detected.state,
                DetectState::Present | DetectState::Superseded
            ) || package.permanent
            {
                A::None
            } else {
                A::Uninstall
            }
        }
        // An in-place upgrade or repair cannot restore the prior bits.
        A::MinorUpgrade | A::Repair | A::Modify => A::None,
        A::Uninstall => {
            if package.permanent {
                A::None
            } else if package.cache_policy == ember_bundle_types::CachePolicy::No {
                // Without a cached source there is nothing to reinstall from.
                A::None
            } else {
                A::Install
            }
        }
        A::None => A::None,
    }
}

/// The plan-calculate capability: resolves execute and rollback action
/// states for one package.
pub fn calculate(
    package: &Package,
    detected: &DetectedPackage,
    requested: RequestState,
) -> (ActionState, ActionState) {
    let base = base_execute_action(detected.state, requested, package.permanent);
    let execute = override_execute_action(package, detected, requested, base);
    let rollback = rollback_action(package, detected, execute);
    (execute, rollback)
}

#[cfg(test)]
mod tests {
    use ember_bundle_types::{
        manifest::parse_manifest, ActionState, DetectState, RelationOperation, RequestState,
    };
    use rstest::rstest;

    use super::calculate;
    use crate::detect::DetectedPackage;

    fn exe_package(uninstall_arguments: bool) -> ember_bundle_types::Package {
        let uninstall = if uninstall_arguments {
            " UninstallArguments=\"/x\""
        } else {
            ""
        };
        let text = format!(
            r#"<BundleManifest Version="1.0">
  <Registration Id="{{B}}" DisplayName="T" ProviderKey="k" />
  <Payload Id="p" FilePath="s.exe" Size="1" />
  <Chain>
    <ExePackage Id="pkg" DetectCondition="x = 1" InstallArguments="/i"{uninstall}>
      <PayloadRef Id="p" />
    </ExePackage>
  </Chain>
</BundleManifest>"#
        );
        parse_manifest(text.as_bytes()).unwrap().chain[0].clone()
    }

    fn detected(state: DetectState) -> DetectedPackage {
        DetectedPackage {
            state,
            ..Default::default()
        }
    }

    #[rstest]
    #[case(DetectState::Absent, RequestState::Present, ActionState::Install)]
    #[case(DetectState::Cached, RequestState::Present, ActionState::Install)]
    #[case(DetectState::Present, RequestState::Present, ActionState::None)]
    #[case(DetectState::Superseded, RequestState::Present, ActionState::None)]
    #[case(DetectState::Obsolete, RequestState::Present, ActionState::Install)]
    #[case(DetectState::Present, RequestState::Absent, ActionState::Uninstall)]
    #[case(DetectState::Absent, RequestState::Absent, ActionState::None)]
    #[case(DetectState::Present, RequestState::Repair, ActionState::Repair)]
    #[case(DetectState::Absent, RequestState::Repair, ActionState::Install)]
    #[case(DetectState::Present, RequestState::Cache, ActionState::None)]
    #[case(DetectState::Present, RequestState::None, ActionState::None)]
    fn test_state_table(
        #[case] state: DetectState,
        #[case] requested: RequestState,
        #[case] expected: ActionState,
    ) {
        let package = exe_package(true);
        let (execute, _) = calculate(&package, &detected(state), requested);
        assert_eq!(execute, expected);
    }

    #[test]
    fn test_exe_without_uninstaller_pins_none() {
        let package = exe_package(false);
        let (execute, _) = calculate(&package, &detected(DetectState::Present), RequestState::Absent);
        assert_eq!(execute, ActionState::None);
    }

    #[test]
    fn test_permanent_never_uninstalls() {
        let mut package = exe_package(true);
        package.permanent = true;
        let (execute, _) = calculate(&package, &detected(DetectState::Present), RequestState::Absent);
        assert_eq!(execute, ActionState::None);
        // Force-absent overrides permanence.
        let (execute, _) = calculate(
            &package,
            &detected(DetectState::Present),
            RequestState::ForceAbsent,
        );
        assert_eq!(execute, ActionState::Uninstall);
    }

    #[test]
    fn test_fresh_install_rolls_back_to_uninstall() {
        let package = exe_package(true);
        let (execute, rollback) =
            calculate(&package, &detected(DetectState::Absent), RequestState::Present);
        assert_eq!(execute, ActionState::Install);
        assert_eq!(rollback, ActionState::Uninstall);
    }

    #[test]
    fn test_minor_update_override() {
        let text = r#"<BundleManifest Version="1.0">
  <Registration Id="{B}" DisplayName="T" ProviderKey="k" />
  <Payload Id="p" FilePath="a.msi" Size="1" />
  <Chain>
    <MsiPackage Id="pkg" ProductCode="{P}" Version="1.1.0.0">
      <PayloadRef Id="p" />
    </MsiPackage>
  </Chain>
</BundleManifest>"#;
        let package = parse_manifest(text.as_bytes()).unwrap().chain[0].clone();
        let mut det = detected(DetectState::Present);
        det.relation = RelationOperation::MinorUpdate;

        let (execute, rollback) = calculate(&package, &det, RequestState::Present);
        assert_eq!(execute, ActionState::MinorUpgrade);
        assert_eq!(rollback, ActionState::None);
    }
}
