//! Related-bundle planning: turns the uninstall records discovered during
//! detect into pseudo packages with fabricated command lines, scheduled
//! after the bundle's own chain.

use std::path::PathBuf;

use ember_bundle_types::{ActionState, BundleAction, BundleVersion, RelatedBundleKind};

use crate::packages::ExecutionRequest;
use crate::registration::RelatedBundleRegistration;

/// A related bundle dressed up as an executable package. It has no
/// payloads; its program is the other bundle's cached executable and its
/// arguments are fabricated from the action and the forwarded ancestor
/// chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoPackage {
    /// The related bundle's id; doubles as the pseudo package id.
    pub bundle_id: String,
    /// The classification that scheduled it.
    pub kind: RelatedBundleKind,
    /// The related bundle's registration scope.
    pub per_machine: bool,
    /// The related bundle's version.
    pub version: BundleVersion,
    /// The action the plan runs it with.
    pub execute: ActionState,
    /// The other bundle's cached executable.
    pub program: Option<PathBuf>,
    /// Ancestor chain forwarded on the child command line, ours included.
    pub ancestors: Vec<String>,
}

impl PseudoPackage {
    /// The child command line for this pseudo package.
    pub fn execution_request(&self) -> Option<ExecutionRequest> {
        let program = self.program.as_ref()?;
        let mut arguments = match self.execute {
            ActionState::Install | ActionState::MinorUpgrade | ActionState::MajorUpgrade => {
                vec!["-quiet".to_owned()]
            }
            ActionState::Repair | ActionState::Modify => {
                vec!["-repair".to_owned(), "-quiet".to_owned()]
            }
            ActionState::Uninstall => vec!["-uninstall".to_owned(), "-quiet".to_owned()],
            ActionState::None => return None,
        };
        if !self.ancestors.is_empty() {
            arguments.push("-ancestors".to_owned());
            arguments.push(self.ancestors.join(";"));
        }
        Some(ExecutionRequest {
            package_id: self.bundle_id.clone(),
            program: program.display().to_string(),
            arguments,
        })
    }
}

/// Resolves the action for a related bundle from its classification, the
/// version relationship and the bundle action.
pub fn related_bundle_action(
    kind: RelatedBundleKind,
    our_version: BundleVersion,
    their_version: BundleVersion,
    bundle_action: BundleAction,
    being_upgraded: bool,
) -> ActionState {
    match kind {
        RelatedBundleKind::Upgrade => {
            // Replace only older bundles; never downgrade another bundle.
            if our_version > their_version && !bundle_action.is_uninstall() {
                ActionState::Uninstall
            } else {
                ActionState::None
            }
        }
        RelatedBundleKind::Addon | RelatedBundleKind::Patch => match bundle_action {
            BundleAction::Install | BundleAction::Modify => ActionState::Install,
            BundleAction::Repair => ActionState::Repair,
            BundleAction::Uninstall => ActionState::Uninstall,
            _ => ActionState::None,
        },
        RelatedBundleKind::Dependent => {
            // A dependent is repaired when we uninstall underneath it,
            // unless an upgrade is replacing us anyway.
            if bundle_action.is_uninstall() && !being_upgraded {
                ActionState::Repair
            } else {
                ActionState::None
            }
        }
        RelatedBundleKind::Detect => ActionState::None,
    }
}

/// Fabricates the pseudo package for one related bundle. The forwarded
/// ancestor chain is the incoming chain plus our own id, so reciprocal
/// launches terminate.
pub fn fabricate_pseudo_package(
    registration: &RelatedBundleRegistration,
    execute: ActionState,
    incoming_ancestors: &[String],
    our_bundle_id: &str,
) -> PseudoPackage {
    let mut ancestors = incoming_ancestors.to_vec();
    if !ancestors
        .iter()
        .any(|a| a.eq_ignore_ascii_case(our_bundle_id))
    {
        ancestors.push(our_bundle_id.to_owned());
    }

    PseudoPackage {
        bundle_id: registration.bundle_id.clone(),
        kind: registration.kind,
        per_machine: registration.per_machine,
        version: registration.version,
        execute,
        program: registration.cache_path.clone(),
        ancestors,
    }
}

#[cfg(test)]
mod tests {
    use ember_bundle_types::{ActionState, BundleAction, BundleVersion, RelatedBundleKind};

    use super::related_bundle_action;

    #[test]
    fn test_upgrade_only_removes_older() {
        let newer = BundleVersion::new(2, 0, 0, 0);
        let older = BundleVersion::new(1, 0, 0, 0);

        assert_eq!(
            related_bundle_action(
                RelatedBundleKind::Upgrade,
                newer,
                older,
                BundleAction::Install,
                false
            ),
            ActionState::Uninstall
        );
        // Never remove a newer bundle.
        assert_eq!(
            related_bundle_action(
                RelatedBundleKind::Upgrade,
                older,
                newer,
                BundleAction::Install,
                false
            ),
            ActionState::None
        );
    }

    #[test]
    fn test_dependent_repairs_on_uninstall() {
        let v = BundleVersion::new(1, 0, 0, 0);
        assert_eq!(
            related_bundle_action(
                RelatedBundleKind::Dependent,
                v,
                v,
                BundleAction::Uninstall,
                false
            ),
            ActionState::Repair
        );
        assert_eq!(
            related_bundle_action(
                RelatedBundleKind::Dependent,
                v,
                v,
                BundleAction::Uninstall,
                true
            ),
            ActionState::None
        );
    }

    #[test]
    fn test_addon_follows_bundle_action() {
        let v = BundleVersion::new(1, 0, 0, 0);
        assert_eq!(
            related_bundle_action(RelatedBundleKind::Addon, v, v, BundleAction::Repair, false),
            ActionState::Repair
        );
        assert_eq!(
            related_bundle_action(
                RelatedBundleKind::Addon,
                v,
                v,
                BundleAction::Uninstall,
                false
            ),
            ActionState::Uninstall
        );
    }
}
