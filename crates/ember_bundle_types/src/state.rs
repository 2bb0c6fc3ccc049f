//! State enums shared by detect, plan and apply.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The action requested for the whole bundle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BundleAction {
    /// Lay the bundle and all its payloads out to a directory.
    Layout,
    /// Cache all payloads without executing any package.
    Cache,
    /// Install the bundle.
    Install,
    /// Change feature or package selections of an installed bundle.
    Modify,
    /// Repair an installed bundle.
    Repair,
    /// Uninstall the bundle.
    Uninstall,
    /// Replace this bundle with an updated one.
    UpdateReplace,
    /// Replace this bundle with an updated one running embedded.
    UpdateReplaceEmbedded,
}

impl BundleAction {
    /// True for the actions that remove rather than add machine state.
    pub fn is_uninstall(self) -> bool {
        matches!(self, BundleAction::Uninstall)
    }
}

/// The on-machine state of a package as discovered during detect.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DetectState {
    /// Detection has not run or produced no answer.
    #[default]
    Unknown,
    /// An unrelated, newer product owns this package's identity.
    Obsolete,
    /// The package is not installed.
    Absent,
    /// The package is not installed but its payloads are cached.
    Cached,
    /// The package is installed.
    Present,
    /// A newer patch or product supersedes this package.
    Superseded,
}

impl Display for DetectState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            DetectState::Unknown => "Unknown",
            DetectState::Obsolete => "Obsolete",
            DetectState::Absent => "Absent",
            DetectState::Cached => "Cached",
            DetectState::Present => "Present",
            DetectState::Superseded => "Superseded",
        };
        f.write_str(text)
    }
}

/// The per-package state requested by the bundle action and the host
/// application's overrides.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestState {
    /// Leave the package alone.
    #[default]
    None,
    /// Remove the package if nothing else depends on it.
    Absent,
    /// Remove the package even if dependents remain.
    ForceAbsent,
    /// Install the package.
    Present,
    /// Repair the package.
    Repair,
    /// Cache the package's payloads without executing it.
    Cache,
}

impl Display for RequestState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            RequestState::None => "None",
            RequestState::Absent => "Absent",
            RequestState::ForceAbsent => "ForceAbsent",
            RequestState::Present => "Present",
            RequestState::Repair => "Repair",
            RequestState::Cache => "Cache",
        };
        f.write_str(text)
    }
}

/// The resolved action for a package in the execute or rollback plan.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ActionState {
    /// No action.
    #[default]
    None,
    /// Remove the package.
    Uninstall,
    /// Install the package.
    Install,
    /// Change feature selections.
    Modify,
    /// Repair the package in place.
    Repair,
    /// Apply a same-product-code version upgrade.
    MinorUpgrade,
    /// Install over a different, older product code.
    MajorUpgrade,
}

impl ActionState {
    /// True if the action mutates machine state.
    pub fn is_active(self) -> bool {
        !matches!(self, ActionState::None)
    }
}

impl Display for ActionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            ActionState::None => "None",
            ActionState::Uninstall => "Uninstall",
            ActionState::Install => "Install",
            ActionState::Modify => "Modify",
            ActionState::Repair => "Repair",
            ActionState::MinorUpgrade => "MinorUpgrade",
            ActionState::MajorUpgrade => "MajorUpgrade",
        };
        f.write_str(text)
    }
}

/// How much of a payload has reached its final cache location.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CacheState {
    /// Nothing cached.
    #[default]
    None,
    /// Some payloads cached, or a transfer was interrupted.
    Partial,
    /// All payloads verified in their final location.
    Complete,
}

/// How a payload is packaged relative to the bundle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Packaging {
    /// A sibling file next to the bundle.
    External,
    /// Carried inside a container.
    Embedded,
    /// Fetched from a URL.
    Download,
}

/// Whether a package's payloads stay in the package cache after apply.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Never cache; payloads are removed after the package executes.
    No,
    /// Cache while the package is installed.
    #[default]
    Yes,
    /// Cache even while the package is absent.
    Always,
}

/// Classification of another installed bundle relative to ours.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RelatedBundleKind {
    /// The other bundle is upgraded (replaced) by ours.
    Upgrade,
    /// The other bundle is only detected, never acted on.
    Detect,
    /// The other bundle is an add-on of ours.
    Addon,
    /// The other bundle patches ours.
    Patch,
    /// The other bundle depends on ours.
    Dependent,
}

impl Display for RelatedBundleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            RelatedBundleKind::Upgrade => "Upgrade",
            RelatedBundleKind::Detect => "Detect",
            RelatedBundleKind::Addon => "Addon",
            RelatedBundleKind::Patch => "Patch",
            RelatedBundleKind::Dependent => "Dependent",
        };
        f.write_str(text)
    }
}

/// How a detected MSI product's version relates to the version in the
/// manifest.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RelationOperation {
    /// Versions are equal.
    #[default]
    None,
    /// The manifest carries a newer version with the same product code.
    MinorUpdate,
    /// The machine carries a newer version than the manifest.
    Downgrade,
    /// A related product code must be replaced.
    MajorUpgrade,
}

/// The install state of a single MSI feature.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FeatureState {
    /// State could not be determined.
    #[default]
    Unknown,
    /// Feature is absent.
    Absent,
    /// Feature is advertised.
    Advertised,
    /// Feature runs from the installation source.
    Source,
    /// Feature is installed locally.
    Local,
}

/// The planned action for a single MSI feature.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FeatureAction {
    /// Leave the feature alone.
    #[default]
    None,
    /// Install the feature locally.
    AddLocal,
    /// Install the feature to run from source.
    AddSource,
    /// Reinstall the feature.
    Reinstall,
    /// Remove the feature.
    Remove,
}

/// The resume disposition persisted in registration.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ResumeMode {
    /// No resume information.
    #[default]
    None,
    /// An apply is in flight.
    Active,
    /// An apply was suspended by the host application.
    Suspend,
    /// The bundle is installed and registered in the add/remove list.
    Arp,
    /// An apply is waiting for the machine to restart.
    RebootPending,
}

/// What kind of resume this engine run is, derived at startup from the
/// persisted [`ResumeMode`] and the volatile reboot marker.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResumeType {
    /// Fresh run, nothing persisted.
    #[default]
    None,
    /// Persisted state was unreadable or inconsistent.
    Invalid,
    /// The previous apply died mid-flight.
    Interrupted,
    /// The machine restarted while an apply was pending.
    RebootPending,
    /// The previous apply suspended itself.
    Suspend,
    /// Launched from the add/remove programs entry.
    Arp,
}
