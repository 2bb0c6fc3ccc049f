//! Related-bundle code lists and the cross-classification of another
//! bundle's codes against ours.

use crate::state::RelatedBundleKind;

/// The four code lists a bundle registers so other bundles can discover it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelatedBundleCodes {
    /// Codes shared by all versions of this bundle line.
    pub upgrade: Vec<String>,
    /// Codes of bundle lines this bundle merely detects.
    pub detect: Vec<String>,
    /// Codes of bundle lines this bundle extends.
    pub addon: Vec<String>,
    /// Codes of bundle lines this bundle patches.
    pub patch: Vec<String>,
}

fn intersects(theirs: &[String], ours: &[String]) -> bool {
    theirs
        .iter()
        .any(|t| ours.iter().any(|o| o.eq_ignore_ascii_case(t)))
}

impl RelatedBundleCodes {
    /// True if any of the four lists carries a code.
    pub fn is_empty(&self) -> bool {
        self.upgrade.is_empty()
            && self.detect.is_empty()
            && self.addon.is_empty()
            && self.patch.is_empty()
    }

    /// Classifies another bundle's registered codes against ours.
    ///
    /// The comparisons run in a fixed order so a bundle that matches several
    /// lists always classifies the same way: their upgrade codes first
    /// (upgrade, detect, then dependent), then their addon codes, patch
    /// codes, and finally their detect codes. Code comparison is
    /// case-insensitive.
    pub fn classify(&self, theirs: &RelatedBundleCodes) -> Option<RelatedBundleKind> {
        if intersects(&theirs.upgrade, &self.upgrade) {
            return Some(RelatedBundleKind::Upgrade);
        }
        if intersects(&theirs.upgrade, &self.detect) {
            return Some(RelatedBundleKind::Detect);
        }
        if intersects(&theirs.upgrade, &self.addon) || intersects(&theirs.upgrade, &self.patch) {
            return Some(RelatedBundleKind::Dependent);
        }

        if intersects(&theirs.addon, &self.detect) || intersects(&theirs.addon, &self.upgrade) {
            return Some(RelatedBundleKind::Addon);
        }

        if intersects(&theirs.patch, &self.detect) || intersects(&theirs.patch, &self.upgrade) {
            return Some(RelatedBundleKind::Patch);
        }

        if intersects(&theirs.detect, &self.detect) {
            return Some(RelatedBundleKind::Detect);
        }
        if intersects(&theirs.detect, &self.addon) || intersects(&theirs.detect, &self.patch) {
            return Some(RelatedBundleKind::Dependent);
        }

        None
    }
}
