#![deny(missing_docs)]

//! Data model for bundle manifests and the value types the engine shares:
//! the manifest object graph (containers, payloads, packages, rollback
//! boundaries, dependency providers), four-part versions, typed variables,
//! search declarations, related-bundle code lists, and the state enums that
//! flow between detect, plan and apply.
//!
//! The graph is immutable once parsed; all mutable detect/plan bookkeeping
//! lives in the engine crate and refers back to objects here by id.

pub mod manifest;
pub mod related;
pub mod search;
pub mod state;
pub mod variable;
pub mod version;

pub use manifest::{parse_manifest, BundleManifest, ManifestParseError, Package, PackageKind};
pub use related::RelatedBundleCodes;
pub use state::{
    ActionState, BundleAction, CachePolicy, CacheState, DetectState, FeatureAction, FeatureState,
    Packaging, RelatedBundleKind, RelationOperation, RequestState, ResumeMode, ResumeType,
};
pub use variable::{VariableError, VariantValue, Variables};
pub use version::{BundleVersion, ParseVersionError};
