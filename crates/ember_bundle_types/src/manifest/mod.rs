//! The in-memory object graph a bundle manifest parses into. The graph is
//! immutable after parse; detect and plan keep their mutable bookkeeping in
//! the engine, keyed by the ids defined here.

mod parse;

use std::path::PathBuf;

use indexmap::IndexMap;
use url::Url;

pub use parse::{parse_manifest, ManifestParseError};

use crate::{
    related::RelatedBundleCodes,
    search::Search,
    state::{CachePolicy, Packaging},
    variable::VariantValue,
    version::BundleVersion,
};
use ember_digest::Sha1Hash;

/// How the registration surfaces the modify entry point.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ModifyDisposition {
    /// Modify is offered normally.
    #[default]
    Enabled,
    /// The modify button is hidden but modify still works.
    HideButton,
    /// Modify is disabled entirely.
    Disabled,
}

/// Registration metadata written to the machine when the bundle installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    /// The stable bundle id registration keys derive from.
    pub bundle_id: String,
    /// Display name for the add/remove programs entry.
    pub display_name: String,
    /// Publisher shown in the add/remove programs entry.
    pub publisher: Option<String>,
    /// The bundle's dependency provider key.
    pub provider_key: String,
    /// Optional tag grouping bundles of one family.
    pub tag: Option<String>,
    /// How modify is surfaced.
    pub modify: ModifyDisposition,
    /// Whether the uninstall entry is suppressed.
    pub disable_remove: bool,
    /// The code lists other bundles classify us by.
    pub codes: RelatedBundleCodes,
}

/// A variable declaration from the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDeclaration {
    /// Variable name.
    pub name: String,
    /// Initial value.
    pub value: VariantValue,
    /// Redact from logs and scramble in memory.
    pub hidden: bool,
    /// Persist across apply sessions.
    pub persisted: bool,
}

/// An archive holding one or more payloads. An *attached* container lives at
/// a known offset inside the bundle executable; a *detached* container is an
/// external file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Identifier payloads reference.
    pub id: String,
    /// True when the container is appended to the bundle executable.
    pub attached: bool,
    /// The position among attached containers, when attached.
    pub attached_index: Option<u32>,
    /// Relative name the container caches under.
    pub file_path: PathBuf,
    /// Where the container is found next to the bundle.
    pub source_path: PathBuf,
    /// SHA-1 digest of the container file.
    pub hash: Option<Sha1Hash>,
    /// Size in bytes.
    pub size: u64,
    /// Where to download the container when it cannot be found locally.
    pub download_url: Option<Url>,
}

/// A single file the bundle materializes: an installer database, patch,
/// executable or auxiliary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Identifier packages reference.
    pub id: String,
    /// Relative destination name inside the package cache or layout.
    pub file_path: PathBuf,
    /// Where the payload is found relative to the bundle or container.
    pub source_path: PathBuf,
    /// How the payload travels with the bundle.
    pub packaging: Packaging,
    /// The container carrying this payload, for embedded packaging.
    pub container: Option<String>,
    /// SHA-1 digest of the payload.
    pub hash: Option<Sha1Hash>,
    /// Size in bytes.
    pub size: u64,
    /// Where to download the payload, for download packaging.
    pub download_url: Option<Url>,
    /// Id of a catalog payload that vouches for this payload.
    pub catalog: Option<String>,
    /// SHA-1 public-key identifier the Authenticode chain must contain.
    pub certificate_root_public_key_id: Option<String>,
    /// SHA-1 thumbprint the matched certificate must carry, when present.
    pub certificate_thumbprint: Option<String>,
    /// Only materialized for layout, never cached for execution.
    pub layout_only: bool,
}

/// A named point scoping automatic rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackBoundary {
    /// Identifier packages reference.
    pub id: String,
    /// A failed vital boundary fails the whole apply.
    pub vital: bool,
}

/// A reference-counted key a package registers to advertise the feature it
/// provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyProvider {
    /// The provider key.
    pub key: String,
    /// Version advertised under the key.
    pub version: Option<BundleVersion>,
    /// Display name advertised under the key.
    pub display_name: Option<String>,
    /// True when the key was imported from the package rather than authored.
    pub imported: bool,
}

/// How an EXE package's exit code is interpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitCodeBehavior {
    /// Treat as success.
    Success,
    /// Treat as failure.
    Error,
    /// Success; restart required to finish.
    ScheduleReboot,
    /// Success; restart begins immediately.
    ForceReboot,
}

/// Maps one exit code, or any unmapped code, to a behavior.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExitCodeMapping {
    /// The exit code; `None` matches any code without an explicit mapping.
    pub code: Option<i32>,
    /// The behavior for the matched code.
    pub behavior: ExitCodeBehavior,
}

/// The child protocol an EXE package speaks.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ExeProtocol {
    /// Plain executable; progress comes only from the exit code.
    #[default]
    None,
    /// The executable is itself a bundle and speaks the embedded pipe
    /// protocol.
    Burn,
}

/// Type-specific data for a native executable package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExePackage {
    /// Condition evaluated against variables to detect presence.
    pub detect_condition: Option<String>,
    /// Arguments for install.
    pub install_arguments: Option<String>,
    /// Arguments for repair; absent means repair is unsupported.
    pub repair_arguments: Option<String>,
    /// Arguments for uninstall; absent means the package cannot uninstall.
    pub uninstall_arguments: Option<String>,
    /// The child protocol.
    pub protocol: ExeProtocol,
    /// Exit-code interpretation table.
    pub exit_codes: Vec<ExitCodeMapping>,
}

/// A feature of an MSI package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsiFeature {
    /// Feature id inside the MSI.
    pub id: String,
    /// Condition selecting local installation.
    pub add_local_condition: Option<String>,
    /// Condition selecting run-from-source installation.
    pub add_source_condition: Option<String>,
}

/// A property passed to the MSI on every execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsiProperty {
    /// Property name.
    pub id: String,
    /// Property value, may contain `[Variable]` references.
    pub value: String,
}

/// A related MSI product line this package upgrades or detects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedMsiProduct {
    /// The upgrade code to enumerate products by.
    pub upgrade_code: String,
    /// Lowest version in range.
    pub min_version: Option<BundleVersion>,
    /// Highest version in range.
    pub max_version: Option<BundleVersion>,
    /// Whether `min_version` itself is in range.
    pub min_inclusive: bool,
    /// Whether `max_version` itself is in range.
    pub max_inclusive: bool,
    /// Language filter; empty accepts all languages.
    pub languages: Vec<u32>,
    /// True when `languages` lists the accepted languages, false when it
    /// lists the excluded ones.
    pub languages_inclusive: bool,
    /// Only record the detection, never schedule an upgrade.
    pub only_detect: bool,
}

/// Type-specific data for a Windows Installer package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsiPackage {
    /// The product code.
    pub product_code: String,
    /// The product language.
    pub language: u32,
    /// The product version carried by this bundle.
    pub version: BundleVersion,
    /// The upgrade code, when the product has one.
    pub upgrade_code: Option<String>,
    /// Features selectable in this product.
    pub features: Vec<MsiFeature>,
    /// Properties passed on the command line.
    pub properties: Vec<MsiProperty>,
    /// Related product lines.
    pub related_products: Vec<RelatedMsiProduct>,
    /// Ids of MSP packages slipstreamed into this MSI's installs.
    pub slipstream_msps: Vec<String>,
}

/// Type-specific data for a Windows Installer patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspPackage {
    /// The patch code.
    pub patch_code: String,
    /// Product codes the patch targets.
    pub target_product_codes: Vec<String>,
    /// Properties passed on the command line.
    pub properties: Vec<MsiProperty>,
}

/// Type-specific data for an OS update package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsuPackage {
    /// Condition evaluated against variables to detect presence.
    pub detect_condition: Option<String>,
    /// The knowledge-base id, needed to uninstall.
    pub kb: Option<String>,
}

/// The per-technology half of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageKind {
    /// A native executable.
    Exe(ExePackage),
    /// A Windows Installer database.
    Msi(MsiPackage),
    /// A Windows Installer patch.
    Msp(MspPackage),
    /// An OS update package.
    Msu(MsuPackage),
}

impl PackageKind {
    /// A short tag for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            PackageKind::Exe(_) => "exe",
            PackageKind::Msi(_) => "msi",
            PackageKind::Msp(_) => "msp",
            PackageKind::Msu(_) => "msu",
        }
    }
}

/// One nested installer in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Identifier, unique across the chain.
    pub id: String,
    /// Installs machine-wide rather than per-user.
    pub per_machine: bool,
    /// Never uninstalled by this bundle.
    pub permanent: bool,
    /// Failure of this package fails the apply.
    pub vital: bool,
    /// The folder name under the package cache root.
    pub cache_id: String,
    /// Whether payloads stay cached after apply.
    pub cache_policy: CachePolicy,
    /// Estimated installed size in bytes.
    pub install_size: u64,
    /// Ids of the payloads this package executes from.
    pub payload_refs: Vec<String>,
    /// Dependency provider keys this package registers.
    pub providers: Vec<DependencyProvider>,
    /// Boundary opened before this package when planning forward.
    pub rollback_boundary_forward: Option<String>,
    /// Boundary opened before this package when planning in reverse.
    pub rollback_boundary_backward: Option<String>,
    /// Condition deciding the default request state on install.
    pub install_condition: Option<String>,
    /// The per-technology half.
    pub kind: PackageKind,
}

impl Package {
    /// The MSI data when this is an MSI package.
    pub fn as_msi(&self) -> Option<&MsiPackage> {
        match &self.kind {
            PackageKind::Msi(msi) => Some(msi),
            _ => None,
        }
    }

    /// The MSP data when this is an MSP package.
    pub fn as_msp(&self) -> Option<&MspPackage> {
        match &self.kind {
            PackageKind::Msp(msp) => Some(msp),
            _ => None,
        }
    }

    /// The EXE data when this is an EXE package.
    pub fn as_exe(&self) -> Option<&ExePackage> {
        match &self.kind {
            PackageKind::Exe(exe) => Some(exe),
            _ => None,
        }
    }
}

/// The parsed bundle manifest.
#[derive(Debug, Clone)]
pub struct BundleManifest {
    /// Registration metadata.
    pub registration: RegistrationInfo,
    /// The bundle version.
    pub version: BundleVersion,
    /// Cache and execute workers run concurrently when set.
    pub parallel_cache: bool,
    /// Variable declarations, in manifest order.
    pub variables: Vec<VariableDeclaration>,
    /// Searches, in manifest order.
    pub searches: Vec<Search>,
    /// Containers keyed by id, in manifest order.
    pub containers: IndexMap<String, Container>,
    /// Payloads keyed by id, in manifest order.
    pub payloads: IndexMap<String, Payload>,
    /// Rollback boundaries keyed by id.
    pub rollback_boundaries: IndexMap<String, RollbackBoundary>,
    /// The package chain, in execute order.
    pub chain: Vec<Package>,
}

impl BundleManifest {
    /// Looks up a payload by id.
    pub fn payload(&self, id: &str) -> Option<&Payload> {
        self.payloads.get(id)
    }

    /// Looks up a container by id.
    pub fn container(&self, id: &str) -> Option<&Container> {
        self.containers.get(id)
    }

    /// Looks up a package by id.
    pub fn package(&self, id: &str) -> Option<&Package> {
        self.chain.iter().find(|p| p.id == id)
    }

    /// Looks up a rollback boundary by id.
    pub fn rollback_boundary(&self, id: &str) -> Option<&RollbackBoundary> {
        self.rollback_boundaries.get(id)
    }

    /// The payloads of a package, resolved in reference order.
    pub fn package_payloads<'a>(&'a self, package: &'a Package) -> impl Iterator<Item = &'a Payload> {
        package
            .payload_refs
            .iter()
            .filter_map(move |id| self.payloads.get(id))
    }

    /// Sum of the payload sizes of a package.
    pub fn package_size(&self, package: &Package) -> u64 {
        self.package_payloads(package).map(|p| p.size).sum()
    }
}
