//! Declarations of the probes a bundle runs before planning to populate
//! variables from machine state. The execution of these probes lives in the
//! engine; this module only models the manifest data.

/// A single search declaration. Searches run in manifest order; each one
/// stores its result into `variable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    /// Identifier, for logging.
    pub id: String,
    /// The variable receiving the result.
    pub variable: String,
    /// Optional condition gating the search.
    pub condition: Option<String>,
    /// What to probe.
    pub kind: SearchKind,
}

/// The kinds of probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKind {
    /// Does a directory exist.
    DirectoryExists {
        /// Path to probe, may contain `[Variable]` references.
        path: String,
    },
    /// Does a file exist.
    FileExists {
        /// Path to probe, may contain `[Variable]` references.
        path: String,
    },
    /// Read a file's version resource.
    FileVersion {
        /// Path to probe, may contain `[Variable]` references.
        path: String,
    },
    /// Does a registry key or value exist.
    RegistryExists {
        /// Registry root and key path.
        root: RegistryRoot,
        /// Key path below the root.
        key: String,
        /// Value name; `None` probes the key itself.
        value: Option<String>,
    },
    /// Read a registry value.
    RegistryValue {
        /// Registry root and key path.
        root: RegistryRoot,
        /// Key path below the root.
        key: String,
        /// Value name; `None` reads the default value.
        value: Option<String>,
        /// Expand environment references in string values.
        expand: bool,
    },
    /// Query the state of an installed MSI component.
    MsiComponent {
        /// The component id to query.
        component_id: String,
        /// Optional product scoping the query.
        product_code: Option<String>,
        /// Which aspect of the component to return.
        result: MsiComponentResult,
    },
    /// Query an installed MSI product.
    MsiProduct {
        /// The product code to query.
        product_code: String,
        /// Which aspect of the product to return.
        result: MsiProductResult,
    },
    /// Query the state of an MSI feature. Not supported; the probe reports
    /// an error when run.
    MsiFeature {
        /// The product the feature belongs to.
        product_code: String,
        /// The feature id.
        feature_id: String,
    },
}

/// The registry hive a registry search starts from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegistryRoot {
    /// HKEY_LOCAL_MACHINE.
    LocalMachine,
    /// HKEY_CURRENT_USER.
    CurrentUser,
    /// HKEY_CLASSES_ROOT.
    ClassesRoot,
    /// HKEY_USERS.
    Users,
}

/// What an MSI component search returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsiComponentResult {
    /// The install state as a numeric.
    State,
    /// The key path of the component.
    KeyPath,
    /// The directory containing the key path.
    Directory,
}

/// What an MSI product search returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsiProductResult {
    /// The product version.
    Version,
    /// The product language.
    Language,
    /// The install state as a numeric.
    State,
    /// The assignment type (per-user or per-machine) as a numeric.
    Assignment,
}
