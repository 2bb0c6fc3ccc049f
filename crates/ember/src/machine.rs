//! The seam to the installer databases of the host machine: Windows
//! Installer products, patches, features, OS updates and file version
//! resources. Detect and the search engine only ask questions through
//! [`MachineInspector`]; they never mutate machine state.
//!
//! [`MemoryMachine`] is the in-memory implementation used by tests and by
//! hosts that drive planning against a synthetic machine description.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;

use ember_bundle_types::{BundleVersion, FeatureState};

/// A product found in the Windows Installer database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProduct {
    /// The product code.
    pub product_code: String,
    /// The installed version.
    pub version: BundleVersion,
    /// The installed language.
    pub language: u32,
    /// Installed machine-wide rather than per-user.
    pub per_machine: bool,
}

/// The state of a patch relative to one product.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PatchApplyState {
    /// The patch is not applied to the product.
    Absent,
    /// The patch is applied.
    Applied,
    /// A later patch supersedes this one.
    Superseded,
    /// The patch is registered but obsolete.
    Obsoleted,
}

/// Read-only questions about installed software. All answers reflect the
/// machine at the time of the call; detect snapshots them before planning.
pub trait MachineInspector: Send + Sync {
    /// Finds an installed product by product code.
    fn find_product(&self, product_code: &str) -> Option<InstalledProduct>;

    /// Enumerates the installed products registered under an upgrade code.
    fn related_products(&self, upgrade_code: &str) -> Vec<InstalledProduct>;

    /// The install state of one feature of an installed product.
    fn feature_state(&self, product_code: &str, feature_id: &str) -> FeatureState;

    /// The state of a patch against one product.
    fn patch_state(&self, product_code: &str, patch_code: &str) -> PatchApplyState;

    /// Whether the OS update with the given knowledge-base id is installed.
    fn is_update_installed(&self, kb: &str) -> bool;

    /// The product code registered as owning a dependency provider key, with
    /// its version. Used to discover the "compatible installed product" when
    /// the authored product code is absent.
    fn provider_owner(&self, provider_key: &str) -> Option<InstalledProduct>;

    /// The version resource of a file, for file searches.
    fn file_version(&self, path: &Path) -> Option<BundleVersion>;

    /// The key path of an installed MSI component, for component searches.
    fn component_key_path(
        &self,
        component_id: &str,
        product_code: Option<&str>,
    ) -> Option<String>;
}

#[derive(Default)]
struct MemoryMachineState {
    products: HashMap<String, InstalledProduct>,
    upgrade_codes: HashMap<String, Vec<String>>,
    features: HashMap<(String, String), FeatureState>,
    patches: HashMap<(String, String), PatchApplyState>,
    updates: HashMap<String, bool>,
    providers: HashMap<String, String>,
    file_versions: HashMap<std::path::PathBuf, BundleVersion>,
    components: HashMap<(String, Option<String>), String>,
}

/// An in-memory machine description. Interior mutability so tests can adjust
/// the machine between detect rounds while the engine holds a shared
/// reference.
#[derive(Default)]
pub struct MemoryMachine {
    state: RwLock<MemoryMachineState>,
}

impl MemoryMachine {
    /// An empty machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an installed product, optionally under an upgrade code.
    pub fn add_product(&self, product: InstalledProduct, upgrade_code: Option<&str>) {
        let mut state = self.state.write();
        if let Some(upgrade_code) = upgrade_code {
            state
                .upgrade_codes
                .entry(upgrade_code.to_owned())
                .or_default()
                .push(product.product_code.clone());
        }
        state.products.insert(product.product_code.clone(), product);
    }

    /// Removes an installed product.
    pub fn remove_product(&self, product_code: &str) {
        let mut state = self.state.write();
        state.products.remove(product_code);
        for products in state.upgrade_codes.values_mut() {
            products.retain(|code| code != product_code);
        }
    }

    /// Sets the state of a feature.
    pub fn set_feature_state(&self, product_code: &str, feature_id: &str, state: FeatureState) {
        self.state
            .write()
            .features
            .insert((product_code.to_owned(), feature_id.to_owned()), state);
    }

    /// Sets the state of a patch against a product.
    pub fn set_patch_state(&self, product_code: &str, patch_code: &str, state: PatchApplyState) {
        self.state
            .write()
            .patches
            .insert((product_code.to_owned(), patch_code.to_owned()), state);
    }

    /// Marks an OS update installed or absent.
    pub fn set_update_installed(&self, kb: &str, installed: bool) {
        self.state.write().updates.insert(kb.to_owned(), installed);
    }

    /// Registers the product owning a dependency provider key.
    pub fn set_provider_owner(&self, provider_key: &str, product_code: &str) {
        self.state
            .write()
            .providers
            .insert(provider_key.to_owned(), product_code.to_owned());
    }

    /// Sets the version resource of a file path.
    pub fn set_file_version(&self, path: impl Into<std::path::PathBuf>, version: BundleVersion) {
        self.state.write().file_versions.insert(path.into(), version);
    }

    /// Registers an installed component's key path.
    pub fn set_component_key_path(
        &self,
        component_id: &str,
        product_code: Option<&str>,
        key_path: &str,
    ) {
        self.state.write().components.insert(
            (component_id.to_owned(), product_code.map(str::to_owned)),
            key_path.to_owned(),
        );
    }
}

impl MachineInspector for MemoryMachine {
    fn find_product(&self, product_code: &str) -> Option<InstalledProduct> {
        self.state.read().products.get(product_code).cloned()
    }

    fn related_products(&self, upgrade_code: &str) -> Vec<InstalledProduct> {
        let state = self.state.read();
        state
            .upgrade_codes
            .get(upgrade_code)
            .into_iter()
            .flatten()
            .filter_map(|code| state.products.get(code))
            .cloned()
            .collect()
    }

    fn feature_state(&self, product_code: &str, feature_id: &str) -> FeatureState {
        self.state
            .read()
            .features
            .get(&(product_code.to_owned(), feature_id.to_owned()))
            .copied()
            .unwrap_or(FeatureState::Unknown)
    }

    fn patch_state(&self, product_code: &str, patch_code: &str) -> PatchApplyState {
        self.state
            .read()
            .patches
            .get(&(product_code.to_owned(), patch_code.to_owned()))
            .copied()
            .unwrap_or(PatchApplyState::Absent)
    }

    fn is_update_installed(&self, kb: &str) -> bool {
        self.state.read().updates.get(kb).copied().unwrap_or(false)
    }

    fn provider_owner(&self, provider_key: &str) -> Option<InstalledProduct> {
        let state = self.state.read();
        let product_code = state.providers.get(provider_key)?;
        state.products.get(product_code).cloned()
    }

    fn file_version(&self, path: &Path) -> Option<BundleVersion> {
        self.state.read().file_versions.get(path).copied()
    }

    fn component_key_path(
        &self,
        component_id: &str,
        product_code: Option<&str>,
    ) -> Option<String> {
        self.state
            .read()
            .components
            .get(&(component_id.to_owned(), product_code.map(str::to_owned)))
            .cloned()
    }
}
