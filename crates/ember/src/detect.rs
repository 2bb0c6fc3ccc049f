//! Reconciles on-machine state with the manifest: per-package install
//! state, feature states, patch applicability, the compatible installed
//! product, related bundles and dependents, and the bundle's own resume
//! state.
//!
//! Detect never mutates the machine; its output is the immutable input to
//! planning.

use indexmap::IndexMap;
use thiserror::Error;

use ember_bundle_types::{
    manifest::{BundleManifest, Package, PackageKind},
    BundleVersion, DetectState, FeatureState, RelationOperation, Variables,
};
use ember_cache::CacheLocations;
use ember_condition::{Condition, ConditionError};

use crate::{
    machine::{InstalledProduct, MachineInspector, PatchApplyState},
    registration::{RegistrationState, RegistrationStore, RelatedBundleRegistration},
};

/// An error produced during detect.
#[derive(Debug, Error)]
pub enum DetectError {
    /// A detect condition failed to parse.
    #[error("detect condition of package '{package}' failed to parse")]
    Condition {
        /// The package id.
        package: String,
        /// The parse failure.
        #[source]
        source: ConditionError,
    },
}

/// A related product found through an MSI package's upgrade-code rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedRelatedProduct {
    /// The installed product code.
    pub product_code: String,
    /// The installed version.
    pub version: BundleVersion,
    /// True when the rule only records the product, never upgrades it.
    pub only_detect: bool,
}

/// Applicability of an MSP package against one target product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspTargetDetection {
    /// The installed target product code.
    pub product_code: String,
    /// The installed target product version.
    pub product_version: BundleVersion,
    /// The state of the patch on this target.
    pub patch_state: PatchApplyState,
}

/// Everything detect learned about one package.
#[derive(Debug, Clone, Default)]
pub struct DetectedPackage {
    /// The package's install state.
    pub state: DetectState,
    /// All payloads are present in the completed cache.
    pub cached: bool,
    /// Ids of the payloads already present in the completed cache.
    pub cached_payloads: std::collections::HashSet<String>,
    /// The installed version, for MSI packages found on the machine.
    pub installed_version: Option<BundleVersion>,
    /// How the installed version relates to the manifest version.
    pub relation: RelationOperation,
    /// Feature states, for MSI packages.
    pub features: IndexMap<String, FeatureState>,
    /// Related products found through upgrade-code rules.
    pub related_products: Vec<DetectedRelatedProduct>,
    /// The product owning our provider key when the authored product code
    /// is absent.
    pub compatible_product: Option<InstalledProduct>,
    /// Per-target patch applicability, for MSP packages.
    pub msp_targets: Vec<MspTargetDetection>,
}

/// The full detect result.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Per-package findings, in chain order.
    pub packages: IndexMap<String, DetectedPackage>,
    /// Related bundles found in the uninstall records.
    pub related_bundles: Vec<RelatedBundleRegistration>,
    /// Bundle ids depending on our provider key, ignore list already
    /// applied.
    pub dependents: Vec<String>,
    /// The bundle's own registration and resume state.
    pub registration: RegistrationState,
    /// Whether any package in the chain is per-machine.
    pub per_machine: bool,
}

impl Detection {
    /// The findings for one package.
    pub fn package(&self, id: &str) -> Option<&DetectedPackage> {
        self.packages.get(id)
    }
}

fn version_in_range(
    version: BundleVersion,
    min: Option<BundleVersion>,
    max: Option<BundleVersion>,
    min_inclusive: bool,
    max_inclusive: bool,
) -> bool {
    if let Some(min) = min {
        if version < min || (!min_inclusive && version == min) {
            return false;
        }
    }
    if let Some(max) = max {
        if version > max || (!max_inclusive && version == max) {
            return false;
        }
    }
    true
}

fn language_allowed(language: u32, languages: &[u32], inclusive: bool) -> bool {
    if languages.is_empty() {
        return true;
    }
    let listed = languages.contains(&language);
    if inclusive {
        listed
    } else {
        !listed
    }
}

fn cached_payloads(
    manifest: &BundleManifest,
    package: &Package,
    locations: &CacheLocations,
) -> std::collections::HashSet<String> {
    let Some(folder) =
        locations.find_completed_package_folder(package.per_machine, &package.cache_id)
    else {
        return Default::default();
    };
    manifest
        .package_payloads(package)
        .filter(|payload| !payload.layout_only)
        .filter(|payload| folder.join(&payload.file_path).is_file())
        .map(|payload| payload.id.clone())
        .collect()
}

fn detect_condition_state(
    package_id: &str,
    condition: Option<&str>,
    variables: &Variables,
) -> Result<DetectState, DetectError> {
    match condition {
        None => Ok(DetectState::Absent),
        Some(source) => {
            let parsed = Condition::parse(source).map_err(|source| DetectError::Condition {
                package: package_id.to_owned(),
                source,
            })?;
            Ok(if parsed.evaluate(variables) {
                DetectState::Present
            } else {
                DetectState::Absent
            })
        }
    }
}

fn detect_msi(
    package: &Package,
    detected: &mut DetectedPackage,
    machine: &dyn MachineInspector,
) {
    let Some(msi) = package.as_msi() else { return };

    match machine.find_product(&msi.product_code) {
        Some(product) => {
            detected.installed_version = Some(product.version);
            match product.version.cmp(&msi.version) {
                std::cmp::Ordering::Equal => {
                    detected.state = DetectState::Present;
                    detected.relation = RelationOperation::None;
                }
                std::cmp::Ordering::Less => {
                    // Same product code at an older version: present, and a
                    // minor update is possible.
                    detected.state = DetectState::Present;
                    detected.relation = RelationOperation::MinorUpdate;
                }
                std::cmp::Ordering::Greater => {
                    detected.state = DetectState::Obsolete;
                    detected.relation = RelationOperation::Downgrade;
                }
            }
        }
        None => {
            detected.state = DetectState::Absent;

            // The authored product code is absent; a higher-versioned product
            // owning our provider key is the compatible installed product.
            for provider in &package.providers {
                if let Some(owner) = machine.provider_owner(&provider.key) {
                    if owner.product_code != msi.product_code && owner.version >= msi.version {
                        tracing::debug!(
                            package = %package.id,
                            product = %owner.product_code,
                            "found compatible installed product through provider key"
                        );
                        detected.compatible_product = Some(owner);
                        break;
                    }
                }
            }
        }
    }

    for rule in &msi.related_products {
        for product in machine.related_products(&rule.upgrade_code) {
            if product.product_code == msi.product_code {
                continue;
            }
            if !version_in_range(
                product.version,
                rule.min_version,
                rule.max_version,
                rule.min_inclusive,
                rule.max_inclusive,
            ) {
                continue;
            }
            if !language_allowed(product.language, &rule.languages, rule.languages_inclusive) {
                continue;
            }
            tracing::debug!(
                package = %package.id,
                product = %product.product_code,
                only_detect = rule.only_detect,
                "found related msi product"
            );
            detected.related_products.push(DetectedRelatedProduct {
                product_code: product.product_code,
                version: product.version,
                only_detect: rule.only_detect,
            });
        }
    }

    for feature in &msi.features {
        let state = machine.feature_state(&msi.product_code, &feature.id);
        detected.features.insert(feature.id.clone(), state);
    }
}

fn detect_msp(package: &Package, detected: &mut DetectedPackage, machine: &dyn MachineInspector) {
    let Some(msp) = package.as_msp() else { return };

    for target_code in &msp.target_product_codes {
        let Some(product) = machine.find_product(target_code) else {
            continue;
        };
        let patch_state = machine.patch_state(target_code, &msp.patch_code);
        detected.msp_targets.push(MspTargetDetection {
            product_code: product.product_code,
            product_version: product.version,
            patch_state,
        });
    }

    detected.state = if detected.msp_targets.is_empty() {
        DetectState::Absent
    } else if detected
        .msp_targets
        .iter()
        .any(|t| t.patch_state == PatchApplyState::Applied)
    {
        DetectState::Present
    } else if detected.msp_targets.iter().all(|t| {
        matches!(
            t.patch_state,
            PatchApplyState::Superseded | PatchApplyState::Obsoleted
        )
    }) {
        DetectState::Superseded
    } else {
        DetectState::Absent
    };
}

/// Runs detection for the whole bundle.
pub fn detect(
    manifest: &BundleManifest,
    variables: &mut Variables,
    machine: &dyn MachineInspector,
    registration: &RegistrationStore,
    locations: &CacheLocations,
    ignored_dependencies: &[String],
) -> Result<Detection, DetectError> {
    let per_machine = manifest.chain.iter().any(|p| p.per_machine);

    let mut packages = IndexMap::new();
    for package in &manifest.chain {
        let cached_payloads = cached_payloads(manifest, package, locations);
        let payload_count = manifest
            .package_payloads(package)
            .filter(|payload| !payload.layout_only)
            .count();
        let mut detected = DetectedPackage {
            cached: payload_count > 0 && cached_payloads.len() == payload_count,
            cached_payloads,
            ..Default::default()
        };

        match &package.kind {
            PackageKind::Exe(exe) => {
                detected.state = detect_condition_state(
                    &package.id,
                    exe.detect_condition.as_deref(),
                    variables,
                )?;
            }
            PackageKind::Msu(msu) => {
                detected.state = match (&msu.detect_condition, &msu.kb) {
                    (Some(condition), _) => {
                        detect_condition_state(&package.id, Some(condition), variables)?
                    }
                    (None, Some(kb)) => {
                        if machine.is_update_installed(kb) {
                            DetectState::Present
                        } else {
                            DetectState::Absent
                        }
                    }
                    (None, None) => DetectState::Absent,
                };
            }
            PackageKind::Msi(_) => detect_msi(package, &mut detected, machine),
            PackageKind::Msp(_) => detect_msp(package, &mut detected, machine),
        }

        // A package that is absent but fully cached reports the cached
        // state so planning can skip acquisition.
        if detected.state == DetectState::Absent && detected.cached {
            detected.state = DetectState::Cached;
        }

        tracing::info!(
            package = %package.id,
            state = %detected.state,
            cached = detected.cached,
            "detected package"
        );
        packages.insert(package.id.clone(), detected);
    }

    let registration_state = registration.read_state(&manifest.registration.bundle_id, per_machine);
    let related_bundles =
        registration.detect_related_bundles(&manifest.registration.bundle_id, &manifest.registration.codes);
    let dependents = registration.dependents(
        per_machine,
        &manifest.registration.provider_key,
        ignored_dependencies,
    );

    variables.set_numeric("BundleInstalled", i64::from(registration_state.installed));

    Ok(Detection {
        packages,
        related_bundles,
        dependents,
        registration: registration_state,
        per_machine,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ember_bundle_types::{
        manifest::parse_manifest, BundleVersion, DetectState, RelationOperation, Variables,
    };
    use ember_cache::CacheLocations;

    use super::detect;
    use crate::hive::MemoryHive;
    use crate::machine::{InstalledProduct, MemoryMachine, PatchApplyState};
    use crate::registration::RegistrationStore;

    fn manifest_with_msi(version: &str) -> ember_bundle_types::BundleManifest {
        let text = format!(
            r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{{B1}}" DisplayName="T" ProviderKey="t.bundle" />
  <Payload Id="msiA" FilePath="a.msi" Size="10" />
  <Chain>
    <MsiPackage Id="pkgA" ProductCode="{{P1}}" Version="{version}" UpgradeCode="{{UC}}">
      <PayloadRef Id="msiA" />
      <Provides Key="example.product" />
    </MsiPackage>
  </Chain>
</BundleManifest>"#
        );
        parse_manifest(text.as_bytes()).unwrap()
    }

    fn locations(temp: &tempfile::TempDir) -> CacheLocations {
        CacheLocations::with_roots(temp.path().join("user"), temp.path().join("machine"))
    }

    #[test]
    fn test_msi_absent() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = manifest_with_msi("1.0.0.0");
        let machine = MemoryMachine::new();
        let store = RegistrationStore::new(Arc::new(MemoryHive::new()));
        let mut vars = Variables::new();

        let detection = detect(
            &manifest,
            &mut vars,
            &machine,
            &store,
            &locations(&temp),
            &[],
        )
        .unwrap();
        assert_eq!(detection.package("pkgA").unwrap().state, DetectState::Absent);
        assert_eq!(vars.get_numeric("BundleInstalled").unwrap(), 0);
    }

    #[test]
    fn test_msi_minor_update_relation() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = manifest_with_msi("1.1.0.0");
        let machine = MemoryMachine::new();
        machine.add_product(
            InstalledProduct {
                product_code: "{P1}".to_owned(),
                version: BundleVersion::new(1, 0, 0, 0),
                language: 1033,
                per_machine: false,
            },
            Some("{UC}"),
        );
        let store = RegistrationStore::new(Arc::new(MemoryHive::new()));
        let mut vars = Variables::new();

        let detection = detect(
            &manifest,
            &mut vars,
            &machine,
            &store,
            &locations(&temp),
            &[],
        )
        .unwrap();
        let pkg = detection.package("pkgA").unwrap();
        assert_eq!(pkg.state, DetectState::Present);
        assert_eq!(pkg.relation, RelationOperation::MinorUpdate);
        assert_eq!(pkg.installed_version, Some(BundleVersion::new(1, 0, 0, 0)));
    }

    #[test]
    fn test_msi_downgrade_is_obsolete() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = manifest_with_msi("1.0.0.0");
        let machine = MemoryMachine::new();
        machine.add_product(
            InstalledProduct {
                product_code: "{P1}".to_owned(),
                version: BundleVersion::new(2, 0, 0, 0),
                language: 1033,
                per_machine: false,
            },
            None,
        );
        let store = RegistrationStore::new(Arc::new(MemoryHive::new()));
        let mut vars = Variables::new();

        let detection = detect(
            &manifest,
            &mut vars,
            &machine,
            &store,
            &locations(&temp),
            &[],
        )
        .unwrap();
        let pkg = detection.package("pkgA").unwrap();
        assert_eq!(pkg.state, DetectState::Obsolete);
        assert_eq!(pkg.relation, RelationOperation::Downgrade);
    }

    #[test]
    fn test_compatible_product_via_provider() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = manifest_with_msi("1.0.0.0");
        let machine = MemoryMachine::new();
        // A different product code at a higher version owns our provider key.
        machine.add_product(
            InstalledProduct {
                product_code: "{P2}".to_owned(),
                version: BundleVersion::new(3, 0, 0, 0),
                language: 1033,
                per_machine: false,
            },
            None,
        );
        machine.set_provider_owner("example.product", "{P2}");
        let store = RegistrationStore::new(Arc::new(MemoryHive::new()));
        let mut vars = Variables::new();

        let detection = detect(
            &manifest,
            &mut vars,
            &machine,
            &store,
            &locations(&temp),
            &[],
        )
        .unwrap();
        let pkg = detection.package("pkgA").unwrap();
        assert_eq!(pkg.state, DetectState::Absent);
        assert_eq!(
            pkg.compatible_product.as_ref().map(|p| p.product_code.as_str()),
            Some("{P2}")
        );
    }

    #[test]
    fn test_cached_state() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = manifest_with_msi("1.0.0.0");
        // Pre-populate the per-user cache with the package payload.
        let folder = temp.path().join("user").join("pkgA");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("a.msi"), b"msi").unwrap();

        let machine = MemoryMachine::new();
        let store = RegistrationStore::new(Arc::new(MemoryHive::new()));
        let mut vars = Variables::new();

        let detection = detect(
            &manifest,
            &mut vars,
            &machine,
            &store,
            &locations(&temp),
            &[],
        )
        .unwrap();
        assert_eq!(detection.package("pkgA").unwrap().state, DetectState::Cached);
    }

    #[test]
    fn test_msp_superseded() {
        let temp = tempfile::tempdir().unwrap();
        let text = r#"<BundleManifest Version="1.0.0.0">
  <Registration Id="{B1}" DisplayName="T" ProviderKey="t.bundle" />
  <Payload Id="mspA" FilePath="a.msp" Size="5" />
  <Chain>
    <MspPackage Id="patchA" PatchCode="{PA}">
      <PayloadRef Id="mspA" />
      <TargetCode Id="{P1}" />
    </MspPackage>
  </Chain>
</BundleManifest>"#;
        let manifest = parse_manifest(text.as_bytes()).unwrap();

        let machine = MemoryMachine::new();
        machine.add_product(
            InstalledProduct {
                product_code: "{P1}".to_owned(),
                version: BundleVersion::new(1, 0, 0, 0),
                language: 1033,
                per_machine: false,
            },
            None,
        );
        machine.set_patch_state("{P1}", "{PA}", PatchApplyState::Superseded);

        let store = RegistrationStore::new(Arc::new(MemoryHive::new()));
        let mut vars = Variables::new();
        let detection = detect(
            &manifest,
            &mut vars,
            &machine,
            &store,
            &locations(&temp),
            &[],
        )
        .unwrap();
        assert_eq!(
            detection.package("patchA").unwrap().state,
            DetectState::Superseded
        );
    }
}
