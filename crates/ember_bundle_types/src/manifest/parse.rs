//! Parses the builder-produced bundle manifest XML into the
//! [`BundleManifest`] graph. The manifest is UTF-8 or UTF-16 with a byte
//! order mark; element and attribute names are the stable contract with the
//! builder. Unknown elements are skipped with a debug log so newer builders
//! stay loadable.

use std::collections::HashMap;

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::{
    BundleManifest, Container, DependencyProvider, ExePackage, ExeProtocol, ExitCodeBehavior,
    ExitCodeMapping, ModifyDisposition, MsiFeature, MsiPackage, MsiProperty, MspPackage,
    MsuPackage, Package, PackageKind, Payload, RegistrationInfo, RelatedMsiProduct,
    RollbackBoundary, VariableDeclaration,
};
use crate::{
    related::RelatedBundleCodes,
    search::{MsiComponentResult, MsiProductResult, RegistryRoot, Search, SearchKind},
    state::{CachePolicy, Packaging, RelatedBundleKind},
    variable::VariantValue,
    version::BundleVersion,
};
use ember_digest::Sha1;

/// An error produced while parsing a manifest.
#[derive(Debug, Error)]
pub enum ManifestParseError {
    /// The XML was malformed.
    #[error("malformed manifest xml")]
    Xml(#[from] quick_xml::Error),

    /// An attribute was malformed.
    #[error("malformed manifest attribute")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    /// The manifest bytes were not valid UTF-8 or BOM-marked UTF-16.
    #[error("manifest is not valid utf-8 or utf-16 text")]
    Encoding,

    /// A required attribute was missing.
    #[error("element '{element}' is missing required attribute '{attribute}'")]
    MissingAttribute {
        /// The element name.
        element: String,
        /// The attribute name.
        attribute: &'static str,
    },

    /// An attribute value could not be interpreted.
    #[error("element '{element}' attribute '{attribute}' has invalid value '{value}'")]
    InvalidAttribute {
        /// The element name.
        element: String,
        /// The attribute name.
        attribute: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Two objects of the same kind share an id.
    #[error("duplicate id '{0}' in manifest")]
    DuplicateId(String),

    /// An object references an id that is not defined.
    #[error("'{referrer}' references unknown {kind} '{id}'")]
    DanglingReference {
        /// The id of the referencing object.
        referrer: String,
        /// What kind of object was referenced.
        kind: &'static str,
        /// The missing id.
        id: String,
    },

    /// The manifest has no `Registration` element.
    #[error("manifest has no Registration element")]
    MissingRegistration,

    /// An attached container did not carry its attachment index.
    #[error("attached container '{0}' has no AttachedIndex")]
    AttachedIndexMissing(String),
}

/// Decodes manifest bytes: UTF-16 (either endianness, BOM required) or
/// UTF-8 (BOM optional).
pub fn decode_manifest_bytes(bytes: &[u8]) -> Result<String, ManifestParseError> {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).map_err(|_| ManifestParseError::Encoding)
        }
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).map_err(|_| ManifestParseError::Encoding)
        }
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8(rest.to_vec())
            .map_err(|_| ManifestParseError::Encoding),
        _ => String::from_utf8(bytes.to_vec()).map_err(|_| ManifestParseError::Encoding),
    }
}

/// Parses manifest bytes into the object graph.
pub fn parse_manifest(bytes: &[u8]) -> Result<BundleManifest, ManifestParseError> {
    let text = decode_manifest_bytes(bytes)?;
    parse_manifest_str(&text)
}

struct Attrs {
    element: String,
    values: HashMap<String, String>,
}

impl Attrs {
    fn read(e: &BytesStart<'_>) -> Result<Self, ManifestParseError> {
        let element = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut values = HashMap::new();
        for attr in e.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            values.insert(key, value);
        }
        Ok(Self { element, values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn required(&self, name: &'static str) -> Result<String, ManifestParseError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| ManifestParseError::MissingAttribute {
                element: self.element.clone(),
                attribute: name,
            })
    }

    fn invalid(&self, name: &'static str, value: &str) -> ManifestParseError {
        ManifestParseError::InvalidAttribute {
            element: self.element.clone(),
            attribute: name,
            value: value.to_owned(),
        }
    }

    fn bool(&self, name: &'static str, default: bool) -> Result<bool, ManifestParseError> {
        match self.get(name) {
            None => Ok(default),
            Some(value) => match value {
                "yes" | "true" | "1" => Ok(true),
                "no" | "false" | "0" => Ok(false),
                other => Err(self.invalid(name, other)),
            },
        }
    }

    fn u64(&self, name: &'static str, default: u64) -> Result<u64, ManifestParseError> {
        match self.get(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| self.invalid(name, value)),
        }
    }

    fn u32_opt(&self, name: &'static str) -> Result<Option<u32>, ManifestParseError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(name, value)),
        }
    }

    fn version(&self, name: &'static str) -> Result<Option<BundleVersion>, ManifestParseError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(name, value)),
        }
    }

    fn hash(&self, name: &'static str) -> Result<Option<ember_digest::Sha1Hash>, ManifestParseError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => ember_digest::parse_digest_from_hex::<Sha1>(value)
                .map(Some)
                .ok_or_else(|| self.invalid(name, value)),
        }
    }

    fn url(&self, name: &'static str) -> Result<Option<url::Url>, ManifestParseError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(name, value)),
        }
    }
}

#[derive(Default)]
struct PackageCommon {
    id: String,
    per_machine: bool,
    permanent: bool,
    vital: bool,
    cache_id: String,
    cache_policy: CachePolicy,
    install_size: u64,
    payload_refs: Vec<String>,
    providers: Vec<DependencyProvider>,
    rollback_boundary_forward: Option<String>,
    rollback_boundary_backward: Option<String>,
    install_condition: Option<String>,
}

impl PackageCommon {
    fn read(attrs: &Attrs) -> Result<Self, ManifestParseError> {
        let id = attrs.required("Id")?;
        let cache_policy = match attrs.get("Cache") {
            None | Some("yes") | Some("keep") => CachePolicy::Yes,
            Some("no") | Some("remove") => CachePolicy::No,
            Some("always") | Some("force") => CachePolicy::Always,
            Some(other) => return Err(attrs.invalid("Cache", other)),
        };
        Ok(Self {
            cache_id: attrs.get("CacheId").unwrap_or(&id).to_owned(),
            per_machine: attrs.bool("PerMachine", false)?,
            permanent: attrs.bool("Permanent", false)?,
            vital: attrs.bool("Vital", true)?,
            cache_policy,
            install_size: attrs.u64("InstallSize", 0)?,
            payload_refs: Vec::new(),
            providers: Vec::new(),
            rollback_boundary_forward: attrs.get("RollbackBoundaryForward").map(str::to_owned),
            rollback_boundary_backward: attrs.get("RollbackBoundaryBackward").map(str::to_owned),
            install_condition: attrs.get("InstallCondition").map(str::to_owned),
            id,
        })
    }

    fn finish(self, kind: PackageKind) -> Package {
        Package {
            id: self.id,
            per_machine: self.per_machine,
            permanent: self.permanent,
            vital: self.vital,
            cache_id: self.cache_id,
            cache_policy: self.cache_policy,
            install_size: self.install_size,
            payload_refs: self.payload_refs,
            providers: self.providers,
            rollback_boundary_forward: self.rollback_boundary_forward,
            rollback_boundary_backward: self.rollback_boundary_backward,
            install_condition: self.install_condition,
            kind,
        }
    }
}

enum PackageBody {
    Exe(ExePackage),
    Msi(MsiPackage),
    Msp(MspPackage),
    Msu(MsuPackage),
}

struct PartialPackage {
    common: PackageCommon,
    body: PackageBody,
}

#[derive(Default)]
struct ParseState {
    registration: Option<RegistrationInfo>,
    version: Option<BundleVersion>,
    parallel_cache: bool,
    variables: Vec<VariableDeclaration>,
    searches: Vec<Search>,
    containers: IndexMap<String, Container>,
    payloads: IndexMap<String, Payload>,
    rollback_boundaries: IndexMap<String, RollbackBoundary>,
    chain: Vec<Package>,
    current_package: Option<PartialPackage>,
    current_related: Option<RelatedMsiProduct>,
}

fn parse_manifest_str(text: &str) -> Result<BundleManifest, ManifestParseError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut state = ParseState::default();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let attrs = Attrs::read(&e)?;
                handle_element(&mut state, attrs)?;
            }
            Event::Empty(e) => {
                let attrs = Attrs::read(&e)?;
                handle_element(&mut state, attrs)?;
                // Self-closing package or related-product elements close
                // immediately.
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                handle_end(&mut state, &name);
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                handle_end(&mut state, &name);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let registration = state
        .registration
        .ok_or(ManifestParseError::MissingRegistration)?;

    let manifest = BundleManifest {
        registration,
        version: state.version.unwrap_or_default(),
        parallel_cache: state.parallel_cache,
        variables: state.variables,
        searches: state.searches,
        containers: state.containers,
        payloads: state.payloads,
        rollback_boundaries: state.rollback_boundaries,
        chain: state.chain,
    };
    validate(&manifest)?;
    Ok(manifest)
}

fn handle_end(state: &mut ParseState, name: &str) {
    match name {
        "ExePackage" | "MsiPackage" | "MspPackage" | "MsuPackage" => {
            if let Some(partial) = state.current_package.take() {
                let kind = match partial.body {
                    PackageBody::Exe(exe) => PackageKind::Exe(exe),
                    PackageBody::Msi(msi) => PackageKind::Msi(msi),
                    PackageBody::Msp(msp) => PackageKind::Msp(msp),
                    PackageBody::Msu(msu) => PackageKind::Msu(msu),
                };
                state.chain.push(partial.common.finish(kind));
            }
        }
        "RelatedPackage" => {
            if let Some(related) = state.current_related.take() {
                if let Some(PartialPackage {
                    body: PackageBody::Msi(msi),
                    ..
                }) = state.current_package.as_mut()
                {
                    msi.related_products.push(related);
                }
            }
        }
        _ => {}
    }
}

fn handle_element(state: &mut ParseState, attrs: Attrs) -> Result<(), ManifestParseError> {
    match attrs.element.as_str() {
        "BundleManifest" => {
            state.version = attrs.version("Version")?;
            state.parallel_cache = attrs.bool("ParallelCache", false)?;
        }
        "Registration" => {
            let modify = match attrs.get("DisableModify") {
                None | Some("no") => ModifyDisposition::Enabled,
                Some("button") => ModifyDisposition::HideButton,
                Some("yes") => ModifyDisposition::Disabled,
                Some(other) => return Err(attrs.invalid("DisableModify", other)),
            };
            state.registration = Some(RegistrationInfo {
                bundle_id: attrs.required("Id")?,
                display_name: attrs.required("DisplayName")?,
                publisher: attrs.get("Publisher").map(str::to_owned),
                provider_key: attrs.required("ProviderKey")?,
                tag: attrs.get("Tag").map(str::to_owned),
                modify,
                disable_remove: attrs.bool("DisableRemove", false)?,
                codes: RelatedBundleCodes::default(),
            });
        }
        "RelatedBundle" => {
            let id = attrs.required("Id")?;
            let action = attrs.required("Action")?;
            let kind = match action.as_str() {
                "Upgrade" => RelatedBundleKind::Upgrade,
                "Detect" => RelatedBundleKind::Detect,
                "Addon" => RelatedBundleKind::Addon,
                "Patch" => RelatedBundleKind::Patch,
                other => return Err(attrs.invalid("Action", other)),
            };
            let registration = state
                .registration
                .as_mut()
                .ok_or(ManifestParseError::MissingRegistration)?;
            match kind {
                RelatedBundleKind::Upgrade => registration.codes.upgrade.push(id),
                RelatedBundleKind::Detect => registration.codes.detect.push(id),
                RelatedBundleKind::Addon => registration.codes.addon.push(id),
                RelatedBundleKind::Patch => registration.codes.patch.push(id),
                RelatedBundleKind::Dependent => unreachable!(),
            }
        }
        "Variable" => {
            let name = attrs.required("Id")?;
            let raw = attrs.get("Value").unwrap_or_default().to_owned();
            let value = match attrs.get("Type") {
                None | Some("string") => {
                    if raw.is_empty() {
                        VariantValue::None
                    } else {
                        VariantValue::String(raw)
                    }
                }
                Some("numeric") => VariantValue::Numeric(
                    raw.parse().map_err(|_| attrs.invalid("Value", &raw))?,
                ),
                Some("version") => VariantValue::Version(
                    raw.parse().map_err(|_| attrs.invalid("Value", &raw))?,
                ),
                Some(other) => return Err(attrs.invalid("Type", other)),
            };
            state.variables.push(VariableDeclaration {
                name,
                value,
                hidden: attrs.bool("Hidden", false)?,
                persisted: attrs.bool("Persisted", false)?,
            });
        }
        "DirectorySearch" | "FileSearch" | "RegistrySearch" | "MsiComponentSearch"
        | "MsiProductSearch" | "MsiFeatureSearch" => {
            state.searches.push(parse_search(&attrs)?);
        }
        "Container" => {
            let id = attrs.required("Id")?;
            let attached = attrs.bool("Attached", false)?;
            let attached_index = attrs.u32_opt("AttachedIndex")?;
            if attached && attached_index.is_none() {
                return Err(ManifestParseError::AttachedIndexMissing(id));
            }
            let file_path = attrs.required("FilePath")?;
            let container = Container {
                attached,
                attached_index,
                source_path: attrs.get("SourcePath").unwrap_or(&file_path).into(),
                file_path: file_path.into(),
                hash: attrs.hash("Hash")?,
                size: attrs.u64("Size", 0)?,
                download_url: attrs.url("DownloadUrl")?,
                id: id.clone(),
            };
            if state.containers.insert(id.clone(), container).is_some() {
                return Err(ManifestParseError::DuplicateId(id));
            }
        }
        "Payload" => {
            let id = attrs.required("Id")?;
            let packaging = match attrs.get("Packaging") {
                None | Some("external") => Packaging::External,
                Some("embedded") => Packaging::Embedded,
                Some("download") => Packaging::Download,
                Some(other) => return Err(attrs.invalid("Packaging", other)),
            };
            let file_path = attrs.required("FilePath")?;
            let payload = Payload {
                packaging,
                container: attrs.get("Container").map(str::to_owned),
                source_path: attrs.get("SourcePath").unwrap_or(&file_path).into(),
                file_path: file_path.into(),
                hash: attrs.hash("Hash")?,
                size: attrs.u64("Size", 0)?,
                download_url: attrs.url("DownloadUrl")?,
                catalog: attrs.get("Catalog").map(str::to_owned),
                certificate_root_public_key_id: attrs
                    .get("CertificateRootPublicKeyIdentifier")
                    .map(str::to_owned),
                certificate_thumbprint: attrs
                    .get("CertificateRootThumbprint")
                    .map(str::to_owned),
                layout_only: attrs.bool("LayoutOnly", false)?,
                id: id.clone(),
            };
            if state.payloads.insert(id.clone(), payload).is_some() {
                return Err(ManifestParseError::DuplicateId(id));
            }
        }
        "RollbackBoundary" => {
            let id = attrs.required("Id")?;
            let boundary = RollbackBoundary {
                id: id.clone(),
                vital: attrs.bool("Vital", true)?,
            };
            if state
                .rollback_boundaries
                .insert(id.clone(), boundary)
                .is_some()
            {
                return Err(ManifestParseError::DuplicateId(id));
            }
        }
        "Chain" => {
            state.parallel_cache = attrs.bool("ParallelCache", state.parallel_cache)?;
        }
        "ExePackage" => {
            let common = PackageCommon::read(&attrs)?;
            let protocol = match attrs.get("Protocol") {
                None | Some("none") => ExeProtocol::None,
                Some("burn") => ExeProtocol::Burn,
                Some(other) => return Err(attrs.invalid("Protocol", other)),
            };
            state.current_package = Some(PartialPackage {
                common,
                body: PackageBody::Exe(ExePackage {
                    detect_condition: attrs.get("DetectCondition").map(str::to_owned),
                    install_arguments: attrs.get("InstallArguments").map(str::to_owned),
                    repair_arguments: attrs.get("RepairArguments").map(str::to_owned),
                    uninstall_arguments: attrs.get("UninstallArguments").map(str::to_owned),
                    protocol,
                    exit_codes: Vec::new(),
                }),
            });
        }
        "MsiPackage" => {
            let common = PackageCommon::read(&attrs)?;
            let version = attrs
                .version("Version")?
                .ok_or_else(|| ManifestParseError::MissingAttribute {
                    element: attrs.element.clone(),
                    attribute: "Version",
                })?;
            state.current_package = Some(PartialPackage {
                common,
                body: PackageBody::Msi(MsiPackage {
                    product_code: attrs.required("ProductCode")?,
                    language: attrs.u32_opt("Language")?.unwrap_or(0),
                    version,
                    upgrade_code: attrs.get("UpgradeCode").map(str::to_owned),
                    features: Vec::new(),
                    properties: Vec::new(),
                    related_products: Vec::new(),
                    slipstream_msps: Vec::new(),
                }),
            });
        }
        "MspPackage" => {
            let common = PackageCommon::read(&attrs)?;
            state.current_package = Some(PartialPackage {
                common,
                body: PackageBody::Msp(MspPackage {
                    patch_code: attrs.required("PatchCode")?,
                    target_product_codes: Vec::new(),
                    properties: Vec::new(),
                }),
            });
        }
        "MsuPackage" => {
            let common = PackageCommon::read(&attrs)?;
            state.current_package = Some(PartialPackage {
                common,
                body: PackageBody::Msu(MsuPackage {
                    detect_condition: attrs.get("DetectCondition").map(str::to_owned),
                    kb: attrs.get("KB").map(str::to_owned),
                }),
            });
        }
        // Package children.
        "PayloadRef" => {
            if let Some(partial) = state.current_package.as_mut() {
                partial.common.payload_refs.push(attrs.required("Id")?);
            }
        }
        "Provides" => {
            if let Some(partial) = state.current_package.as_mut() {
                partial.common.providers.push(DependencyProvider {
                    key: attrs.required("Key")?,
                    version: attrs.version("Version")?,
                    display_name: attrs.get("DisplayName").map(str::to_owned),
                    imported: attrs.bool("Imported", false)?,
                });
            }
        }
        "ExitCode" => {
            if let Some(PartialPackage {
                body: PackageBody::Exe(exe),
                ..
            }) = state.current_package.as_mut()
            {
                let behavior = match attrs.get("Behavior") {
                    None | Some("success") => ExitCodeBehavior::Success,
                    Some("error") => ExitCodeBehavior::Error,
                    Some("scheduleReboot") => ExitCodeBehavior::ScheduleReboot,
                    Some("forceReboot") => ExitCodeBehavior::ForceReboot,
                    Some(other) => return Err(attrs.invalid("Behavior", other)),
                };
                let code = match attrs.get("Value") {
                    None => None,
                    Some(value) => Some(
                        value
                            .parse()
                            .map_err(|_| attrs.invalid("Value", value))?,
                    ),
                };
                exe.exit_codes.push(ExitCodeMapping { code, behavior });
            }
        }
        "Feature" => {
            if let Some(PartialPackage {
                body: PackageBody::Msi(msi),
                ..
            }) = state.current_package.as_mut()
            {
                msi.features.push(MsiFeature {
                    id: attrs.required("Id")?,
                    add_local_condition: attrs.get("AddLocalCondition").map(str::to_owned),
                    add_source_condition: attrs.get("AddSourceCondition").map(str::to_owned),
                });
            }
        }
        "MsiProperty" => {
            if let Some(partial) = state.current_package.as_mut() {
                let property = MsiProperty {
                    id: attrs.required("Id")?,
                    value: attrs.required("Value")?,
                };
                match &mut partial.body {
                    PackageBody::Msi(msi) => msi.properties.push(property),
                    PackageBody::Msp(msp) => msp.properties.push(property),
                    _ => {}
                }
            }
        }
        "RelatedPackage" => {
            if matches!(
                state.current_package.as_ref().map(|p| &p.body),
                Some(PackageBody::Msi(_))
            ) {
                state.current_related = Some(RelatedMsiProduct {
                    upgrade_code: attrs.required("UpgradeCode")?,
                    min_version: attrs.version("MinVersion")?,
                    max_version: attrs.version("MaxVersion")?,
                    min_inclusive: attrs.bool("MinInclusive", true)?,
                    max_inclusive: attrs.bool("MaxInclusive", false)?,
                    languages: Vec::new(),
                    languages_inclusive: attrs.bool("LangInclusive", true)?,
                    only_detect: attrs.bool("OnlyDetect", false)?,
                });
            }
        }
        "Language" => {
            if let Some(related) = state.current_related.as_mut() {
                let id = attrs.required("Id")?;
                related
                    .languages
                    .push(id.parse().map_err(|_| attrs.invalid("Id", &id))?);
            }
        }
        "SlipstreamMsp" => {
            if let Some(PartialPackage {
                body: PackageBody::Msi(msi),
                ..
            }) = state.current_package.as_mut()
            {
                msi.slipstream_msps.push(attrs.required("Id")?);
            }
        }
        "TargetCode" => {
            if let Some(PartialPackage {
                body: PackageBody::Msp(msp),
                ..
            }) = state.current_package.as_mut()
            {
                msp.target_product_codes.push(attrs.required("Id")?);
            }
        }
        other => {
            tracing::debug!(element = other, "skipping unknown manifest element");
        }
    }
    Ok(())
}

fn parse_search(attrs: &Attrs) -> Result<Search, ManifestParseError> {
    let id = attrs.required("Id")?;
    let variable = attrs.required("Variable")?;
    let condition = attrs.get("Condition").map(str::to_owned);

    let kind = match attrs.element.as_str() {
        "DirectorySearch" => SearchKind::DirectoryExists {
            path: attrs.required("Path")?,
        },
        "FileSearch" => match attrs.get("Result") {
            None | Some("exists") => SearchKind::FileExists {
                path: attrs.required("Path")?,
            },
            Some("version") => SearchKind::FileVersion {
                path: attrs.required("Path")?,
            },
            Some(other) => return Err(attrs.invalid("Result", other)),
        },
        "RegistrySearch" => {
            let root = match attrs.required("Root")?.as_str() {
                "HKLM" => RegistryRoot::LocalMachine,
                "HKCU" => RegistryRoot::CurrentUser,
                "HKCR" => RegistryRoot::ClassesRoot,
                "HKU" => RegistryRoot::Users,
                other => return Err(attrs.invalid("Root", other)),
            };
            let key = attrs.required("Key")?;
            let value = attrs.get("Value").map(str::to_owned);
            match attrs.get("Result") {
                None | Some("exists") => SearchKind::RegistryExists { root, key, value },
                Some("value") => SearchKind::RegistryValue {
                    root,
                    key,
                    value,
                    expand: attrs.bool("ExpandEnvironment", false)?,
                },
                Some(other) => return Err(attrs.invalid("Result", other)),
            }
        }
        "MsiComponentSearch" => {
            let result = match attrs.get("Result") {
                None | Some("state") => MsiComponentResult::State,
                Some("keyPath") => MsiComponentResult::KeyPath,
                Some("directory") => MsiComponentResult::Directory,
                Some(other) => return Err(attrs.invalid("Result", other)),
            };
            SearchKind::MsiComponent {
                component_id: attrs.required("ComponentId")?,
                product_code: attrs.get("ProductCode").map(str::to_owned),
                result,
            }
        }
        "MsiProductSearch" => {
            let result = match attrs.get("Result") {
                None | Some("version") => MsiProductResult::Version,
                Some("language") => MsiProductResult::Language,
                Some("state") => MsiProductResult::State,
                Some("assignment") => MsiProductResult::Assignment,
                Some(other) => return Err(attrs.invalid("Result", other)),
            };
            SearchKind::MsiProduct {
                product_code: attrs.required("ProductCode")?,
                result,
            }
        }
        "MsiFeatureSearch" => SearchKind::MsiFeature {
            product_code: attrs.required("ProductCode")?,
            feature_id: attrs.required("FeatureId")?,
        },
        other => {
            return Err(ManifestParseError::InvalidAttribute {
                element: other.to_owned(),
                attribute: "element",
                value: other.to_owned(),
            })
        }
    };

    Ok(Search {
        id,
        variable,
        condition,
        kind,
    })
}

fn validate(manifest: &BundleManifest) -> Result<(), ManifestParseError> {
    let mut package_ids = HashMap::new();
    for package in &manifest.chain {
        if package_ids.insert(package.id.as_str(), ()).is_some() {
            return Err(ManifestParseError::DuplicateId(package.id.clone()));
        }
        for payload_id in &package.payload_refs {
            if !manifest.payloads.contains_key(payload_id) {
                return Err(ManifestParseError::DanglingReference {
                    referrer: package.id.clone(),
                    kind: "payload",
                    id: payload_id.clone(),
                });
            }
        }
        for boundary in package
            .rollback_boundary_forward
            .iter()
            .chain(package.rollback_boundary_backward.iter())
        {
            if !manifest.rollback_boundaries.contains_key(boundary) {
                return Err(ManifestParseError::DanglingReference {
                    referrer: package.id.clone(),
                    kind: "rollback boundary",
                    id: boundary.clone(),
                });
            }
        }
        if let PackageKind::Msi(msi) = &package.kind {
            for msp_id in &msi.slipstream_msps {
                if !manifest.chain.iter().any(|p| &p.id == msp_id) {
                    return Err(ManifestParseError::DanglingReference {
                        referrer: package.id.clone(),
                        kind: "slipstream package",
                        id: msp_id.clone(),
                    });
                }
            }
        }
    }
    for payload in manifest.payloads.values() {
        if let Some(container_id) = &payload.container {
            if !manifest.containers.contains_key(container_id) {
                return Err(ManifestParseError::DanglingReference {
                    referrer: payload.id.clone(),
                    kind: "container",
                    id: container_id.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{decode_manifest_bytes, parse_manifest, ManifestParseError};
    use crate::{
        manifest::PackageKind,
        state::Packaging,
        version::BundleVersion,
    };

    const MANIFEST: &str = r#"<?xml version="1.0"?>
<BundleManifest Version="1.0.0.0">
  <Registration Id="{11111111-2222-3333-4444-555555555555}" DisplayName="Test Bundle"
                Publisher="Example" ProviderKey="test.bundle" />
  <RelatedBundle Id="{AAAAAAAA-0000-0000-0000-000000000000}" Action="Upgrade" />
  <Variable Id="InstallLevel" Type="numeric" Value="3" />
  <Container Id="cab1" Attached="yes" AttachedIndex="0" FilePath="bundle.cab"
             Hash="943a702d06f34599aee1f8da8ef9f7296031d699" Size="100" />
  <Payload Id="msiA" FilePath="a.msi" Packaging="embedded" Container="cab1"
           Hash="01b307acba4f54f55aafc33bb06bbbf6ca803e9a" Size="10" />
  <RollbackBoundary Id="bnd0" Vital="yes" />
  <Chain ParallelCache="yes">
    <MsiPackage Id="pkgA" ProductCode="{0BAD0BAD-0000-0000-0000-000000000001}"
                Version="1.0.0.0" CacheId="pkgA-v1" Vital="yes"
                RollbackBoundaryForward="bnd0">
      <PayloadRef Id="msiA" />
      <Provides Key="example.product" Version="1.0.0.0" />
    </MsiPackage>
  </Chain>
</BundleManifest>
"#;

    #[test]
    fn test_parse_roundtrip() {
        let manifest = parse_manifest(MANIFEST.as_bytes()).unwrap();
        assert_eq!(manifest.version, BundleVersion::new(1, 0, 0, 0));
        assert!(manifest.parallel_cache);
        assert_eq!(manifest.registration.display_name, "Test Bundle");
        assert_eq!(manifest.registration.codes.upgrade.len(), 1);
        assert_eq!(manifest.chain.len(), 1);

        let package = &manifest.chain[0];
        assert_eq!(package.cache_id, "pkgA-v1");
        assert_eq!(package.payload_refs, vec!["msiA".to_string()]);
        assert_matches!(&package.kind, PackageKind::Msi(msi) => {
            assert_eq!(msi.version, BundleVersion::new(1, 0, 0, 0));
        });

        let payload = manifest.payload("msiA").unwrap();
        assert_eq!(payload.packaging, Packaging::Embedded);
        assert_eq!(payload.container.as_deref(), Some("cab1"));
    }

    #[test]
    fn test_parse_utf16() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in MANIFEST.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let manifest = parse_manifest(&bytes).unwrap();
        assert_eq!(manifest.chain.len(), 1);
    }

    #[test]
    fn test_dangling_payload_ref() {
        let text = MANIFEST.replace("PayloadRef Id=\"msiA\"", "PayloadRef Id=\"nope\"");
        assert_matches!(
            parse_manifest(text.as_bytes()),
            Err(ManifestParseError::DanglingReference { kind: "payload", .. })
        );
    }

    #[test]
    fn test_attached_container_needs_index() {
        let text = MANIFEST.replace(" AttachedIndex=\"0\"", "");
        assert_matches!(
            parse_manifest(text.as_bytes()),
            Err(ManifestParseError::AttachedIndexMissing(_))
        );
    }

    #[test]
    fn test_missing_registration() {
        let text = "<BundleManifest Version=\"1.0\"></BundleManifest>";
        assert_matches!(
            parse_manifest(text.as_bytes()),
            Err(ManifestParseError::MissingRegistration)
        );
    }

    #[test]
    fn test_decode_rejects_binary() {
        assert_matches!(
            decode_manifest_bytes(&[0x00, 0x9F, 0x92, 0x96]),
            Err(ManifestParseError::Encoding)
        );
    }
}
