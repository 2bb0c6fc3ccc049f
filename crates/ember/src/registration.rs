//! The bundle's persisted registration: the add/remove-programs record,
//! resume bookkeeping, the volatile reboot marker, related-bundle discovery,
//! and the reference-counted dependency provider records.
//!
//! All writes go through the [`Hive`] seam. Only the elevated side of a
//! split process writes per-machine scope; the primary side forwards its
//! intent over the pipe, so nothing here assumes shared memory with the
//! elevated process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use ember_bundle_types::{
    manifest::{DependencyProvider, RegistrationInfo},
    BundleVersion, RelatedBundleCodes, RelatedBundleKind, ResumeType,
};

use crate::hive::{Hive, HiveError, HiveExt, HiveScope};

/// Registry path of the uninstall records, relative to the scope root.
pub const UNINSTALL_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Uninstall";

/// Registry path of the run-once resume entries.
pub const RUN_ONCE_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\RunOnce";

/// Registry path of the dependency provider records.
pub const DEPENDENCIES_KEY: &str = r"Software\Classes\Installer\Dependencies";

/// The switch appended to the cached bundle path in the run-once entry.
pub const RUN_ONCE_SWITCH: &str = "/burn.runonce";

mod value_names {
    pub const DISPLAY_NAME: &str = "DisplayName";
    pub const DISPLAY_VERSION: &str = "DisplayVersion";
    pub const PUBLISHER: &str = "Publisher";
    pub const VERSION: &str = "Version";
    pub const VERSION_MAJOR: &str = "VersionMajor";
    pub const VERSION_MINOR: &str = "VersionMinor";
    pub const UPGRADE_CODE: &str = "BundleUpgradeCode";
    pub const ADDON_CODE: &str = "BundleAddonCode";
    pub const DETECT_CODE: &str = "BundleDetectCode";
    pub const PATCH_CODE: &str = "BundlePatchCode";
    pub const CACHE_PATH: &str = "BundleCachePath";
    pub const PROVIDER_KEY: &str = "BundleProviderKey";
    pub const TAG: &str = "BundleTag";
    pub const ENGINE_VERSION: &str = "EngineVersion";
    pub const RESUME: &str = "Resume";
    pub const RESUME_COMMAND_LINE: &str = "BundleResumeCommandLine";
    pub const QUIET_UNINSTALL_STRING: &str = "QuietUninstallString";
    pub const UNINSTALL_STRING: &str = "UninstallString";
    pub const MODIFY_PATH: &str = "ModifyPath";
    pub const ESTIMATED_SIZE: &str = "EstimatedSize";
    pub const INSTALLED: &str = "Installed";
    pub const NO_MODIFY: &str = "NoModify";
    pub const NO_REMOVE: &str = "NoRemove";
}

const RESUME_NONE: u64 = 0;
const RESUME_ACTIVE: u64 = 1;
const RESUME_SUSPEND: u64 = 2;
const RESUME_ARP: u64 = 3;

/// An error from the registration store.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The hive backend failed.
    #[error(transparent)]
    Hive(#[from] HiveError),
}

/// What a startup read of the registration found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationState {
    /// The resume classification for this run.
    pub resume: ResumeType,
    /// Whether the bundle is registered as installed.
    pub installed: bool,
}

/// Another bundle's uninstall record, as read during related-bundle
/// discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedBundleRegistration {
    /// The other bundle's id (its uninstall subkey name).
    pub bundle_id: String,
    /// How the other bundle relates to ours.
    pub kind: RelatedBundleKind,
    /// The scope the record was found in.
    pub per_machine: bool,
    /// The other bundle's version.
    pub version: BundleVersion,
    /// Display name, when registered.
    pub display_name: Option<String>,
    /// The other bundle's provider key, when registered.
    pub provider_key: Option<String>,
    /// Cached bundle executable path, when registered.
    pub cache_path: Option<PathBuf>,
    /// The registered quiet uninstall command.
    pub quiet_uninstall_string: Option<String>,
    /// The other bundle's own code lists.
    pub codes: RelatedBundleCodes,
}

/// The input to [`RegistrationStore::begin_session`].
#[derive(Debug, Clone)]
pub struct SessionInfo<'a> {
    /// Registration metadata from the manifest.
    pub registration: &'a RegistrationInfo,
    /// The bundle version.
    pub version: BundleVersion,
    /// Whether any scheduled package is per-machine.
    pub per_machine: bool,
    /// Path of the cached bundle executable.
    pub cache_path: &'a Path,
    /// Command line that resumes this apply.
    pub resume_command_line: &'a str,
    /// Estimated installed size in bytes.
    pub estimated_size: u64,
    /// The engine version string written into the record.
    pub engine_version: &'a str,
}

/// Reads and writes the bundle's persisted registration.
#[derive(Clone)]
pub struct RegistrationStore {
    hive: Arc<dyn Hive>,
}

impl RegistrationStore {
    /// A store over the given hive.
    pub fn new(hive: Arc<dyn Hive>) -> Self {
        Self { hive }
    }

    /// The hive this store writes through.
    pub fn hive(&self) -> &Arc<dyn Hive> {
        &self.hive
    }

    fn uninstall_key(bundle_id: &str) -> String {
        format!(r"{UNINSTALL_KEY}\{bundle_id}")
    }

    fn reboot_marker_key(bundle_id: &str) -> String {
        format!(r"{UNINSTALL_KEY}\{bundle_id}.RebootRequired")
    }

    /// Classifies this run from the persisted resume value and the volatile
    /// reboot marker.
    pub fn read_state(&self, bundle_id: &str, per_machine: bool) -> RegistrationState {
        let scope = HiveScope::from_per_machine(per_machine);
        let key = Self::uninstall_key(bundle_id);

        let installed = self
            .hive
            .get_number(scope, &key, value_names::INSTALLED)
            .unwrap_or(0)
            != 0;

        if self
            .hive
            .key_exists(scope, &Self::reboot_marker_key(bundle_id))
        {
            return RegistrationState {
                resume: ResumeType::RebootPending,
                installed,
            };
        }

        let resume = if !self.hive.key_exists(scope, &key) {
            ResumeType::None
        } else {
            match self.hive.get_number(scope, &key, value_names::RESUME) {
                None | Some(RESUME_NONE) => ResumeType::None,
                Some(RESUME_ACTIVE) => ResumeType::Interrupted,
                Some(RESUME_SUSPEND) => ResumeType::Suspend,
                Some(RESUME_ARP) => ResumeType::Arp,
                Some(_) => ResumeType::Invalid,
            }
        };

        RegistrationState { resume, installed }
    }

    /// Writes the uninstall record and arms the active resume state. Run
    /// before the first non-permanent execute action.
    pub fn begin_session(&self, info: &SessionInfo<'_>) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(info.per_machine);
        let reg = info.registration;
        let key = Self::uninstall_key(&reg.bundle_id);
        let hive = &self.hive;

        hive.create_key(scope, &key)?;
        hive.set_string(scope, &key, value_names::DISPLAY_NAME, &reg.display_name)?;
        hive.set_string(
            scope,
            &key,
            value_names::DISPLAY_VERSION,
            &info.version.to_string(),
        )?;
        if let Some(publisher) = &reg.publisher {
            hive.set_string(scope, &key, value_names::PUBLISHER, publisher)?;
        }
        hive.set_number(scope, &key, value_names::VERSION, info.version.to_qword())?;
        hive.set_number(
            scope,
            &key,
            value_names::VERSION_MAJOR,
            u64::from(info.version.major),
        )?;
        hive.set_number(
            scope,
            &key,
            value_names::VERSION_MINOR,
            u64::from(info.version.minor),
        )?;
        hive.set_multi_string(scope, &key, value_names::UPGRADE_CODE, &reg.codes.upgrade)?;
        hive.set_multi_string(scope, &key, value_names::ADDON_CODE, &reg.codes.addon)?;
        hive.set_multi_string(scope, &key, value_names::DETECT_CODE, &reg.codes.detect)?;
        hive.set_multi_string(scope, &key, value_names::PATCH_CODE, &reg.codes.patch)?;
        hive.set_string(
            scope,
            &key,
            value_names::CACHE_PATH,
            &info.cache_path.display().to_string(),
        )?;
        hive.set_string(scope, &key, value_names::PROVIDER_KEY, &reg.provider_key)?;
        if let Some(tag) = &reg.tag {
            hive.set_string(scope, &key, value_names::TAG, tag)?;
        }
        hive.set_string(scope, &key, value_names::ENGINE_VERSION, info.engine_version)?;
        hive.set_string(
            scope,
            &key,
            value_names::RESUME_COMMAND_LINE,
            info.resume_command_line,
        )?;

        let quiet_uninstall = format!("\"{}\" -uninstall -quiet", info.cache_path.display());
        let uninstall = format!("\"{}\" -uninstall", info.cache_path.display());
        hive.set_string(
            scope,
            &key,
            value_names::QUIET_UNINSTALL_STRING,
            &quiet_uninstall,
        )?;
        hive.set_string(scope, &key, value_names::UNINSTALL_STRING, &uninstall)?;
        match reg.modify {
            ember_bundle_types::manifest::ModifyDisposition::Enabled => {
                let modify = format!("\"{}\" -modify", info.cache_path.display());
                hive.set_string(scope, &key, value_names::MODIFY_PATH, &modify)?;
            }
            _ => {
                hive.set_number(scope, &key, value_names::NO_MODIFY, 1)?;
            }
        }
        if reg.disable_remove {
            hive.set_number(scope, &key, value_names::NO_REMOVE, 1)?;
        }
        // EstimatedSize is stored in kilobytes.
        hive.set_number(
            scope,
            &key,
            value_names::ESTIMATED_SIZE,
            info.estimated_size / 1024,
        )?;

        hive.set_number(scope, &key, value_names::RESUME, RESUME_ACTIVE)?;
        self.write_run_once(scope, &reg.bundle_id, info.cache_path)?;

        tracing::info!(bundle = %reg.bundle_id, "registration session began");
        Ok(())
    }

    fn write_run_once(
        &self,
        scope: HiveScope,
        bundle_id: &str,
        cache_path: &Path,
    ) -> Result<(), RegistrationError> {
        let command = format!("\"{}\" {RUN_ONCE_SWITCH}", cache_path.display());
        self.hive
            .set_string(scope, RUN_ONCE_KEY, bundle_id, &command)?;
        Ok(())
    }

    /// Marks the session suspended. The resume command line stays armed.
    pub fn suspend_session(
        &self,
        bundle_id: &str,
        per_machine: bool,
    ) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(per_machine);
        self.hive.set_number(
            scope,
            &Self::uninstall_key(bundle_id),
            value_names::RESUME,
            RESUME_SUSPEND,
        )?;
        tracing::info!(bundle = bundle_id, "registration session suspended");
        Ok(())
    }

    /// Ends the session. With `keep` the record stays with an add/remove
    /// entry; without it the whole record is removed. A pending restart arms
    /// the volatile marker and keeps the run-once entry so the engine
    /// resumes after reboot.
    pub fn complete_session(
        &self,
        bundle_id: &str,
        per_machine: bool,
        keep: bool,
        restart_pending: bool,
    ) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(per_machine);
        let key = Self::uninstall_key(bundle_id);

        if restart_pending {
            self.hive
                .create_volatile_key(scope, &Self::reboot_marker_key(bundle_id))?;
        }

        if keep {
            self.hive
                .set_number(scope, &key, value_names::RESUME, RESUME_ARP)?;
            self.hive.set_number(scope, &key, value_names::INSTALLED, 1)?;
            if !restart_pending {
                self.hive.delete_value(scope, RUN_ONCE_KEY, bundle_id)?;
            }
        } else {
            self.hive.delete_key(scope, &key)?;
            self.hive.delete_value(scope, RUN_ONCE_KEY, bundle_id)?;
        }
        tracing::info!(bundle = bundle_id, keep, restart_pending, "registration session ended");
        Ok(())
    }

    /// Scans both scopes' uninstall records and classifies every bundle
    /// whose codes intersect ours. Our own record is skipped.
    pub fn detect_related_bundles(
        &self,
        our_bundle_id: &str,
        our_codes: &RelatedBundleCodes,
    ) -> Vec<RelatedBundleRegistration> {
        let mut related = Vec::new();
        for scope in [HiveScope::PerMachine, HiveScope::PerUser] {
            for bundle_id in self.hive.subkeys(scope, UNINSTALL_KEY) {
                if bundle_id.eq_ignore_ascii_case(our_bundle_id)
                    || bundle_id.ends_with(".RebootRequired")
                {
                    continue;
                }
                let key = Self::uninstall_key(&bundle_id);
                let read_list = |name: &str| {
                    self.hive
                        .get_string_list(scope, &key, name)
                        .unwrap_or_default()
                };
                let codes = RelatedBundleCodes {
                    upgrade: read_list(value_names::UPGRADE_CODE),
                    addon: read_list(value_names::ADDON_CODE),
                    detect: read_list(value_names::DETECT_CODE),
                    patch: read_list(value_names::PATCH_CODE),
                };
                let Some(kind) = our_codes.classify(&codes) else {
                    continue;
                };

                let version = self
                    .hive
                    .get_number(scope, &key, value_names::VERSION)
                    .map(BundleVersion::from_qword)
                    .or_else(|| {
                        self.hive
                            .get_string(scope, &key, value_names::DISPLAY_VERSION)?
                            .parse()
                            .ok()
                    })
                    .unwrap_or_default();

                tracing::debug!(bundle = %bundle_id, %kind, %version, "found related bundle");
                related.push(RelatedBundleRegistration {
                    kind,
                    per_machine: scope == HiveScope::PerMachine,
                    version,
                    display_name: self.hive.get_string(scope, &key, value_names::DISPLAY_NAME),
                    provider_key: self.hive.get_string(scope, &key, value_names::PROVIDER_KEY),
                    cache_path: self
                        .hive
                        .get_string(scope, &key, value_names::CACHE_PATH)
                        .map(PathBuf::from),
                    quiet_uninstall_string: self.hive.get_string(
                        scope,
                        &key,
                        value_names::QUIET_UNINSTALL_STRING,
                    ),
                    codes,
                    bundle_id,
                });
            }
        }
        related
    }

    /// Persists the variables flagged `Persisted` under the bundle's
    /// registration key so a resumed run starts from the same state.
    pub fn write_persisted_variables(
        &self,
        bundle_id: &str,
        per_machine: bool,
        variables: &ember_bundle_types::Variables,
    ) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(per_machine);
        let key = format!(r"{}\variables", Self::uninstall_key(bundle_id));
        self.hive.delete_key(scope, &key)?;
        self.hive.create_key(scope, &key)?;
        for name in variables.persisted_names() {
            if let Some(value) = variables.get(name).coerce_string() {
                self.hive.set_string(scope, &key, name, &value)?;
            }
        }
        Ok(())
    }

    /// Restores previously persisted variables into the store.
    pub fn read_persisted_variables(
        &self,
        bundle_id: &str,
        per_machine: bool,
        variables: &mut ember_bundle_types::Variables,
    ) {
        let scope = HiveScope::from_per_machine(per_machine);
        let key = format!(r"{}\variables", Self::uninstall_key(bundle_id));
        if let Some(values) = self.read_variable_values(scope, &key) {
            for (name, value) in values {
                variables.set(&name, ember_bundle_types::VariantValue::String(value));
            }
        }
    }

    fn read_variable_values(
        &self,
        scope: HiveScope,
        key: &str,
    ) -> Option<Vec<(String, String)>> {
        if !self.hive.key_exists(scope, key) {
            return None;
        }
        Some(
            self.hive
                .value_names(scope, key)
                .into_iter()
                .filter_map(|name| {
                    self.hive
                        .get_string(scope, key, &name)
                        .map(|value| (name, value))
                })
                .collect(),
        )
    }

    // ---- dependency providers ----

    fn provider_key_path(provider_key: &str) -> String {
        format!(r"{DEPENDENCIES_KEY}\{provider_key}")
    }

    fn dependents_key_path(provider_key: &str) -> String {
        format!(r"{DEPENDENCIES_KEY}\{provider_key}\Dependents")
    }

    /// Registers a dependency provider key owned by `owner_id` (a bundle id
    /// or package id).
    pub fn register_provider(
        &self,
        per_machine: bool,
        provider: &DependencyProvider,
        owner_id: &str,
    ) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(per_machine);
        let key = Self::provider_key_path(&provider.key);
        self.hive.set_string(scope, &key, "", owner_id)?;
        if let Some(version) = provider.version {
            self.hive
                .set_string(scope, &key, value_names::VERSION, &version.to_string())?;
        }
        if let Some(display_name) = &provider.display_name {
            self.hive
                .set_string(scope, &key, value_names::DISPLAY_NAME, display_name)?;
        }
        tracing::debug!(provider = %provider.key, owner = owner_id, "registered dependency provider");
        Ok(())
    }

    /// Removes a dependency provider key. When the current owner is neither
    /// `owner_id` nor absent, the key belongs to another bundle now and is
    /// left alone.
    pub fn unregister_provider(
        &self,
        per_machine: bool,
        provider_key: &str,
        owner_id: &str,
    ) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(per_machine);
        match self.provider_owner(per_machine, provider_key) {
            Some(owner) if !owner.eq_ignore_ascii_case(owner_id) => {
                tracing::info!(
                    provider = provider_key,
                    owner = %owner,
                    "provider key now owned by another bundle, leaving it registered"
                );
                Ok(())
            }
            _ => {
                self.hive
                    .delete_key(scope, &Self::provider_key_path(provider_key))?;
                tracing::debug!(provider = provider_key, "unregistered dependency provider");
                Ok(())
            }
        }
    }

    /// The registered owner of a provider key.
    pub fn provider_owner(&self, per_machine: bool, provider_key: &str) -> Option<String> {
        self.hive.get_string(
            HiveScope::from_per_machine(per_machine),
            &Self::provider_key_path(provider_key),
            "",
        )
    }

    /// Registers `dependent_id` as depending on `provider_key`.
    pub fn register_dependent(
        &self,
        per_machine: bool,
        provider_key: &str,
        dependent_id: &str,
    ) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(per_machine);
        let key = format!(r"{}\{dependent_id}", Self::dependents_key_path(provider_key));
        self.hive.create_key(scope, &key)?;
        Ok(())
    }

    /// Removes `dependent_id` from `provider_key`'s dependents.
    pub fn unregister_dependent(
        &self,
        per_machine: bool,
        provider_key: &str,
        dependent_id: &str,
    ) -> Result<(), RegistrationError> {
        let scope = HiveScope::from_per_machine(per_machine);
        let key = format!(r"{}\{dependent_id}", Self::dependents_key_path(provider_key));
        self.hive.delete_key(scope, &key)?;
        Ok(())
    }

    /// The ids registered as depending on `provider_key`, excluding
    /// `ignored` ids.
    pub fn dependents(
        &self,
        per_machine: bool,
        provider_key: &str,
        ignored: &[String],
    ) -> Vec<String> {
        self.hive
            .subkeys(
                HiveScope::from_per_machine(per_machine),
                &Self::dependents_key_path(provider_key),
            )
            .into_iter()
            .filter(|id| !ignored.iter().any(|ig| ig.eq_ignore_ascii_case(id)))
            .collect()
    }
}
