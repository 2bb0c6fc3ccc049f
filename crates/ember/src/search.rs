//! Runs the manifest's searches before planning, populating variables from
//! directories, files, the registry and the Windows Installer database.
//!
//! A search whose condition evaluates false is skipped. A search that fails
//! leaves its variable unset and is logged; one broken probe must not keep
//! the bundle from planning.

use std::path::PathBuf;

use thiserror::Error;

use ember_bundle_types::{
    search::{MsiComponentResult, MsiProductResult, RegistryRoot, Search, SearchKind},
    variable::VariantValue,
    Variables,
};
use ember_condition::{Condition, ConditionError};

use crate::{
    hive::{Hive, HiveExt, HiveScope, HiveValue},
    machine::MachineInspector,
};

// MSI install-state numerics surfaced to conditions.
const INSTALLSTATE_ABSENT: i64 = 2;
const INSTALLSTATE_LOCAL: i64 = 3;
const INSTALLSTATE_DEFAULT: i64 = 5;
const INSTALLSTATE_UNKNOWN: i64 = -1;

/// An error from a single search.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The gating condition did not parse.
    #[error("condition of search '{search}' failed to parse")]
    Condition {
        /// The search id.
        search: String,
        /// The parse failure.
        #[source]
        source: ConditionError,
    },

    /// Feature state searches are not supported.
    #[error("search '{0}': msi feature searches are not supported")]
    MsiFeatureUnsupported(String),

    /// The probe target was not found.
    #[error("search '{0}' found nothing")]
    NotFound(String),
}

fn registry_location(root: RegistryRoot, key: &str) -> (HiveScope, String) {
    match root {
        RegistryRoot::LocalMachine => (HiveScope::PerMachine, key.to_owned()),
        RegistryRoot::CurrentUser => (HiveScope::PerUser, key.to_owned()),
        // HKCR is the merged view of HKLM\Software\Classes.
        RegistryRoot::ClassesRoot => (
            HiveScope::PerMachine,
            format!(r"Software\Classes\{key}"),
        ),
        RegistryRoot::Users => (HiveScope::PerUser, key.to_owned()),
    }
}

/// Expands `%NAME%` environment references in a registry string value.
fn expand_environment(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(open) = rest.find('%') {
        result.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('%') {
            Some(close) if close > 0 => {
                let name = &after[..close];
                match std::env::var(name) {
                    Ok(expansion) => result.push_str(&expansion),
                    Err(_) => {
                        result.push('%');
                        result.push_str(name);
                        result.push('%');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                result.push('%');
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

fn execute_search(
    search: &Search,
    variables: &Variables,
    machine: &dyn MachineInspector,
    hive: &dyn Hive,
) -> Result<VariantValue, SearchError> {
    match &search.kind {
        SearchKind::DirectoryExists { path } => {
            let path = PathBuf::from(variables.format_string(path));
            Ok(VariantValue::Numeric(i64::from(path.is_dir())))
        }
        SearchKind::FileExists { path } => {
            let path = PathBuf::from(variables.format_string(path));
            Ok(VariantValue::Numeric(i64::from(path.is_file())))
        }
        SearchKind::FileVersion { path } => {
            let path = PathBuf::from(variables.format_string(path));
            machine
                .file_version(&path)
                .map(VariantValue::Version)
                .ok_or_else(|| SearchError::NotFound(search.id.clone()))
        }
        SearchKind::RegistryExists { root, key, value } => {
            let key = variables.format_string(key);
            let (scope, key) = registry_location(*root, &key);
            let exists = match value {
                None => hive.key_exists(scope, &key),
                Some(name) => hive.get_value(scope, &key, name).is_some(),
            };
            Ok(VariantValue::Numeric(i64::from(exists)))
        }
        SearchKind::RegistryValue {
            root,
            key,
            value,
            expand,
        } => {
            let key = variables.format_string(key);
            let (scope, key) = registry_location(*root, &key);
            let name = value.as_deref().unwrap_or("");
            match hive.get_value(scope, &key, name) {
                Some(HiveValue::String(text)) => {
                    let text = if *expand {
                        expand_environment(&text)
                    } else {
                        text
                    };
                    Ok(VariantValue::String(text))
                }
                Some(HiveValue::Number(number)) => Ok(VariantValue::Numeric(number as i64)),
                Some(HiveValue::MultiString(values)) => {
                    Ok(VariantValue::String(values.join(";")))
                }
                None => Err(SearchError::NotFound(search.id.clone())),
            }
        }
        SearchKind::MsiComponent {
            component_id,
            product_code,
            result,
        } => {
            let key_path = machine.component_key_path(component_id, product_code.as_deref());
            match result {
                MsiComponentResult::State => Ok(VariantValue::Numeric(match key_path {
                    Some(_) => INSTALLSTATE_LOCAL,
                    None => INSTALLSTATE_ABSENT,
                })),
                MsiComponentResult::KeyPath => key_path
                    .map(VariantValue::String)
                    .ok_or_else(|| SearchError::NotFound(search.id.clone())),
                MsiComponentResult::Directory => key_path
                    .map(|p| {
                        let path = PathBuf::from(p);
                        let dir = path
                            .parent()
                            .map(|d| d.display().to_string())
                            .unwrap_or_default();
                        VariantValue::String(dir)
                    })
                    .ok_or_else(|| SearchError::NotFound(search.id.clone())),
            }
        }
        SearchKind::MsiProduct {
            product_code,
            result,
        } => {
            let product = machine.find_product(product_code);
            match result {
                MsiProductResult::Version => product
                    .map(|p| VariantValue::Version(p.version))
                    .ok_or_else(|| SearchError::NotFound(search.id.clone())),
                MsiProductResult::Language => product
                    .map(|p| VariantValue::Numeric(i64::from(p.language)))
                    .ok_or_else(|| SearchError::NotFound(search.id.clone())),
                MsiProductResult::State => Ok(VariantValue::Numeric(match product {
                    Some(_) => INSTALLSTATE_DEFAULT,
                    None => INSTALLSTATE_UNKNOWN,
                })),
                MsiProductResult::Assignment => product
                    .map(|p| VariantValue::Numeric(i64::from(p.per_machine)))
                    .ok_or_else(|| SearchError::NotFound(search.id.clone())),
            }
        }
        SearchKind::MsiFeature { .. } => {
            Err(SearchError::MsiFeatureUnsupported(search.id.clone()))
        }
    }
}

/// Runs all searches in manifest order. Conditions gate each search; probe
/// failures leave the variable untouched.
pub fn run_searches(
    searches: &[Search],
    variables: &mut Variables,
    machine: &dyn MachineInspector,
    hive: &dyn Hive,
) {
    for search in searches {
        if let Some(condition) = &search.condition {
            match Condition::parse(condition) {
                Ok(parsed) => {
                    if !parsed.evaluate(variables) {
                        tracing::debug!(search = %search.id, "search skipped by condition");
                        continue;
                    }
                }
                Err(err) => {
                    tracing::warn!(search = %search.id, error = %err, "search condition failed to parse, skipping");
                    continue;
                }
            }
        }

        match execute_search(search, variables, machine, hive) {
            Ok(value) => {
                tracing::debug!(search = %search.id, variable = %search.variable, %value, "search result");
                variables.set(&search.variable, value);
            }
            Err(err) => {
                tracing::debug!(search = %search.id, error = %err, "search failed, variable left unset");
            }
        }
    }
}
