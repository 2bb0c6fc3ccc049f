//! The key/value tree backing the registration store. On Windows this is
//! the registry; everywhere else (and in every test) it is [`MemoryHive`],
//! which can snapshot itself to JSON so a host can persist registration
//! between runs.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which hive a key lives in.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HiveScope {
    /// Machine-wide state (HKLM).
    PerMachine,
    /// Per-user state (HKCU).
    PerUser,
}

impl HiveScope {
    /// The scope for a per-machine flag.
    pub fn from_per_machine(per_machine: bool) -> Self {
        if per_machine {
            HiveScope::PerMachine
        } else {
            HiveScope::PerUser
        }
    }
}

/// A value stored under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HiveValue {
    /// A string value.
    String(String),
    /// A numeric value.
    Number(u64),
    /// A multi-string value.
    MultiString(Vec<String>),
}

/// An error from the hive backend.
#[derive(Debug, Error)]
pub enum HiveError {
    /// The key does not exist.
    #[error("hive key '{0}' does not exist")]
    KeyNotFound(String),

    /// The backend failed.
    #[error("hive backend failed")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The key/value tree. Key paths use `\` separators matching the registry
/// paths in the registration contract; comparisons are case-preserving but
/// lookups are exact.
pub trait Hive: Send + Sync {
    /// Creates a key, including intermediate keys. Idempotent.
    fn create_key(&self, scope: HiveScope, path: &str) -> Result<(), HiveError>;

    /// Creates a key that does not survive a reboot of the machine. The
    /// in-memory hive treats it like a normal key; volatility is an OS
    /// property.
    fn create_volatile_key(&self, scope: HiveScope, path: &str) -> Result<(), HiveError>;

    /// Deletes a key and everything under it. Missing keys are fine.
    fn delete_key(&self, scope: HiveScope, path: &str) -> Result<(), HiveError>;

    /// Whether a key exists.
    fn key_exists(&self, scope: HiveScope, path: &str) -> bool;

    /// The direct subkey names of a key, in sorted order.
    fn subkeys(&self, scope: HiveScope, path: &str) -> Vec<String>;

    /// The value names stored directly under a key, in sorted order.
    fn value_names(&self, scope: HiveScope, path: &str) -> Vec<String>;

    /// Writes a value under a key, creating the key if needed.
    fn set_value(
        &self,
        scope: HiveScope,
        path: &str,
        name: &str,
        value: HiveValue,
    ) -> Result<(), HiveError>;

    /// Reads a value.
    fn get_value(&self, scope: HiveScope, path: &str, name: &str) -> Option<HiveValue>;

    /// Deletes a value. Missing values are fine.
    fn delete_value(&self, scope: HiveScope, path: &str, name: &str) -> Result<(), HiveError>;
}

/// Convenience accessors shared by all hive implementations.
pub trait HiveExt: Hive {
    /// Writes a string value.
    fn set_string(
        &self,
        scope: HiveScope,
        path: &str,
        name: &str,
        value: &str,
    ) -> Result<(), HiveError> {
        self.set_value(scope, path, name, HiveValue::String(value.to_owned()))
    }

    /// Writes a numeric value.
    fn set_number(
        &self,
        scope: HiveScope,
        path: &str,
        name: &str,
        value: u64,
    ) -> Result<(), HiveError> {
        self.set_value(scope, path, name, HiveValue::Number(value))
    }

    /// Writes a multi-string value.
    fn set_multi_string(
        &self,
        scope: HiveScope,
        path: &str,
        name: &str,
        value: &[String],
    ) -> Result<(), HiveError> {
        self.set_value(scope, path, name, HiveValue::MultiString(value.to_vec()))
    }

    /// Reads a string value. Numeric values are not coerced.
    fn get_string(&self, scope: HiveScope, path: &str, name: &str) -> Option<String> {
        match self.get_value(scope, path, name)? {
            HiveValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Reads a numeric value.
    fn get_number(&self, scope: HiveScope, path: &str, name: &str) -> Option<u64> {
        match self.get_value(scope, path, name)? {
            HiveValue::Number(value) => Some(value),
            _ => None,
        }
    }

    /// Reads a multi-string value. A plain string reads as a one-element
    /// list, matching how single-code bundles registered their code lists.
    fn get_string_list(&self, scope: HiveScope, path: &str, name: &str) -> Option<Vec<String>> {
        match self.get_value(scope, path, name)? {
            HiveValue::MultiString(values) => Some(values),
            HiveValue::String(value) => Some(vec![value]),
            _ => None,
        }
    }
}

impl<T: Hive + ?Sized> HiveExt for T {}

type KeyMap = BTreeMap<(HiveScope, String), BTreeMap<String, HiveValue>>;

/// The in-memory hive. Cloneable handles share one tree.
#[derive(Default)]
pub struct MemoryHive {
    keys: RwLock<KeyMap>,
}

impl MemoryHive {
    /// An empty hive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes the whole tree to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let keys = self.keys.read();
        let entries: Vec<(&(HiveScope, String), &BTreeMap<String, HiveValue>)> =
            keys.iter().collect();
        serde_json::to_string_pretty(&entries)
    }

    /// Restores a tree serialized with [`MemoryHive::to_json`].
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let entries: Vec<((HiveScope, String), BTreeMap<String, HiveValue>)> =
            serde_json::from_str(json)?;
        Ok(Self {
            keys: RwLock::new(entries.into_iter().collect()),
        })
    }

    fn normalized(path: &str) -> String {
        path.trim_matches('\\').to_owned()
    }
}

impl Hive for MemoryHive {
    fn create_key(&self, scope: HiveScope, path: &str) -> Result<(), HiveError> {
        self.keys
            .write()
            .entry((scope, Self::normalized(path)))
            .or_default();
        Ok(())
    }

    fn create_volatile_key(&self, scope: HiveScope, path: &str) -> Result<(), HiveError> {
        self.create_key(scope, path)
    }

    fn delete_key(&self, scope: HiveScope, path: &str) -> Result<(), HiveError> {
        let path = Self::normalized(path);
        let prefix = format!("{path}\\");
        self.keys
            .write()
            .retain(|(s, p), _| *s != scope || (p != &path && !p.starts_with(&prefix)));
        Ok(())
    }

    fn key_exists(&self, scope: HiveScope, path: &str) -> bool {
        self.keys
            .read()
            .contains_key(&(scope, Self::normalized(path)))
    }

    fn subkeys(&self, scope: HiveScope, path: &str) -> Vec<String> {
        let path = Self::normalized(path);
        let prefix = format!("{path}\\");
        let keys = self.keys.read();
        let mut names: Vec<String> = keys
            .keys()
            .filter(|(s, p)| *s == scope && p.starts_with(&prefix))
            .filter_map(|(_, p)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('\\')).then(|| rest.to_owned())
            })
            .collect();
        names.dedup();
        names
    }

    fn value_names(&self, scope: HiveScope, path: &str) -> Vec<String> {
        self.keys
            .read()
            .get(&(scope, Self::normalized(path)))
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn set_value(
        &self,
        scope: HiveScope,
        path: &str,
        name: &str,
        value: HiveValue,
    ) -> Result<(), HiveError> {
        self.keys
            .write()
            .entry((scope, Self::normalized(path)))
            .or_default()
            .insert(name.to_owned(), value);
        Ok(())
    }

    fn get_value(&self, scope: HiveScope, path: &str, name: &str) -> Option<HiveValue> {
        self.keys
            .read()
            .get(&(scope, Self::normalized(path)))?
            .get(name)
            .cloned()
    }

    fn delete_value(&self, scope: HiveScope, path: &str, name: &str) -> Result<(), HiveError> {
        if let Some(values) = self
            .keys
            .write()
            .get_mut(&(scope, Self::normalized(path)))
        {
            values.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Hive, HiveExt, HiveScope, HiveValue, MemoryHive};

    #[test]
    fn test_subkeys_are_direct_children_only() {
        let hive = MemoryHive::new();
        hive.create_key(HiveScope::PerMachine, r"Root\A").unwrap();
        hive.create_key(HiveScope::PerMachine, r"Root\B").unwrap();
        hive.create_key(HiveScope::PerMachine, r"Root\B\Deep").unwrap();
        hive.create_key(HiveScope::PerUser, r"Root\C").unwrap();

        assert_eq!(
            hive.subkeys(HiveScope::PerMachine, "Root"),
            vec!["A".to_owned(), "B".to_owned()]
        );
    }

    #[test]
    fn test_delete_key_is_recursive() {
        let hive = MemoryHive::new();
        hive.set_string(HiveScope::PerUser, r"Root\A\B", "v", "x")
            .unwrap();
        hive.delete_key(HiveScope::PerUser, "Root").unwrap();
        assert!(!hive.key_exists(HiveScope::PerUser, r"Root\A\B"));
        assert!(!hive.key_exists(HiveScope::PerUser, "Root"));
    }

    #[test]
    fn test_string_list_accepts_plain_string() {
        let hive = MemoryHive::new();
        hive.set_value(
            HiveScope::PerUser,
            "K",
            "codes",
            HiveValue::String("{A}".to_owned()),
        )
        .unwrap();
        assert_eq!(
            hive.get_string_list(HiveScope::PerUser, "K", "codes"),
            Some(vec!["{A}".to_owned()])
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let hive = MemoryHive::new();
        hive.set_number(HiveScope::PerMachine, r"A\B", "n", 7).unwrap();
        let json = hive.to_json().unwrap();
        let restored = MemoryHive::from_json(&json).unwrap();
        assert_eq!(
            restored.get_number(HiveScope::PerMachine, r"A\B", "n"),
            Some(7)
        );
    }
}
