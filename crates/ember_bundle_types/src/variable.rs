//! The global, name-addressed variable store. Values are typed variants
//! (64-bit numeric, string, or version) and may be declared *hidden*, in
//! which case the stored bytes are scrambled in memory and the value is
//! redacted from log output.

use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;
use thiserror::Error;

use crate::version::BundleVersion;

/// The text shown in place of a hidden variable's value.
pub const HIDDEN_VARIABLE_REDACTION: &str = "*****";

/// A typed variable value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VariantValue {
    /// No value. Undefined variables evaluate to this.
    #[default]
    None,
    /// A 64-bit signed numeric value.
    Numeric(i64),
    /// A four-part version.
    Version(BundleVersion),
    /// A string value.
    String(String),
}

/// An error produced when a variable value cannot be coerced to the requested
/// type.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum VariableError {
    /// The variable is not defined.
    #[error("variable '{0}' is not defined")]
    Undefined(String),

    /// The value could not be converted to the requested type.
    #[error("variable '{name}' cannot be read as {wanted}")]
    TypeMismatch {
        /// The variable name.
        name: String,
        /// The requested type.
        wanted: &'static str,
    },
}

impl VariantValue {
    /// Coerces the value to a string. Numeric values format as decimal,
    /// versions in their canonical dotted form.
    pub fn coerce_string(&self) -> Option<String> {
        match self {
            VariantValue::None => None,
            VariantValue::Numeric(value) => Some(value.to_string()),
            VariantValue::Version(version) => Some(format!("v{version}")),
            VariantValue::String(value) => Some(value.clone()),
        }
    }

    /// Coerces the value to a numeric. Strings must parse as a decimal
    /// number; versions are not convertible.
    pub fn coerce_numeric(&self) -> Option<i64> {
        match self {
            VariantValue::None => None,
            VariantValue::Numeric(value) => Some(*value),
            VariantValue::Version(_) => None,
            VariantValue::String(value) => value.trim().parse().ok(),
        }
    }

    /// Coerces the value to a version. Numeric values reinterpret their low
    /// 64 bits as the packed quad; strings parse with an optional leading
    /// `v`.
    pub fn coerce_version(&self) -> Option<BundleVersion> {
        match self {
            VariantValue::None => None,
            VariantValue::Numeric(value) => Some(BundleVersion::from_qword(*value as u64)),
            VariantValue::Version(version) => Some(*version),
            VariantValue::String(value) => value.parse().ok(),
        }
    }
}

impl Display for VariantValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VariantValue::None => Ok(()),
            VariantValue::Numeric(value) => write!(f, "{value}"),
            VariantValue::Version(version) => write!(f, "v{version}"),
            VariantValue::String(value) => write!(f, "{value}"),
        }
    }
}

/// One stored variable. Hidden values are scrambled at rest; the plaintext
/// only exists while a read is in flight.
struct StoredVariable {
    value: StoredValue,
    hidden: bool,
    persisted: bool,
}

enum StoredValue {
    Plain(VariantValue),
    Scrambled {
        kind: ScrambledKind,
        bytes: Vec<u8>,
    },
}

#[derive(Copy, Clone)]
enum ScrambledKind {
    Numeric,
    Version,
    String,
}

/// The global variable store. Single writer: detect/plan populate it, the
/// apply workers only read.
pub struct Variables {
    entries: IndexMap<String, StoredVariable>,
    scramble_key: [u8; 8],
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

impl Variables {
    /// Creates an empty store with a fresh scramble key.
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            scramble_key: rand::random::<u64>().to_le_bytes(),
        }
    }

    fn scramble(&self, plaintext: &[u8]) -> Vec<u8> {
        plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ self.scramble_key[i % self.scramble_key.len()])
            .collect()
    }

    /// Returns the value of a variable, unscrambling hidden values.
    /// Undefined variables return [`VariantValue::None`].
    pub fn get(&self, name: &str) -> VariantValue {
        let Some(stored) = self.entries.get(name) else {
            return VariantValue::None;
        };
        match &stored.value {
            StoredValue::Plain(value) => value.clone(),
            StoredValue::Scrambled { kind, bytes } => {
                let plaintext = self.scramble(bytes);
                let text = String::from_utf8_lossy(&plaintext).into_owned();
                match kind {
                    ScrambledKind::Numeric => text
                        .parse()
                        .map(VariantValue::Numeric)
                        .unwrap_or(VariantValue::None),
                    ScrambledKind::Version => text
                        .parse()
                        .map(VariantValue::Version)
                        .unwrap_or(VariantValue::None),
                    ScrambledKind::String => VariantValue::String(text),
                }
            }
        }
    }

    /// True if the variable exists and holds a value.
    pub fn is_defined(&self, name: &str) -> bool {
        !matches!(self.get(name), VariantValue::None)
    }

    /// True if the variable was declared hidden.
    pub fn is_hidden(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|stored| stored.hidden)
    }

    /// Sets a variable, preserving any previously declared hidden flag.
    pub fn set(&mut self, name: &str, value: VariantValue) {
        let hidden = self.is_hidden(name);
        self.set_with_flags(name, value, hidden, false);
    }

    /// Sets a variable with explicit hidden/persisted flags.
    pub fn set_with_flags(&mut self, name: &str, value: VariantValue, hidden: bool, persisted: bool) {
        let stored_value = if hidden {
            let (kind, text) = match &value {
                VariantValue::None => {
                    self.entries.insert(
                        name.to_owned(),
                        StoredVariable {
                            value: StoredValue::Plain(VariantValue::None),
                            hidden,
                            persisted,
                        },
                    );
                    return;
                }
                VariantValue::Numeric(n) => (ScrambledKind::Numeric, n.to_string()),
                VariantValue::Version(v) => (ScrambledKind::Version, v.to_string()),
                VariantValue::String(s) => (ScrambledKind::String, s.clone()),
            };
            StoredValue::Scrambled {
                kind,
                bytes: self.scramble(text.as_bytes()),
            }
        } else {
            StoredValue::Plain(value)
        };
        self.entries.insert(
            name.to_owned(),
            StoredVariable {
                value: stored_value,
                hidden,
                persisted,
            },
        );
    }

    /// Sets a string variable.
    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, VariantValue::String(value.into()));
    }

    /// Sets a numeric variable.
    pub fn set_numeric(&mut self, name: &str, value: i64) {
        self.set(name, VariantValue::Numeric(value));
    }

    /// Sets a version variable.
    pub fn set_version(&mut self, name: &str, value: BundleVersion) {
        self.set(name, VariantValue::Version(value));
    }

    /// Reads a variable coerced to a string.
    pub fn get_string(&self, name: &str) -> Result<String, VariableError> {
        match self.get(name) {
            VariantValue::None => Err(VariableError::Undefined(name.to_owned())),
            value => value.coerce_string().ok_or(VariableError::TypeMismatch {
                name: name.to_owned(),
                wanted: "string",
            }),
        }
    }

    /// Reads a variable coerced to a numeric.
    pub fn get_numeric(&self, name: &str) -> Result<i64, VariableError> {
        match self.get(name) {
            VariantValue::None => Err(VariableError::Undefined(name.to_owned())),
            value => value.coerce_numeric().ok_or(VariableError::TypeMismatch {
                name: name.to_owned(),
                wanted: "numeric",
            }),
        }
    }

    /// Reads a variable coerced to a version.
    pub fn get_version(&self, name: &str) -> Result<BundleVersion, VariableError> {
        match self.get(name) {
            VariantValue::None => Err(VariableError::Undefined(name.to_owned())),
            value => value.coerce_version().ok_or(VariableError::TypeMismatch {
                name: name.to_owned(),
                wanted: "version",
            }),
        }
    }

    /// Expands `[VariableName]` references in `input`. Unknown variables
    /// expand to the empty string; brackets that do not delimit a well-formed
    /// identifier are kept literally.
    pub fn format_string(&self, input: &str) -> String {
        let mut result = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('[') {
            result.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];
            match after_open.find(']') {
                Some(close)
                    if !after_open[..close].is_empty()
                        && after_open[..close]
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
                {
                    let name = &after_open[..close];
                    if let Some(value) = self.get(name).coerce_string() {
                        result.push_str(&value);
                    }
                    rest = &after_open[close + 1..];
                }
                _ => {
                    result.push('[');
                    rest = after_open;
                }
            }
        }
        result.push_str(rest);
        result
    }

    /// Like [`Variables::format_string`] but hidden variables render as
    /// [`HIDDEN_VARIABLE_REDACTION`]. Used when the expansion is logged.
    pub fn format_string_obfuscated(&self, input: &str) -> String {
        let mut result = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('[') {
            result.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];
            match after_open.find(']') {
                Some(close)
                    if !after_open[..close].is_empty()
                        && after_open[..close]
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
                {
                    let name = &after_open[..close];
                    if self.is_hidden(name) {
                        result.push_str(HIDDEN_VARIABLE_REDACTION);
                    } else if let Some(value) = self.get(name).coerce_string() {
                        result.push_str(&value);
                    }
                    rest = &after_open[close + 1..];
                }
                _ => {
                    result.push('[');
                    rest = after_open;
                }
            }
        }
        result.push_str(rest);
        result
    }

    /// Copies the whole store. Hidden values are re-scrambled under the
    /// copy's own key; flags carry over.
    pub fn snapshot(&self) -> Variables {
        let mut copy = Variables::new();
        let names: Vec<(String, bool, bool)> = self
            .entries
            .iter()
            .map(|(name, stored)| (name.clone(), stored.hidden, stored.persisted))
            .collect();
        for (name, hidden, persisted) in names {
            let value = self.get(&name);
            copy.set_with_flags(&name, value, hidden, persisted);
        }
        copy
    }

    /// Iterates over the names of variables flagged as persisted.
    pub fn persisted_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, stored)| stored.persisted)
            .map(|(name, _)| name.as_str())
    }
}
