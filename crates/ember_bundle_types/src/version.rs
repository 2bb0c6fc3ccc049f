//! The four-part version scheme used by bundles and Windows Installer
//! products: `major.minor.micro.build`, each part an unsigned 16-bit number.
//! Missing trailing parts default to zero and a leading `v` is accepted.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use nom::{
    character::complete::{char, digit1},
    combinator::opt,
    sequence::preceded,
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bundle or package version. Stored as four 16-bit fields so the whole
/// version also round-trips through the packed 64-bit form the registration
/// store persists.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BundleVersion {
    /// The first version field.
    pub major: u16,
    /// The second version field.
    pub minor: u16,
    /// The third version field.
    pub micro: u16,
    /// The fourth version field.
    pub build: u16,
}

/// An error that occurred while parsing a version string.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionError {
    /// The string was empty.
    #[error("empty version string")]
    Empty,

    /// A version field was not a number or did not fit in 16 bits.
    #[error("invalid version field in '{0}'")]
    InvalidField(String),

    /// The string contained trailing characters after the version.
    #[error("unexpected trailing characters in version '{0}'")]
    Trailing(String),
}

impl BundleVersion {
    /// Constructs a version from its four fields.
    pub fn new(major: u16, minor: u16, micro: u16, build: u16) -> Self {
        Self {
            major,
            minor,
            micro,
            build,
        }
    }

    /// Packs the version into the 64-bit form used by the registration store.
    pub fn to_qword(self) -> u64 {
        (u64::from(self.major) << 48)
            | (u64::from(self.minor) << 32)
            | (u64::from(self.micro) << 16)
            | u64::from(self.build)
    }

    /// Unpacks a version from its 64-bit form.
    pub fn from_qword(value: u64) -> Self {
        Self {
            major: (value >> 48) as u16,
            minor: (value >> 32) as u16,
            micro: (value >> 16) as u16,
            build: value as u16,
        }
    }
}

fn field_parser(input: &str) -> IResult<&str, u16> {
    let (rest, digits) = digit1(input)?;
    match u16::from_str(digits) {
        Ok(value) => Ok((rest, value)),
        Err(_) => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        ))),
    }
}

/// Parses a version from the start of `input`, returning the remaining input.
pub fn version_parser(input: &str) -> IResult<&str, BundleVersion> {
    let (rest, _) = opt(char('v')).parse(input)?;
    let (rest, major) = field_parser(rest)?;
    let (rest, minor) = opt(preceded(char('.'), field_parser)).parse(rest)?;
    let (rest, micro) = match minor {
        Some(_) => opt(preceded(char('.'), field_parser)).parse(rest)?,
        None => (rest, None),
    };
    let (rest, build) = match micro {
        Some(_) => opt(preceded(char('.'), field_parser)).parse(rest)?,
        None => (rest, None),
    };

    Ok((
        rest,
        BundleVersion {
            major,
            minor: minor.unwrap_or(0),
            micro: micro.unwrap_or(0),
            build: build.unwrap_or(0),
        },
    ))
}

impl FromStr for BundleVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseVersionError::Empty);
        }
        match version_parser(s) {
            Ok(("", version)) => Ok(version),
            Ok((_, _)) => Err(ParseVersionError::Trailing(s.to_owned())),
            Err(_) => Err(ParseVersionError::InvalidField(s.to_owned())),
        }
    }
}

impl Display for BundleVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.micro, self.build
        )
    }
}

impl Serialize for BundleVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BundleVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::{BundleVersion, ParseVersionError};

    #[rstest]
    #[case("1", BundleVersion::new(1, 0, 0, 0))]
    #[case("1.2", BundleVersion::new(1, 2, 0, 0))]
    #[case("1.2.3", BundleVersion::new(1, 2, 3, 0))]
    #[case("1.2.3.4", BundleVersion::new(1, 2, 3, 4))]
    #[case("v1.2.3.4", BundleVersion::new(1, 2, 3, 4))]
    #[case("0.0.0.0", BundleVersion::default())]
    fn test_parse(#[case] input: &str, #[case] expected: BundleVersion) {
        assert_eq!(BundleVersion::from_str(input), Ok(expected));
    }

    #[rstest]
    #[case("")]
    #[case("a.b")]
    #[case("1.2.3.4.5")]
    #[case("70000")]
    fn test_parse_error(#[case] input: &str) {
        assert!(BundleVersion::from_str(input).is_err());
    }

    #[test]
    fn test_ordering() {
        let v1: BundleVersion = "1.0".parse().unwrap();
        let v11: BundleVersion = "1.1".parse().unwrap();
        let v1101: BundleVersion = "1.1.0.1".parse().unwrap();
        assert!(v1 < v11);
        assert!(v11 < v1101);
    }

    #[test]
    fn test_qword_roundtrip() {
        let version = BundleVersion::new(1, 2, 3, 4);
        assert_eq!(BundleVersion::from_qword(version.to_qword()), version);
    }

    #[test]
    fn test_empty_is_error() {
        assert_eq!(BundleVersion::from_str(""), Err(ParseVersionError::Empty));
    }
}
