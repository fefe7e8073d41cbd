use crate::types::string::AtStrError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

/// AT Protocol DID. Opaque beyond the `did:<method>:` shape; compared by
/// exact string equality.
#[derive(Clone, PartialEq, Eq, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

/// Regex for DID validation per AT Protocol spec.
pub static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap());

impl Did {
    /// Fallible constructor, validates.
    pub fn new(did: impl AsRef<str>) -> Result<Self, AtStrError> {
        let did = did.as_ref();
        let did = did.strip_prefix("at://").unwrap_or(did);
        if did.len() > 2048 {
            Err(AtStrError::too_long("did", did.len(), 2048))
        } else if !DID_REGEX.is_match(did) {
            Err(AtStrError::invalid("did", did))
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The method segment, e.g. `plc` for `did:plc:…`.
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.as_str())
    }
}

impl Deref for Did {
    type Target = str;
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for Did {
    type Err = AtStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = SmolStr::deserialize(deserializer)?;
        Did::new(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plc_and_web() {
        assert!(Did::new("did:plc:hdhoaan3xa3jiuq4fg4mefid").is_ok());
        assert!(Did::new("did:web:example.com").is_ok());
    }

    #[test]
    fn rejects_non_dids() {
        assert!(Did::new("user:abc").is_err());
        assert!(Did::new("did:").is_err());
        assert!(Did::new("did:plc:").is_err());
        assert!(Did::new("DID:plc:abc").is_err());
    }

    #[test]
    fn method_extraction() {
        assert_eq!(Did::new("did:plc:abc").unwrap().method(), "plc");
        assert_eq!(Did::new("did:web:example.com").unwrap().method(), "web");
    }
}
