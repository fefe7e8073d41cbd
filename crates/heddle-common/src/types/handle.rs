use crate::types::string::AtStrError;
use crate::types::{DISALLOWED_TLDS, ends_with};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

/// AT Protocol handle: a domain-shaped alias for a DID.
#[derive(Clone, PartialEq, Eq, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Handle(SmolStr);

pub static HANDLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap()
});

impl Handle {
    /// Fallible constructor, validates.
    ///
    /// Accepts (and strips) a preceding `@` or `at://` if present.
    pub fn new(handle: impl AsRef<str>) -> Result<Self, AtStrError> {
        let handle = handle.as_ref();
        let handle = handle.strip_prefix("at://").unwrap_or(handle);
        let handle = handle.strip_prefix('@').unwrap_or(handle);
        if handle.len() > 253 {
            Err(AtStrError::too_long("handle", handle.len(), 253))
        } else if !HANDLE_REGEX.is_match(handle) {
            Err(AtStrError::invalid("handle", handle))
        } else if ends_with(handle, DISALLOWED_TLDS) {
            Err(AtStrError::disallowed_tld("handle", handle))
        } else {
            Ok(Self(SmolStr::new(handle)))
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether the handle contains at least one dot, i.e. can be probed via
    /// its own `.well-known` endpoint.
    pub fn is_dotted(&self) -> bool {
        self.0.contains('.')
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.as_str())
    }
}

impl Deref for Handle {
    type Target = str;
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for Handle {
    type Err = AtStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = SmolStr::deserialize(deserializer)?;
        Handle::new(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_handles() {
        assert!(Handle::new("alice.bsky.social").is_ok());
        assert!(Handle::new("alice.example.net").is_ok());
        assert_eq!(Handle::new("@alice.test.dev").unwrap().as_str(), "alice.test.dev");
        assert_eq!(
            Handle::new("at://alice.test.dev").unwrap().as_str(),
            "alice.test.dev"
        );
    }

    #[test]
    fn rejects_bad_handles() {
        assert!(Handle::new("not a handle").is_err());
        assert!(Handle::new("nodots").is_err());
        assert!(Handle::new("-leading.example.com").is_err());
        assert!(Handle::new("alice.example.invalid").is_err());
        assert!(Handle::new("alice.onion").is_err());
    }
}
