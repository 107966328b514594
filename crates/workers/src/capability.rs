//! Capability tags.
//!
//! A capability describes a kind of work ("crm.fetch", "report-render").
//! Tags are validated on construction so a typo is rejected when a worker
//! registers or a workflow is created, never silently at dispatch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CapabilityError;

/// A validated capability tag: non-empty, lowercase ASCII letters, digits,
/// `.`, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: impl Into<String>) -> Result<Self, CapabilityError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(CapabilityError::Empty);
        }
        let valid = tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(CapabilityError::InvalidCharacters(tag));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Capability {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Capability {
    type Error = CapabilityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.0
    }
}

impl AsRef<str> for Capability {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_and_dashed_tags() {
        assert_eq!(Capability::new("crm.fetch").unwrap().as_str(), "crm.fetch");
        assert!(Capability::new("report-render_v2").is_ok());
    }

    #[test]
    fn rejects_empty_and_mixed_case() {
        assert_eq!(Capability::new(""), Err(CapabilityError::Empty));
        assert!(matches!(
            Capability::new("CRM Fetch"),
            Err(CapabilityError::InvalidCharacters(tag)) if tag == "CRM Fetch"
        ));
    }

    #[test]
    fn deserialization_validates() {
        let ok: Capability = serde_json::from_str("\"analysis\"").unwrap();
        assert_eq!(ok.to_string(), "analysis");
        assert!(serde_json::from_str::<Capability>("\"Not Valid\"").is_err());
    }
}
