// ABOUTME: Artifact version tag validation.
// ABOUTME: Tags follow registry tag rules: [A-Za-z0-9_][A-Za-z0-9_.-]{0,127}.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VersionTagError {
    #[error("version tag cannot be empty")]
    Empty,

    #[error("version tag exceeds maximum length of 128 characters")]
    TooLong,

    #[error("version tag cannot start with '{0}'")]
    InvalidStart(char),

    #[error("invalid character in version tag: '{0}'")]
    InvalidChar(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(value: &str) -> Result<Self, VersionTagError> {
        let value = value.trim();
        let first = value.chars().next().ok_or(VersionTagError::Empty)?;

        if value.len() > 128 {
            return Err(VersionTagError::TooLong);
        }

        if first == '.' || first == '-' {
            return Err(VersionTagError::InvalidStart(first));
        }

        for c in value.chars() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '.' && c != '-' {
                return Err(VersionTagError::InvalidChar(c));
            }
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for VersionTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VersionTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VersionTag::new(&s).map_err(serde::de::Error::custom)
    }
}
