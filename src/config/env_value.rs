// ABOUTME: Config values that are read from the process environment when a deploy starts.
// ABOUTME: The registry, the image repository, and infrastructure variables resolve through here.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// A literal, or `{env: NAME, default: ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvValue {
    /// Resolve the value of config key `field`. An empty variable counts as unset,
    /// since CI systems export unset secrets as empty strings.
    pub fn resolve(&self, field: &str) -> Result<String> {
        self.resolve_with(field, |var| std::env::var(var).ok())
    }

    fn resolve_with(&self, field: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
        match self {
            EnvValue::Literal(value) => Ok(value.clone()),
            EnvValue::FromEnv { var, default } => lookup(var)
                .filter(|value| !value.is_empty())
                .or_else(|| default.clone())
                .ok_or_else(|| Error::MissingEnvVar {
                    var: var.clone(),
                    field: field.to_string(),
                }),
        }
    }
}

/// Resolve `infrastructure.variables`; errors name the variable that could not be set.
pub fn resolve_variables(
    variables: &BTreeMap<String, EnvValue>,
) -> Result<BTreeMap<String, String>> {
    variables
        .iter()
        .map(|(name, value)| {
            let resolved = value.resolve(&format!("infrastructure.variables.{name}"))?;
            Ok((name.clone(), resolved))
        })
        .collect()
}
