// ABOUTME: Custom serde deserializers for config types.
// ABOUTME: Rejects an empty environments table and invalid environment names.

use serde::Deserialize;
use std::collections::BTreeMap;

use super::EnvironmentConfig;
use crate::types::EnvironmentName;

pub fn deserialize_environments<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<EnvironmentName, EnvironmentConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: BTreeMap<String, Option<EnvironmentConfig>> = BTreeMap::deserialize(deserializer)?;
    if raw.is_empty() {
        return Err(serde::de::Error::custom(
            "at least one environment is required",
        ));
    }

    raw.into_iter()
        .map(|(name, config)| {
            let name = EnvironmentName::new(&name)
                .map_err(|e| serde::de::Error::custom(format!("environment {name:?}: {e}")))?;
            Ok((name, config.unwrap_or_default()))
        })
        .collect()
}
