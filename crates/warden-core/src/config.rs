//! # Configuration
//!
//! Workspace settings, read from TOML and overridable from the environment:
//!
//! | Key                   | Env var                     | Default |
//! |-----------------------|-----------------------------|---------|
//! | `validation_required` | `WARDEN_VALIDATION_REQUIRED`| `false` |
//! | `default_cascade`     | `WARDEN_DEFAULT_CASCADE`    | `all`   |
//! | `flush_concurrency`   | `WARDEN_FLUSH_CONCURRENCY`  | `0`     |
//!
//! `flush_concurrency = 0` leaves the flush fan-out unbounded.

use crate::{Cascade, WardenError};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

pub const ENV_VALIDATION_REQUIRED: &str = "WARDEN_VALIDATION_REQUIRED";
pub const ENV_DEFAULT_CASCADE: &str = "WARDEN_DEFAULT_CASCADE";
pub const ENV_FLUSH_CONCURRENCY: &str = "WARDEN_FLUSH_CONCURRENCY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Sessions start with validation required.
    pub validation_required: bool,
    /// Cascade used by façade calls that do not name one.
    #[serde(deserialize_with = "deserialize_cascade")]
    pub default_cascade: Cascade,
    /// Maximum persistence calls in flight per flush, `0` for unbounded.
    pub flush_concurrency: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            validation_required: false,
            default_cascade: Cascade::ALL,
            flush_concurrency: 0,
        }
    }
}

impl WorkspaceConfig {
    pub fn from_toml(text: &str) -> Result<Self, WardenError> {
        toml::from_str(text).map_err(|e| WardenError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, WardenError> {
        let text = std::fs::read_to_string(path).map_err(|e| WardenError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Apply `WARDEN_*` environment overrides.
    pub fn with_env(self) -> Result<Self, WardenError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, WardenError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_VALIDATION_REQUIRED) {
            self.validation_required = parse_flag(ENV_VALIDATION_REQUIRED, &value)?;
        }
        if let Some(value) = lookup(ENV_DEFAULT_CASCADE) {
            self.default_cascade = Cascade::parse(&value)?;
        }
        if let Some(value) = lookup(ENV_FLUSH_CONCURRENCY) {
            self.flush_concurrency = value.trim().parse().map_err(|_| {
                WardenError::Config(format!("{ENV_FLUSH_CONCURRENCY} must be an integer, got {value}"))
            })?;
        }
        Ok(self)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, WardenError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WardenError::Config(format!("{name} must be a boolean, got {value}"))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CascadeRepr {
    Bits(u8),
    Name(String),
}

fn deserialize_cascade<'de, D>(deserializer: D) -> Result<Cascade, D::Error>
where
    D: Deserializer<'de>,
{
    match CascadeRepr::deserialize(deserializer)? {
        CascadeRepr::Bits(bits) => Cascade::parse(&bits.to_string()),
        CascadeRepr::Name(name) => Cascade::parse(&name),
    }
    .map_err(serde::de::Error::custom)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = WorkspaceConfig::from_toml("").expect("parse");
        assert_eq!(config, WorkspaceConfig::default());
    }

    #[test]
    fn toml_accepts_cascade_names_and_bits() {
        let named = WorkspaceConfig::from_toml(
            "validation_required = true\ndefault_cascade = \"local\"\nflush_concurrency = 4\n",
        )
        .expect("named");
        assert!(named.validation_required);
        assert_eq!(named.default_cascade, Cascade::LOCAL);
        assert_eq!(named.flush_concurrency, 4);

        let bits = WorkspaceConfig::from_toml("default_cascade = 6").expect("bits");
        assert_eq!(bits.default_cascade, Cascade::REMOTE);
    }

    #[test]
    fn toml_rejects_unknown_keys_and_bad_cascade() {
        assert!(matches!(
            WorkspaceConfig::from_toml("colour = 1"),
            Err(WardenError::Config(_))
        ));
        assert!(WorkspaceConfig::from_toml("default_cascade = \"often\"").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let config = WorkspaceConfig::default()
            .with_overrides(env(&[
                (ENV_VALIDATION_REQUIRED, "yes"),
                (ENV_DEFAULT_CASCADE, "none"),
                (ENV_FLUSH_CONCURRENCY, " 8 "),
            ]))
            .expect("overrides");
        assert!(config.validation_required);
        assert_eq!(config.default_cascade, Cascade::NONE);
        assert_eq!(config.flush_concurrency, 8);
    }

    #[test]
    fn env_rejects_malformed_values() {
        let bad_flag = WorkspaceConfig::default().with_overrides(env(&[(ENV_VALIDATION_REQUIRED, "maybe")]));
        assert!(matches!(bad_flag, Err(WardenError::Config(_))));
        let bad_count = WorkspaceConfig::default().with_overrides(env(&[(ENV_FLUSH_CONCURRENCY, "-1")]));
        assert!(bad_count.is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "flush_concurrency = 2\n").expect("write");
        assert_eq!(WorkspaceConfig::load(&path).expect("load").flush_concurrency, 2);
        assert!(matches!(
            WorkspaceConfig::load(&dir.path().join("missing.toml")),
            Err(WardenError::Io(_))
        ));
    }
}
