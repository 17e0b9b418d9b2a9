//! # Runtime Configuration
//!
//! Configuration is read from environment variables or a TOML document:
//! - `ARBOR_REACTIVATION`: `always`, `when-propagating` or `deferred`
//! - `ARBOR_RETAIN_LAST_SEEN`: `true` or `false`
//! - `ARBOR_MAX_TRAVERSAL_DEPTH`: positive integer
//!
//! Unset variables keep their defaults.

use crate::ArborError;
use crate::primitives::{
    DEFAULT_MAX_TRAVERSAL_DEPTH, ENV_MAX_TRAVERSAL_DEPTH, ENV_REACTIVATION, ENV_RETAIN_LAST_SEEN,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// When a child subtree attached by a field write gets activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReactivationPolicy {
    /// Activate synchronously before the write returns.
    #[default]
    Always,
    /// Activate synchronously when an instrumentation propagating to
    /// children covers the writing node, otherwise at the transaction
    /// boundary.
    WhenPropagating,
    /// Activate at the transaction boundary.
    Deferred,
}

impl FromStr for ReactivationPolicy {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "always" => Ok(Self::Always),
            "when-propagating" => Ok(Self::WhenPropagating),
            "deferred" => Ok(Self::Deferred),
            other => Err(ArborError::InvalidConfig {
                key: ENV_REACTIVATION.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Runtime configuration shared by every node of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Activation policy for children attached by a write.
    pub reactivation: ReactivationPolicy,
    /// Keep a last-seen snapshot of destructed nodes.
    pub retain_last_seen: bool,
    /// Bound on root-to-node path enumeration.
    pub max_traversal_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reactivation: ReactivationPolicy::default(),
            retain_last_seen: true,
            max_traversal_depth: DEFAULT_MAX_TRAVERSAL_DEPTH,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from `ARBOR_*` environment variables.
    pub fn from_env() -> Result<Self, ArborError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ArborError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_REACTIVATION) {
            config.reactivation = value.parse()?;
        }
        if let Some(value) = lookup(ENV_RETAIN_LAST_SEEN) {
            config.retain_last_seen =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ArborError::InvalidConfig {
                        key: ENV_RETAIN_LAST_SEEN.to_string(),
                        value: value.clone(),
                    })?;
        }
        if let Some(value) = lookup(ENV_MAX_TRAVERSAL_DEPTH) {
            config.max_traversal_depth = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|depth| *depth > 0)
                .ok_or_else(|| ArborError::InvalidConfig {
                    key: ENV_MAX_TRAVERSAL_DEPTH.to_string(),
                    value: value.clone(),
                })?;
        }

        Ok(config)
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self, ArborError> {
        let config: Self =
            toml::from_str(document).map_err(|e| ArborError::ConfigParse(e.to_string()))?;
        if config.max_traversal_depth == 0 {
            return Err(ArborError::InvalidConfig {
                key: "max_traversal_depth".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ArborError> {
        let document =
            std::fs::read_to_string(path).map_err(|e| ArborError::IoError(e.to_string()))?;
        Self::from_toml_str(&document)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = RuntimeConfig::from_lookup(|_| None).expect("config");
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.reactivation, ReactivationPolicy::Always);
        assert!(config.retain_last_seen);
    }

    #[test]
    fn env_values_override_defaults() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("ARBOR_REACTIVATION", "when-propagating"),
            ("ARBOR_RETAIN_LAST_SEEN", "false"),
            ("ARBOR_MAX_TRAVERSAL_DEPTH", "12"),
        ]))
        .expect("config");

        assert_eq!(config.reactivation, ReactivationPolicy::WhenPropagating);
        assert!(!config.retain_last_seen);
        assert_eq!(config.max_traversal_depth, 12);
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let result = RuntimeConfig::from_lookup(lookup_from(&[("ARBOR_REACTIVATION", "sometimes")]));
        assert!(matches!(result, Err(ArborError::InvalidConfig { .. })));

        let result = RuntimeConfig::from_lookup(lookup_from(&[("ARBOR_MAX_TRAVERSAL_DEPTH", "0")]));
        assert!(matches!(result, Err(ArborError::InvalidConfig { .. })));
    }

    #[test]
    fn toml_document_parses_partially() {
        let config = RuntimeConfig::from_toml_str("reactivation = \"deferred\"\n").expect("toml");
        assert_eq!(config.reactivation, ReactivationPolicy::Deferred);
        assert_eq!(config.max_traversal_depth, DEFAULT_MAX_TRAVERSAL_DEPTH);
    }

    #[test]
    fn toml_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "retain_last_seen = false\nmax_traversal_depth = 8").expect("write");

        let config = RuntimeConfig::from_file(file.path()).expect("file");
        assert!(!config.retain_last_seen);
        assert_eq!(config.max_traversal_depth, 8);
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = RuntimeConfig::from_file("/nonexistent/arbor.toml");
        assert!(matches!(result, Err(ArborError::IoError(_))));
    }
}
