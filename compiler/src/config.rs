//! Escape analysis configuration, read from `escape.toml`
//!
//! ```toml
//! parallel = true
//! max_stack_allocation_size = 65536
//! max_scc_rounds = 8
//!
//! [[external]]
//! name = "memmove"
//! leaking_parameters = [{ index = 1, level = 1 }]
//!
//! [[external]]
//! name = "strlen"
//! safe = true
//! ```
//!
//! An entry that is not `safe` and lists no `leaking_parameters` keeps the
//! function's pointer parameters leaking, as if it had no entry at all.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Largest allocation (in bytes) that may stay on the stack by default
pub const DEFAULT_MAX_STACK_ALLOCATION_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EscapeConfig {
    /// Analyze independent SCCs of one wave on the rayon thread pool
    pub parallel: bool,

    /// Allocations larger than this are always heap allocated; `None` disables the limit
    pub max_stack_allocation_size: Option<u64>,

    /// Refinement rounds per recursive SCC; defaults to four times the SCC size
    pub max_scc_rounds: Option<usize>,

    /// Summaries for functions without a body
    pub external: Vec<ExternalSummary>,
}

/// `[[external]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalSummary {
    pub name: String,

    /// The function leaks nothing reachable from its parameters
    #[serde(default)]
    pub safe: bool,

    #[serde(default)]
    pub leaking_parameters: Vec<ParameterLeak>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterLeak {
    pub index: usize,
    /// Dereferences applied before the value reaches the heap
    #[serde(default)]
    pub level: u32,
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    /// An entry contradicts itself
    Invalid(String),
}

impl Default for EscapeConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_stack_allocation_size: Some(DEFAULT_MAX_STACK_ALLOCATION_SIZE),
            max_scc_rounds: None,
            external: Vec::new(),
        }
    }
}

impl EscapeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Override for an external function, matched by name
    pub fn external_summary(&self, name: &str) -> Option<&ExternalSummary> {
        self.external.iter().find(|entry| entry.name == name)
    }

    /// Number of refinement rounds allowed for an SCC of `scc_size` functions
    pub fn scc_round_limit(&self, scc_size: usize) -> usize {
        self.max_scc_rounds.unwrap_or(4 * scc_size).max(1)
    }

    /// Whether an allocation of `size` bytes must go to the heap regardless of escapes
    pub fn exceeds_stack_limit(&self, size: u64) -> bool {
        self.max_stack_allocation_size
            .map_or(false, |limit| size > limit)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.external {
            if entry.safe && !entry.leaking_parameters.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "external `{}` is marked safe but lists leaking parameters",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            Self::Parse(err) => write!(f, "Invalid escape configuration: {}", err),
            Self::Invalid(msg) => write!(f, "Invalid escape configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EscapeConfig::from_toml_str("").unwrap();
        assert_eq!(config, EscapeConfig::default());
        assert_eq!(config.scc_round_limit(3), 12);
        assert!(config.exceeds_stack_limit(DEFAULT_MAX_STACK_ALLOCATION_SIZE + 1));
        assert!(!config.exceeds_stack_limit(DEFAULT_MAX_STACK_ALLOCATION_SIZE));
    }

    #[test]
    fn test_parse_external_overrides() {
        let config = EscapeConfig::from_toml_str(
            r#"
            parallel = true
            max_scc_rounds = 2

            [[external]]
            name = "memmove"
            leaking_parameters = [{ index = 1, level = 1 }]

            [[external]]
            name = "strlen"
            safe = true
            "#,
        )
        .unwrap();

        assert!(config.parallel);
        assert_eq!(config.scc_round_limit(10), 2);

        let memmove = config.external_summary("memmove").unwrap();
        assert!(!memmove.safe);
        assert_eq!(
            memmove.leaking_parameters,
            vec![ParameterLeak { index: 1, level: 1 }]
        );
        assert!(config.external_summary("strlen").unwrap().safe);
        assert!(config.external_summary("free").is_none());
    }

    #[test]
    fn test_disabled_stack_limit() {
        let config = EscapeConfig {
            max_stack_allocation_size: None,
            ..EscapeConfig::default()
        };
        assert!(!config.exceeds_stack_limit(u64::MAX));
    }

    #[test]
    fn test_rejects_contradictory_entry() {
        let err = EscapeConfig::from_toml_str(
            r#"
            [[external]]
            name = "f"
            safe = true
            leaking_parameters = [{ index = 0 }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = EscapeConfig::from_toml_str("paralel = true").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
