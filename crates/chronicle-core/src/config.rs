//! Configuration loading and typed config structures for Chronicle.
//!
//! The canonical configuration lives in `chronicle-config.yaml` at the
//! project root. Every section and field has a default, so an empty file
//! (or no file) yields a working in-memory setup with no rules.

use std::path::{Path, PathBuf};

use chronicle_events::KindRegistry;
use chronicle_invalidation::{DEFAULT_MAX_CASCADE_DEPTH, RuleSpec};
use chronicle_store::DEFAULT_CHECKPOINT_INTERVAL;
use serde::Deserialize;

/// Environment variable overriding `persistence.event_log_path`.
pub const EVENT_LOG_ENV: &str = "CHRONICLE_EVENT_LOG";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is not usable.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level Chronicle configuration.
///
/// Mirrors the structure of `chronicle-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChronicleConfig {
    /// Entity store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Invalidation engine settings.
    #[serde(default)]
    pub invalidation: InvalidationConfig,

    /// Event construction settings.
    #[serde(default)]
    pub events: EventsConfig,

    /// Write-behind persistence settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Invalidation rules, in registration order.
    ///
    /// Enum-valued fields are written as single-key maps
    /// (`trigger: { on_event: ... }`), or as plain strings for unit
    /// variants (`targets: affected`).
    #[serde(
        default,
        deserialize_with = "serde_yml::with::singleton_map_recursive::deserialize"
    )]
    pub rules: Vec<RuleSpec>,
}

impl ChronicleConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `CHRONICLE_EVENT_LOG` overrides `persistence.event_log_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// [`ChronicleConfig::from_file`]).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(EVENT_LOG_ENV).filter(|p| !p.trim().is_empty()) {
            self.persistence.event_log_path = Some(PathBuf::from(path));
        }
    }

    /// Reject values the rest of the system cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "store.checkpoint_interval",
                reason: "must be at least 1",
            });
        }
        if self.persistence.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "persistence.batch_size",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// The built-in kinds plus `events.extra_kinds`.
    pub fn kind_registry(&self) -> KindRegistry {
        let mut registry = KindRegistry::with_builtins();
        for kind in &self.events.extra_kinds {
            registry.register(kind.as_str());
        }
        registry
    }
}

/// Entity store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Versions between materialised checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

/// Invalidation engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvalidationConfig {
    /// Cascade hops before synthesis stops.
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: u32,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            max_cascade_depth: default_max_cascade_depth(),
        }
    }
}

/// Event construction configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventsConfig {
    /// Kinds registered in addition to the built-ins.
    #[serde(default)]
    pub extra_kinds: Vec<String>,

    /// Treat `source_ref` as an idempotency key.
    #[serde(default)]
    pub dedupe_source_refs: bool,
}

/// Write-behind persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersistenceConfig {
    /// JSON-lines event log; persistence is off when unset.
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,

    /// Events written per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            event_log_path: None,
            batch_size: default_batch_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG`
    /// is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

const fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

const fn default_max_cascade_depth() -> u32 {
    DEFAULT_MAX_CASCADE_DEPTH
}

const fn default_batch_size() -> usize {
    chronicle_events::write_behind::DEFAULT_BATCH_SIZE
}

fn default_log_level() -> String {
    "info".to_owned()
}
