//! Runtime configuration
//!
//! Configuration is resolved in three layers: compiled defaults, an optional
//! TOML file, then `TANDEM_*` environment variables. `validate` runs last and
//! rejects values that would only fail later at first use.

use crate::errors::{Result, TandemError};
use serde::{Deserialize, Serialize};
use std::path::Path;

const ENV_PREFIX: &str = "TANDEM_";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    /// Operation log protocol limits
    pub protocol: ProtocolConfig,
    /// History compaction behaviour
    pub compaction: CompactionConfig,
    /// Client runtime limits
    pub runtime: RuntimeConfig,
    /// Tracing output
    pub logging: LoggingConfig,
}

/// Operation log protocol limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest serialized operation contents sent inline. Larger contents
    /// travel as content fragments.
    pub max_message_size: usize,
    /// Number of recent signals the ordering service keeps for late joiners
    pub signal_buffer: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024,
            signal_buffer: 64,
        }
    }
}

/// History compaction behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Keep operations below the watermark in the service replay log instead
    /// of discarding them once a snapshot covers them
    pub retain_below_watermark: bool,
    /// Suggested number of sequenced operations between summaries
    pub summary_interval_ops: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            retain_below_watermark: false,
            summary_interval_ops: 1000,
        }
    }
}

/// Client runtime limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on unacknowledged local operations per shared object
    pub max_pending_local_ops: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_pending_local_ops: 10_000,
        }
    }
}

/// Tracing output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `TANDEM_LOG` is unset
    pub level: String,
    /// Colourize output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl TandemConfig {
    /// Load configuration from a TOML file. Missing sections keep their
    /// defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TandemError::configuration(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TandemError::configuration(format!("Invalid TOML: {e}")))
    }

    /// Overlay `TANDEM_*` environment variables
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Overlay `TANDEM_<SECTION>_<FIELD>` pairs. Keys without the prefix are
    /// ignored; unknown keys under the prefix are rejected.
    pub fn merge_with_vars<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            // TANDEM_LOG is the tracing filter, not a config key
            if name == "LOG" {
                continue;
            }
            self.set_from_string(&name.to_lowercase(), value.as_ref())?;
        }
        Ok(())
    }

    /// Set a single value addressed as `section_field`
    pub fn set_from_string(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "protocol_max_message_size" => {
                self.protocol.max_message_size = parse_value(key, value)?;
            }
            "protocol_signal_buffer" => self.protocol.signal_buffer = parse_value(key, value)?,
            "compaction_retain_below_watermark" => {
                self.compaction.retain_below_watermark = parse_value(key, value)?;
            }
            "compaction_summary_interval_ops" => {
                self.compaction.summary_interval_ops = parse_value(key, value)?;
            }
            "runtime_max_pending_local_ops" => {
                self.runtime.max_pending_local_ops = parse_value(key, value)?;
            }
            "logging_level" => self.logging.level = value.to_lowercase(),
            "logging_ansi" => self.logging.ansi = parse_value(key, value)?,
            _ => {
                return Err(TandemError::configuration(format!(
                    "Unknown configuration key: {key}"
                )))
            }
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.protocol.max_message_size == 0 {
            return Err(TandemError::configuration(
                "protocol.max_message_size must be greater than zero",
            ));
        }
        if self.compaction.summary_interval_ops == 0 {
            return Err(TandemError::configuration(
                "compaction.summary_interval_ops must be greater than zero",
            ));
        }
        if self.runtime.max_pending_local_ops == 0 {
            return Err(TandemError::configuration(
                "runtime.max_pending_local_ops must be greater than zero",
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(TandemError::configuration(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TandemError::configuration(format!("Invalid value for {key}: {value}")))
}
