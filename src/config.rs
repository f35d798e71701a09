//! Configuration management with validation and defaults
//!
//! Timing windows for new games and the clock-skew tolerance used when
//! validating a leader's START. Values come from defaults, an optional TOML
//! file and `FAIRFLIP_*` environment overrides, in that order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Windows a leader writes into every START it issues
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub commitment_window_ms: u64,
    pub reveal_window_ms: u64,
    pub commitment_complete_window_ms: u64,
    pub slack_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            commitment_window_ms: 3_000,
            reveal_window_ms: 30_000,
            commitment_complete_window_ms: 15_000,
            slack_ms: 1_000,
        }
    }
}

/// Dealer configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DealerConfig {
    pub timing: TimingConfig,
    /// Largest tolerated distance between local, leader and server clocks
    pub max_clock_skew_ms: u64,
    /// Windows are stretched logarithmically once a game has more players than this
    pub inflate_after_players: usize,
}

impl Default for DealerConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            max_clock_skew_ms: 60 * 60 * 1_000,
            inflate_after_players: 5,
        }
    }
}

impl DealerConfig {
    /// Tight windows for flips among processes sharing one machine
    pub fn fast_local() -> Self {
        Self {
            timing: TimingConfig {
                commitment_window_ms: 500,
                reveal_window_ms: 5_000,
                commitment_complete_window_ms: 2_500,
                slack_ms: 250,
            },
            max_clock_skew_ms: 60_000,
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.timing.commitment_window_ms == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "commitment_window_ms must be > 0".to_string(),
            ));
        }

        if self.timing.reveal_window_ms == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "reveal_window_ms must be > 0".to_string(),
            ));
        }

        if self.max_clock_skew_ms == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "max_clock_skew_ms must be > 0".to_string(),
            ));
        }

        if self.inflate_after_players < 2 {
            return Err(ConfigValidationError::InvalidValue(
                "inflate_after_players must be >= 2".to_string(),
            ));
        }

        let limit = MAX_WINDOW.as_millis() as u64;
        let windows = [
            self.timing.commitment_window_ms,
            self.timing.reveal_window_ms,
            self.timing.commitment_complete_window_ms,
            self.timing.slack_ms,
        ];
        if windows.iter().any(|w| *w > limit) {
            return Err(ConfigValidationError::InvalidValue(format!(
                "timing windows must not exceed {} ms",
                limit
            )));
        }

        // Followers give the leader one slack period; it must not swallow the window.
        if self.timing.slack_ms >= self.timing.commitment_window_ms {
            return Err(ConfigValidationError::LogicalInconsistency(
                "slack_ms must be smaller than commitment_window_ms".to_string(),
            ));
        }

        Ok(())
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }

    /// How far back the history is scanned for earlier uses of a game id
    pub fn replay_horizon(&self) -> Duration {
        self.max_clock_skew() * 2
    }

    /// Parse a configuration from TOML text; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: DealerConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl TimingConfig {
    pub fn commitment_window(&self) -> Duration {
        Duration::from_millis(self.commitment_window_ms)
    }

    pub fn reveal_window(&self) -> Duration {
        Duration::from_millis(self.reveal_window_ms)
    }

    pub fn commitment_complete_window(&self) -> Duration {
        Duration::from_millis(self.commitment_complete_window_ms)
    }

    pub fn slack(&self) -> Duration {
        Duration::from_millis(self.slack_ms)
    }
}

/// Upper bound on any single timing window, on the wire or in config
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    InvalidValue(String),
    LogicalInconsistency(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValidationError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigValidationError::LogicalInconsistency(msg) => {
                write!(f, "Configuration logical inconsistency: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse TOML: {0}")]
    Parse(String),

    #[error("invalid value {value:?} for {field}: {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] ConfigValidationError),
}

/// Loads a [`DealerConfig`] from an optional file plus environment overrides
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration from file and process environment
    pub fn load(&self) -> Result<DealerConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Load configuration, resolving overrides through `lookup`
    pub fn load_with<F>(&self, lookup: F) -> Result<DealerConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &self.config_path {
            Some(path) => Self::load_from_file(path)?,
            None => DealerConfig::default(),
        };

        apply_overrides(&mut config, lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<DealerConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

fn apply_overrides<F>(config: &mut DealerConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let fields: [(&str, &mut u64); 5] = [
        ("FAIRFLIP_MAX_CLOCK_SKEW_MS", &mut config.max_clock_skew_ms),
        ("FAIRFLIP_COMMITMENT_WINDOW_MS", &mut config.timing.commitment_window_ms),
        ("FAIRFLIP_REVEAL_WINDOW_MS", &mut config.timing.reveal_window_ms),
        (
            "FAIRFLIP_COMMITMENT_COMPLETE_WINDOW_MS",
            &mut config.timing.commitment_complete_window_ms,
        ),
        ("FAIRFLIP_SLACK_MS", &mut config.timing.slack_ms),
    ];

    for (field, slot) in fields {
        if let Some(value) = lookup(field) {
            *slot = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: field.to_string(),
                value,
                reason: "expected a number of milliseconds".to_string(),
            })?;
        }
    }

    Ok(())
}

/// Overrides collected from a map, for callers that manage their own environment
pub fn overrides_from_map(map: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |key| map.get(key).cloned()
}
