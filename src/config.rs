//! Configuration management for Floodgate components.
//!
//! Configuration can be built in code or loaded from YAML. Every component
//! constructor validates its configuration and rejects unusable values with
//! [`FloodgateError::InvalidConfiguration`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// One fixed window layered into a rate limiter.
///
/// A window admits at most `max_attempts` within each `duration_secs`-long
/// slice of epoch time. Window boundaries align to whole-second multiples of
/// the duration, so two processes observing the same clock agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Window length in seconds
    pub duration_secs: f64,
    /// Maximum attempts admitted per window
    pub max_attempts: u32,
}

impl WindowSpec {
    /// Create a new window specification.
    pub fn new(duration_secs: f64, max_attempts: u32) -> Self {
        Self {
            duration_secs,
            max_attempts,
        }
    }

    /// Window length truncated to whole seconds, as used for epoch alignment.
    pub(crate) fn duration_whole_secs(&self) -> u64 {
        self.duration_secs as u64
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Layered windows; sorted ascending by duration during validation
    pub windows: Vec<WindowSpec>,

    /// Maximum number of keys tracked before least-recently-used eviction
    #[serde(default = "default_cache_size")]
    pub max_cache_size: usize,

    /// Base of the exponential penalty applied after consecutive failures
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RateLimiterConfig {
    /// Create a configuration with the given windows and default tuning.
    pub fn new(windows: Vec<WindowSpec>) -> Self {
        Self {
            windows,
            max_cache_size: default_cache_size(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }

    /// Validate the configuration and sort windows ascending by duration.
    pub fn validated(mut self) -> Result<Self> {
        if self.windows.is_empty() {
            return Err(FloodgateError::InvalidConfiguration(
                "at least one window is required".to_string(),
            ));
        }
        for window in &self.windows {
            if !window.duration_secs.is_finite() || window.duration_secs < 1.0 {
                return Err(FloodgateError::InvalidConfiguration(format!(
                    "window duration must be at least one second, got {}",
                    window.duration_secs
                )));
            }
            if window.max_attempts == 0 {
                return Err(FloodgateError::InvalidConfiguration(
                    "window max_attempts must be positive".to_string(),
                ));
            }
        }
        if self.max_cache_size == 0 {
            return Err(FloodgateError::InvalidConfiguration(
                "max_cache_size must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(FloodgateError::InvalidConfiguration(format!(
                "backoff_multiplier must be greater than 1, got {}",
                self.backoff_multiplier
            )));
        }
        self.windows
            .sort_by(|a, b| a.duration_secs.total_cmp(&b.duration_secs));
        Ok(self)
    }
}

fn default_cache_size() -> usize {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Request pacer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Target request rate in requests per second
    pub target_rate: f64,

    /// Snap scheduled times forward to the present when the caller is
    /// behind schedule, instead of queueing strictly from the last slot
    #[serde(default)]
    pub allow_catch_up: bool,

    /// Maximum number of keys tracked before least-recently-used eviction
    #[serde(default = "default_cache_size")]
    pub max_cache_size: usize,
}

impl PacerConfig {
    /// Create a configuration for the given target rate with default tuning.
    pub fn new(target_rate: f64) -> Self {
        Self {
            target_rate,
            allow_catch_up: false,
            max_cache_size: default_cache_size(),
        }
    }

    /// Validate the configuration.
    pub fn validated(self) -> Result<Self> {
        if !self.target_rate.is_finite() || self.target_rate <= 0.0 {
            return Err(FloodgateError::InvalidConfiguration(format!(
                "target_rate must be positive, got {}",
                self.target_rate
            )));
        }
        if self.max_cache_size == 0 {
            return Err(FloodgateError::InvalidConfiguration(
                "max_cache_size must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Top-level configuration combining both engine components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Rate limiter section, absent when only pacing is wanted
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,

    /// Pacer section, absent when only limiting is wanted
    #[serde(default)]
    pub pacer: Option<PacerConfig>,
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttling configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))
    }
}
