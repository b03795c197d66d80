//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for macroflow, supporting:
//! - Environment variables for all configurable values
//! - Per-run settings built on top of them
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MACROFLOW_CONFIDENCE` | Default template match threshold | `0.9` |
//! | `MACROFLOW_POLL_INTERVAL_MS` | Polling interval for wait/retry actions (ms) | `250` |
//! | `MACROFLOW_WAIT_TIMEOUT_SECS` | Default `WaitForReference` timeout | `10` |
//! | `MACROFLOW_ELEMENT_TIMEOUT_SECS` | Default selector/XPath element timeout | `10` |
//! | `MACROFLOW_REFERENCE_DIR` | Base directory for relative reference paths | macro file's directory |
//! | `MACROFLOW_SESSION_DIR` | Base directory for run sessions | `/tmp/macroflow` |
//! | `MACROFLOW_LOG` | Log filter (falls back to `RUST_LOG`) | `info` |
//!
//! # Example
//!
//! ```bash
//! # Looser matching with faster polling
//! export MACROFLOW_CONFIDENCE=0.8
//! export MACROFLOW_POLL_INTERVAL_MS=100
//!
//! # Keep reference artifacts next to each other
//! export MACROFLOW_REFERENCE_DIR="$HOME/macros/refs"
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

/// Default template match threshold
pub const DEFAULT_CONFIDENCE: f64 = crate::screen::DEFAULT_CONFIDENCE;

/// Default polling interval (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Default wait-for-reference timeout (seconds)
pub const DEFAULT_WAIT_TIMEOUT_SECS: f64 = 10.0;

/// Default element lookup timeout (seconds)
pub const DEFAULT_ELEMENT_TIMEOUT_SECS: f64 = 10.0;

/// Default session base directory
pub const DEFAULT_SESSION_DIR: &str = "/tmp/macroflow";

/// Default log filter
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default mock screen width (pixels)
pub const DEFAULT_MOCK_WIDTH: u32 = 800;

/// Default mock screen height (pixels)
pub const DEFAULT_MOCK_HEIGHT: u32 = 600;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_CONFIDENCE: &str = "MACROFLOW_CONFIDENCE";

pub const ENV_POLL_INTERVAL_MS: &str = "MACROFLOW_POLL_INTERVAL_MS";

pub const ENV_WAIT_TIMEOUT_SECS: &str = "MACROFLOW_WAIT_TIMEOUT_SECS";

pub const ENV_ELEMENT_TIMEOUT_SECS: &str = "MACROFLOW_ELEMENT_TIMEOUT_SECS";

pub const ENV_REFERENCE_DIR: &str = "MACROFLOW_REFERENCE_DIR";

pub const ENV_SESSION_DIR: &str = "MACROFLOW_SESSION_DIR";

/// Log filter; `RUST_LOG` is consulted when unset
pub const ENV_LOG: &str = "MACROFLOW_LOG";

pub const ENV_RUST_LOG: &str = "RUST_LOG";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for macroflow
#[derive(Debug, Clone)]
pub struct Config {
    /// Matching and polling behaviour
    pub matching: MatchSettings,
    /// Where files live
    pub paths: PathSettings,
}

/// Matching and polling defaults
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSettings {
    /// Template match threshold in `[0, 1]`
    pub confidence: f64,
    /// Polling interval for wait/retry actions
    pub poll_interval: Duration,
    /// Default `WaitForReference` timeout
    pub wait_timeout: Duration,
    /// Default element lookup timeout
    pub element_timeout: Duration,
}

/// File system locations
#[derive(Debug, Clone, PartialEq)]
pub struct PathSettings {
    /// Base directory for relative reference paths (`None` = macro file's directory)
    pub reference_dir: Option<PathBuf>,
    /// Base directory for session storage
    pub session_dir: PathBuf,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            matching: MatchSettings::from_env(),
            paths: PathSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            matching: MatchSettings::defaults(),
            paths: PathSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MatchSettings {
    /// Create match settings from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create match settings with defaults
    pub fn defaults() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            wait_timeout: Duration::from_secs_f64(DEFAULT_WAIT_TIMEOUT_SECS),
            element_timeout: Duration::from_secs_f64(DEFAULT_ELEMENT_TIMEOUT_SECS),
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::defaults();
        Self {
            confidence: lookup(ENV_CONFIDENCE)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .map(|v| v.clamp(0.0, 1.0))
                .unwrap_or(defaults.confidence),
            poll_interval: lookup(ENV_POLL_INTERVAL_MS)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            wait_timeout: lookup(ENV_WAIT_TIMEOUT_SECS)
                .and_then(|s| parse_seconds(&s))
                .unwrap_or(defaults.wait_timeout),
            element_timeout: lookup(ENV_ELEMENT_TIMEOUT_SECS)
                .and_then(|s| parse_seconds(&s))
                .unwrap_or(defaults.element_timeout),
        }
    }
}

impl PathSettings {
    /// Create path settings from environment variables
    pub fn from_env() -> Self {
        Self {
            reference_dir: env::var_os(ENV_REFERENCE_DIR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            session_dir: env::var_os(ENV_SESSION_DIR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_DIR)),
        }
    }

    /// Create path settings with defaults
    pub fn defaults() -> Self {
        Self {
            reference_dir: None,
            session_dir: PathBuf::from(DEFAULT_SESSION_DIR),
        }
    }
}

// ============================================================================
// Per-run Settings
// ============================================================================

/// Settings snapshot for one run
///
/// Starts from the global configuration; the CLI overrides individual values.
///
/// ```
/// use macroflow::RunSettings;
/// use std::time::Duration;
///
/// let settings = RunSettings::default()
///     .confidence(0.8)
///     .poll_interval(Duration::from_millis(50));
/// assert_eq!(settings.confidence, 0.8);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Default match threshold for steps that do not set `confidence`
    pub confidence: f64,
    /// Default polling interval for steps that do not set `interval`
    pub poll_interval: Duration,
    /// Default timeout for `WaitForReference`
    pub wait_timeout: Duration,
    /// Default timeout for selector and XPath clicks
    pub element_timeout: Duration,
    /// Window to focus before the first step
    pub focus_window: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(get())
    }
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        let matching = &config.matching;
        Self {
            confidence: matching.confidence,
            poll_interval: matching.poll_interval,
            wait_timeout: matching.wait_timeout,
            element_timeout: matching.element_timeout,
            focus_window: None,
        }
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn element_timeout(mut self, timeout: Duration) -> Self {
        self.element_timeout = timeout;
        self
    }

    pub fn focus_window(mut self, title: impl Into<String>) -> Self {
        self.focus_window = Some(title.into());
        self
    }
}

/// Shortest sleep between polling attempts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse a non-negative number of seconds
fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
}

/// Log filter from `MACROFLOW_LOG`, then `RUST_LOG`
pub fn log_filter() -> Option<String> {
    env::var(ENV_LOG)
        .or_else(|_| env::var(ENV_RUST_LOG))
        .ok()
        .filter(|s| !s.trim().is_empty())
}

/// Get default match threshold (convenience function)
pub fn default_confidence() -> f64 {
    get().matching.confidence
}

/// Get session base directory (convenience function)
pub fn session_base_dir() -> PathBuf {
    get().paths.session_dir.clone()
}

/// Get reference base directory override (convenience function)
pub fn reference_dir() -> Option<PathBuf> {
    get().paths.reference_dir.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("2.5"), Some(Duration::from_millis(2500)));
        assert_eq!(parse_seconds(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_seconds("-1"), None);
        assert_eq!(parse_seconds("soon"), None);
        assert_eq!(parse_seconds("1e20"), None);
    }

    #[test]
    fn test_match_settings_from_lookup() {
        let settings = MatchSettings::from_lookup(lookup(&[
            (ENV_CONFIDENCE, "0.75"),
            (ENV_POLL_INTERVAL_MS, "40"),
            (ENV_WAIT_TIMEOUT_SECS, "3"),
        ]));
        assert_eq!(settings.confidence, 0.75);
        assert_eq!(settings.poll_interval, Duration::from_millis(40));
        assert_eq!(settings.wait_timeout, Duration::from_secs(3));
        assert_eq!(settings.element_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let settings = MatchSettings::from_lookup(lookup(&[
            (ENV_CONFIDENCE, "high"),
            (ENV_POLL_INTERVAL_MS, "0"),
            (ENV_WAIT_TIMEOUT_SECS, "-5"),
        ]));
        assert_eq!(settings, MatchSettings::defaults());

        let clamped = MatchSettings::from_lookup(lookup(&[(ENV_CONFIDENCE, "1.7")]));
        assert_eq!(clamped.confidence, 1.0);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.matching.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(config.paths.session_dir, PathBuf::from(DEFAULT_SESSION_DIR));
        assert_eq!(config.paths.reference_dir, None);
    }

    #[test]
    fn test_run_settings_builder() {
        let settings = RunSettings::from_config(&Config::defaults())
            .confidence(2.0)
            .poll_interval(Duration::ZERO)
            .focus_window("Editor");
        assert_eq!(settings.confidence, 1.0);
        assert_eq!(settings.poll_interval, MIN_POLL_INTERVAL);
        assert_eq!(settings.focus_window.as_deref(), Some("Editor"));
    }
}
