//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MODEMD_LOG_LEVEL`, `MODEMD_HOTPLUG_SOCKET`
//! 2. **Config file** — path via `--config <path>`, or `modemd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [daemon]
//! settle_window_ms = 1500      # hotplug add-debounce per physical device
//! max_timeouts = 3             # consecutive-timeout watchdog (0 disables)
//! command_timeout_ms = 5000
//!
//! [probe]
//! attempt_timeout_ms = 100
//! at_attempts = 6
//!
//! [poll]
//! timezone_interval_secs = 5
//! timezone_retries = 6
//! signal_interval_secs = 30
//! registration_interval_secs = 1
//! registration_retries = 60
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::modem::ModemConfig;
use crate::probe::ProbeConfig;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub poll: PollSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Discovery and command-queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Settle window after a hotplug add before dispatching a device's
    /// ports (default 1500 ms).
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,
    /// Consecutive command timeouts before a modem is declared
    /// unresponsive (default 3, 0 disables).
    #[serde(default = "default_max_timeouts")]
    pub max_timeouts: u32,
    /// Default per-command timeout in milliseconds (default 5000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Hotplug record source; `-` reads JSON lines from stdin. Override
    /// with `MODEMD_HOTPLUG_SOCKET`.
    #[serde(default = "default_hotplug_source")]
    pub hotplug_source: String,
}

/// Port classification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSection {
    /// Per-attempt response budget in milliseconds (default 100).
    #[serde(default = "default_probe_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// `AT` pings before a port is declared silent (default 6).
    #[serde(default = "default_probe_at_attempts")]
    pub at_attempts: u32,
}

/// Periodic poll settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PollSection {
    #[serde(default = "default_timezone_interval_secs")]
    pub timezone_interval_secs: u64,
    #[serde(default = "default_timezone_retries")]
    pub timezone_retries: u32,
    #[serde(default = "default_signal_interval_secs")]
    pub signal_interval_secs: u64,
    #[serde(default = "default_registration_interval_secs")]
    pub registration_interval_secs: u64,
    #[serde(default = "default_registration_retries")]
    pub registration_retries: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_settle_window_ms() -> u64 {
    1500
}
fn default_max_timeouts() -> u32 {
    3
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_hotplug_source() -> String {
    "-".to_string()
}
fn default_probe_attempt_timeout_ms() -> u64 {
    100
}
fn default_probe_at_attempts() -> u32 {
    6
}
fn default_timezone_interval_secs() -> u64 {
    5
}
fn default_timezone_retries() -> u32 {
    6
}
fn default_signal_interval_secs() -> u64 {
    30
}
fn default_registration_interval_secs() -> u64 {
    1
}
fn default_registration_retries() -> u32 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            settle_window_ms: default_settle_window_ms(),
            max_timeouts: default_max_timeouts(),
            command_timeout_ms: default_command_timeout_ms(),
            hotplug_source: default_hotplug_source(),
        }
    }
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_probe_attempt_timeout_ms(),
            at_attempts: default_probe_at_attempts(),
        }
    }
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            timezone_interval_secs: default_timezone_interval_secs(),
            timezone_retries: default_timezone_retries(),
            signal_interval_secs: default_signal_interval_secs(),
            registration_interval_secs: default_registration_interval_secs(),
            registration_retries: default_registration_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `modemd.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("modemd.toml").exists() {
            let content =
                std::fs::read_to_string("modemd.toml").expect("Failed to read modemd.toml");
            toml::from_str(&content).expect("Failed to parse modemd.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(level) = std::env::var("MODEMD_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(source) = std::env::var("MODEMD_HOTPLUG_SOCKET") {
            config.daemon.hotplug_source = source;
        }

        config
    }

    /// Per-modem knobs derived from the daemon and poll sections.
    #[must_use]
    pub fn modem_config(&self) -> ModemConfig {
        ModemConfig {
            max_timeouts: self.daemon.max_timeouts,
            command_timeout: Duration::from_millis(self.daemon.command_timeout_ms),
            registration_interval: Duration::from_secs(self.poll.registration_interval_secs),
            registration_retries: self.poll.registration_retries,
            timezone_interval: Duration::from_secs(self.poll.timezone_interval_secs),
            timezone_retries: self.poll.timezone_retries,
            signal_interval: Duration::from_secs(self.poll.signal_interval_secs),
        }
    }

    #[must_use]
    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            attempt_timeout: Duration::from_millis(self.probe.attempt_timeout_ms),
            at_attempts: self.probe.at_attempts,
        }
    }

    #[must_use]
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.daemon.settle_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.max_timeouts, 3);
        assert_eq!(config.poll.timezone_interval_secs, 5);
        assert_eq!(config.poll.timezone_retries, 6);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            max_timeouts = 5

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.daemon.max_timeouts, 5);
        assert_eq!(config.daemon.settle_window_ms, 1500);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.probe.at_attempts, 6);
    }
}
