//! Configuration loading and persistence.
//!
//! Settings live in `config.json` under the config directory. Every field can
//! be overridden with a `DOCKSTREAM_*` environment variable; unparsable
//! overrides are ignored with a warning.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;

use crate::log_buffer::{clamp_viewer_capacity, DEFAULT_FOOTER_CAPACITY, DEFAULT_VIEWER_CAPACITY};
use crate::reconnect::{ReconnectPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS};
use crate::ws::build_ws_url;

/// Configuration for the event stream client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the backend (`http(s)` is rewritten to `ws(s)`).
    pub ws_base_url: String,
    /// Path of the streaming endpoint.
    pub ws_path: String,
    /// Base reconnection delay in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Consecutive failed attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Footer panel buffer size.
    pub footer_capacity: usize,
    /// Default log viewer buffer size.
    pub viewer_max_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8080".to_string(),
            ws_path: "/ws/logs".to_string(),
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            footer_capacity: DEFAULT_FOOTER_CAPACITY,
            viewer_max_lines: DEFAULT_VIEWER_CAPACITY,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/dockstream-test`
    /// 2. `DOCKSTREAM_CONFIG_DIR` env var: explicit override
    /// 3. `DOCKSTREAM_ENV=test`: `tmp/dockstream-test` (integration tests)
    /// 4. Default: platform config dir (e.g. `~/.config/dockstream`)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/dockstream-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("DOCKSTREAM_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_test_mode() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/dockstream-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("dockstream")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Path of the config file.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from the config file (defaults if absent), then apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply `DOCKSTREAM_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup` (environment variable name -> value).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DOCKSTREAM_WS_BASE_URL") {
            self.ws_base_url = url;
        }
        if let Some(path) = lookup("DOCKSTREAM_WS_PATH") {
            self.ws_path = path;
        }
        override_parsed(&lookup, "DOCKSTREAM_RECONNECT_DELAY_MS", &mut self.reconnect_delay_ms);
        override_parsed(
            &lookup,
            "DOCKSTREAM_MAX_RECONNECT_ATTEMPTS",
            &mut self.max_reconnect_attempts,
        );
        override_parsed(&lookup, "DOCKSTREAM_FOOTER_CAPACITY", &mut self.footer_capacity);
        override_parsed(&lookup, "DOCKSTREAM_VIEWER_MAX_LINES", &mut self.viewer_max_lines);

        if self.footer_capacity == 0 {
            log::warn!("footer_capacity must be > 0, using {}", DEFAULT_FOOTER_CAPACITY);
            self.footer_capacity = DEFAULT_FOOTER_CAPACITY;
        }
        self.viewer_max_lines = clamp_viewer_capacity(self.viewer_max_lines);
    }

    /// Persist to the config file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Persist to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Full streaming endpoint URL.
    #[must_use]
    pub fn ws_url(&self) -> String {
        build_ws_url(&self.ws_base_url, &self.ws_path)
    }

    /// Reconnection policy for [`crate::StreamConnection`].
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring {}={:?}: not a valid number", key, raw),
        }
    }
}
