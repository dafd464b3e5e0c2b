//! Which environment the binary runs in, from `DOCKSTREAM_ENV`.
//!
//! `test` keeps configuration under the crate's `tmp/` directory,
//! `dev`/`development` turns on debug logging, and everything else
//! (including unset) is production.

/// Variable read by [`Environment::current`].
pub const ENV_VAR: &str = "DOCKSTREAM_ENV";

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Default.
    #[default]
    Production,
    /// `dev` / `development`.
    Development,
    /// `test`.
    Test,
}

impl Environment {
    /// Read [`ENV_VAR`].
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var(ENV_VAR).ok().as_deref())
    }

    /// Unknown values fall back to production.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("test") => Self::Test,
            Some("dev" | "development") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Test => "test",
        }
    }

    /// Whether this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        matches!(self, Self::Test)
    }

    /// `env_logger` filter used when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Development => "debug",
            Self::Production | Self::Test => "info",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shorthand for `Environment::current().is_test()`.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}
