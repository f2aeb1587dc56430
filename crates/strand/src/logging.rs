//! Log level and format selection for the command line driver.
//!
//! Settings come from `--log-level`/`--log-format`, falling back to
//! `STRAND_LOG_LEVEL`/`STRAND_LOG_FORMAT`. `RUST_LOG` still wins when set.

use std::env;
use std::fmt;

pub const LEVEL_VAR: &str = "STRAND_LOG_LEVEL";
pub const FORMAT_VAR: &str = "STRAND_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.to_ascii_lowercase().as_str() {
            "text" | "plain" | "compact" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}

/// Effective logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: LogLevel::Warn,
        }
    }
}

/// Overrides given on the command line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub format: Option<LogFormat>,
    pub level: Option<LogLevel>,
}

impl LogSettings {
    /// Command line first, then the environment, then defaults.
    pub fn resolve(self) -> LogOptions {
        let format = env::var(FORMAT_VAR).ok();
        let level = env::var(LEVEL_VAR).ok();
        self.resolve_with(format.as_deref(), level.as_deref())
    }

    fn resolve_with(self, format: Option<&str>, level: Option<&str>) -> LogOptions {
        let defaults = LogOptions::default();
        LogOptions {
            format: self
                .format
                .or_else(|| format.and_then(LogFormat::parse))
                .unwrap_or(defaults.format),
            level: self
                .level
                .or_else(|| level.and_then(LogLevel::parse))
                .unwrap_or(defaults.level),
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(options: LogOptions) {
    use std::io::IsTerminal;
    use std::sync::OnceLock;
    use tracing_subscriber::{EnvFilter, fmt};

    static INSTALLED: OnceLock<()> = OnceLock::new();

    INSTALLED.get_or_init(|| {
        let ansi = env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(options.level.to_string()));
        let builder = fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true);
        let _ = match options.format {
            LogFormat::Json => {
                tracing::subscriber::set_global_default(builder.json().finish())
            }
            LogFormat::Text => {
                tracing::subscriber::set_global_default(builder.with_ansi(ansi).compact().finish())
            }
        };
    });
}
