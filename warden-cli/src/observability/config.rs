//! Configuration types for logging.

use std::env;
use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for structured logging (ELK, Loki).
    Json,
    /// Human-readable pretty format with colors.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

impl LogFormat {
    /// `WARDEN_LOG_FORMAT` if set, otherwise pretty on a terminal and
    /// compact elsewhere.
    pub fn detect() -> Self {
        env::var("WARDEN_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
                    LogFormat::Pretty
                } else {
                    LogFormat::Compact
                }
            })
    }
}

/// Configuration for the tracing subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log output format.
    pub log_format: LogFormat,
    /// Log level filter (e.g., "info", "warn,warden_cluster=debug").
    pub log_filter: String,
    /// Whether to include source location in logs.
    pub include_location: bool,
    /// Whether to include thread IDs in logs.
    pub include_thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info".to_string(),
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl TracingConfig {
    /// Configuration for a CLI run with `-v` repeated `verbosity` times.
    ///
    /// `RUST_LOG` takes precedence over the verbosity count.
    pub fn for_verbosity(verbosity: u8) -> Self {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let flag = |name: &str| env::var(name).is_ok_and(|s| s == "true" || s == "1");

        Self {
            log_format: LogFormat::detect(),
            log_filter: env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()),
            include_location: flag("WARDEN_LOG_LOCATION"),
            include_thread_ids: flag("WARDEN_LOG_THREAD_IDS"),
        }
    }
}
