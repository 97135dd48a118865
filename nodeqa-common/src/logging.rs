//! Structured logging initialization for nodeqa.
//!
//! Scenario steps log through `tracing`; the binary installs the subscriber
//! once at startup from environment configuration.

use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, fmt,
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    util::SubscriberInitExt,
};

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-friendly, pretty-printed logs.
    Pretty,
    /// JSON-formatted logs for machine parsing.
    Json,
    /// Compact single-line logs.
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Configuration for logging initialization.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (trace, debug, info, warn, error, off).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Optional file path for daily-rotated logs.
    pub file_path: Option<PathBuf>,
    /// Per-target log level overrides.
    pub targets: BTreeMap<String, String>,
    /// Include target in log output.
    pub with_target: bool,
    /// Write console logs to stderr instead of stdout.
    pub use_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            file_path: None,
            targets: BTreeMap::new(),
            with_target: true,
            use_stderr: true,
        }
    }
}

impl LogConfig {
    /// Build a logging configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - NODEQA_LOG_LEVEL
    /// - NODEQA_LOG_FORMAT (pretty|json|compact)
    /// - NODEQA_LOG_FILE (path to rotating log file)
    /// - NODEQA_LOG_TARGETS (comma-separated target=level list)
    pub fn from_env(default_level: &str) -> Self {
        let mut config = Self {
            level: std::env::var("NODEQA_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string()),
            ..Self::default()
        };

        if let Ok(format) = std::env::var("NODEQA_LOG_FORMAT")
            && let Some(parsed) = LogFormat::parse(&format)
        {
            config.format = parsed;
        }

        if let Ok(path) = std::env::var("NODEQA_LOG_FILE")
            && !path.trim().is_empty()
        {
            config.file_path = Some(PathBuf::from(path));
        }

        if let Ok(targets) = std::env::var("NODEQA_LOG_TARGETS") {
            config.targets = parse_target_overrides(&targets);
        }

        config
    }

    /// Override the base log level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Build the effective EnvFilter, honoring RUST_LOG if set.
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some()
            && let Ok(filter) = EnvFilter::try_from_default_env()
        {
            return filter;
        }

        let mut filter = self.level.clone();
        for (target, level) in &self.targets {
            filter.push_str(&format!(",{}={}", target, level));
        }
        EnvFilter::new(filter)
    }
}

/// Guards required to keep background logging workers alive.
pub struct LoggingGuards {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize tracing-based logging for the current process.
///
/// Keep the returned guards alive until exit when file logging is enabled.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = config.env_filter();
    let (writer, file_guard) = build_writer(config);
    let ansi = file_guard.is_none() && config.format != LogFormat::Json;

    let builder = fmt::Subscriber::builder()
        .with_writer(writer)
        .with_target(config.with_target)
        .with_env_filter(filter)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Pretty => finish_subscriber(builder.pretty().finish(), file_guard),
        LogFormat::Json => finish_subscriber(builder.json().finish(), file_guard),
        LogFormat::Compact => finish_subscriber(builder.compact().finish(), file_guard),
    }
}

fn build_writer(
    config: &LogConfig,
) -> (
    BoxMakeWriter,
    Option<tracing_appender::non_blocking::WorkerGuard>,
) {
    let base_writer = if config.use_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let Some(path) = config.file_path.as_ref() else {
        return (base_writer, None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("nodeqa.log"));
    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    (BoxMakeWriter::new(base_writer.and(non_blocking)), Some(guard))
}

fn finish_subscriber<S>(
    subscriber: S,
    file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
) -> Result<LoggingGuards>
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = subscriber.try_init()
        && !err.to_string().contains("already initialized")
    {
        return Err(err.into());
    }

    Ok(LoggingGuards {
        _file_guard: file_guard,
    })
}

fn parse_target_overrides(value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for entry in value.split(',') {
        let Some((target, level)) = entry.trim().split_once('=') else {
            continue;
        };
        let target = target.trim();
        let level = level.trim().to_lowercase();
        if target.is_empty() || !is_valid_level(&level) {
            continue;
        }
        map.insert(target.to_string(), level);
    }
    map
}

fn is_valid_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        let targets = parse_target_overrides("nodeqa_common::oob=debug,openssh=warn,bogus");
        assert_eq!(
            targets.get("nodeqa_common::oob"),
            Some(&"debug".to_string())
        );
        assert_eq!(targets.get("openssh"), Some(&"warn".to_string()));
        assert!(!targets.contains_key("bogus"));
    }

    #[test]
    fn test_parse_targets_rejects_bad_level() {
        let targets = parse_target_overrides("nodeqa=loud");
        assert!(targets.is_empty());
    }

    #[test]
    fn test_env_filter_builds_overrides() {
        let mut config = LogConfig::default().with_level("warn");
        config
            .targets
            .insert("nodeqa_common::exec".to_string(), "trace".to_string());
        let filter = format!("{}", config.env_filter());
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(filter.contains("warn"));
            assert!(filter.contains("nodeqa_common::exec=trace"));
        }
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }
}
