//! Logging utilities
//!
//! Logs go to stderr; stdout carries the worker protocol and printed
//! summaries.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a log level or a full filter directive
pub const LOG_ENV: &str = "SUITE_HARNESS_LOG";

/// Log level configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Filter for an explicit level, else `SUITE_HARNESS_LOG`, else info
fn build_filter(level: Option<LogLevel>) -> EnvFilter {
    if let Some(level) = level {
        return EnvFilter::new(format!("suite_harness={}", level.to_tracing_level()));
    }
    match std::env::var(LOG_ENV) {
        Ok(value) => match LogLevel::from_str(&value) {
            Some(level) => EnvFilter::new(format!("suite_harness={}", level.to_tracing_level())),
            None => EnvFilter::try_new(&value)
                .unwrap_or_else(|_| EnvFilter::new("suite_harness=info")),
        },
        Err(_) => EnvFilter::new("suite_harness=info"),
    }
}

/// Initialize the logger
pub fn init_logger(level: Option<LogLevel>) {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("unknown"), None);
    }

    #[test]
    fn test_explicit_level_wins() {
        let filter = build_filter(Some(LogLevel::Debug));
        assert!(filter.to_string().contains("suite_harness=debug"));
    }
}
