//! Environment variable configuration
//!
//! Every application setting can be overridden by a `SUITE_HARNESS_*`
//! variable. File values are replaced, CLI flags still win.

use std::env;
use std::str::FromStr;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SUITE_HARNESS";

/// Overrides read from the environment
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvOverrides {
    /// SUITE_HARNESS_CONFIG
    pub config_file: Option<String>,
    /// SUITE_HARNESS_BACKEND
    pub backend: Option<String>,
    /// SUITE_HARNESS_DEADLINE
    pub deadline_secs: Option<u64>,
    /// SUITE_HARNESS_MAX_WORKERS
    pub max_workers: Option<usize>,
    /// SUITE_HARNESS_CANCEL_PENDING
    pub cancel_pending: Option<bool>,
    /// SUITE_HARNESS_POLL_INTERVAL_MS
    pub poll_interval_ms: Option<u64>,
    /// SUITE_HARNESS_PROVISION_TRIES
    pub provision_tries: Option<u32>,
    /// SUITE_HARNESS_PROVISION_DELAY
    pub provision_delay_secs: Option<u64>,
    /// SUITE_HARNESS_SSH_USER
    pub ssh_user: Option<String>,
    /// SUITE_HARNESS_SSH_KEY
    pub ssh_key: Option<String>,
    /// SUITE_HARNESS_LOG_DIR
    pub log_dir: Option<String>,
    /// SUITE_HARNESS_SKIPPED_IS_SUCCESS
    pub skipped_is_success: Option<bool>,
    /// SUITE_HARNESS_REPORT_URL
    pub report_url: Option<String>,
}

impl EnvOverrides {
    /// Load overrides from the process environment
    pub fn load() -> Self {
        Self::from_lookup(|name| env::var(format!("{ENV_PREFIX}_{name}")).ok())
    }

    /// Load overrides through `lookup`, which receives unprefixed names
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).map(|v| parse_bool(&v));

        Self {
            config_file: lookup("CONFIG"),
            backend: lookup("BACKEND"),
            deadline_secs: parse(&lookup, "DEADLINE"),
            max_workers: parse(&lookup, "MAX_WORKERS"),
            cancel_pending: flag("CANCEL_PENDING"),
            poll_interval_ms: parse(&lookup, "POLL_INTERVAL_MS"),
            provision_tries: parse(&lookup, "PROVISION_TRIES"),
            provision_delay_secs: parse(&lookup, "PROVISION_DELAY"),
            ssh_user: lookup("SSH_USER"),
            ssh_key: lookup("SSH_KEY"),
            log_dir: lookup("LOG_DIR"),
            skipped_is_success: flag("SKIPPED_IS_SUCCESS"),
            report_url: lookup("REPORT_URL"),
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "enabled"
    )
}
