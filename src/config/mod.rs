//! Configuration module
//!
//! Application settings come from a YAML/JSON file, then `SUITE_HARNESS_*`
//! environment variables, then CLI flags. Suite files are loaded here too.

mod env;

pub use env::{EnvOverrides, ENV_PREFIX};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster::SshConfig;
use crate::executor::{Backend, GroupConfig, SchedulerSettings, PROVISION_TRIES};
use crate::models::Suite;

/// Config file name looked up in the working directory
pub const LOCAL_CONFIG: &str = "suite-harness.yaml";

/// Application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppConfig {
    /// Backend of parallel entries
    pub backend: Backend,

    /// Parallel entry deadline in seconds
    pub deadline_secs: u64,

    /// Concurrent workers per parallel entry; CPU count when unset
    pub max_workers: Option<usize>,

    /// Cancel queued tasks when the deadline elapses
    pub cancel_pending: bool,

    /// Scope exit polling interval in milliseconds
    pub poll_interval_ms: u64,

    pub provision_tries: u32,
    pub provision_delay_secs: u64,

    /// Check SSH reachability of inventory nodes before the run
    pub verify_ssh: bool,

    pub ssh: SshConfig,

    /// Parent directory of run directories; `/tmp` when unset
    pub log_dir: Option<PathBuf>,

    pub skipped_is_success: bool,

    /// Webhook receiving the run summary
    pub report_url: Option<String>,

    /// Target identifiers to skip
    pub skip: Vec<String>,

    /// Commands run on every node around each entry
    pub monitor: Option<MonitorCommands>,

    /// Named commands run on the first node of each cluster after each entry
    pub recipe_commands: BTreeMap<String, String>,
}

/// Start/stop commands of the command monitor; `{entry}` is substituted
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorCommands {
    pub start: String,
    pub stop: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Thread,
            deadline_secs: 3600,
            max_workers: None,
            cancel_pending: false,
            poll_interval_ms: 2000,
            provision_tries: PROVISION_TRIES,
            provision_delay_secs: 15,
            verify_ssh: false,
            ssh: SshConfig::default(),
            log_dir: None,
            skipped_is_success: true,
            report_url: None,
            skip: Vec::new(),
            monitor: None,
            recipe_commands: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Standard config locations, in order of precedence
    pub fn locations() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("suite-harness").join("config.yaml"));
        }
        paths
    }

    /// Load the explicit file, or the first existing standard location,
    /// then apply environment overrides
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        let overrides = EnvOverrides::load();
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| overrides.config_file.as_ref().map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match Self::locations().into_iter().find(|p| p.is_file()) {
                Some(path) => Self::load(path)?,
                None => Self::default(),
            },
        };
        config.apply_env(&overrides);
        Ok(config)
    }

    /// Replace file values with environment overrides
    pub fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(backend) = &env.backend {
            match Backend::from_str(backend) {
                Some(b) => self.backend = b,
                None => warn!("Ignoring unknown backend '{}' from {}_BACKEND", backend, ENV_PREFIX),
            }
        }
        if let Some(v) = env.deadline_secs {
            self.deadline_secs = v;
        }
        if let Some(v) = env.max_workers {
            self.max_workers = Some(v);
        }
        if let Some(v) = env.cancel_pending {
            self.cancel_pending = v;
        }
        if let Some(v) = env.poll_interval_ms {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env.provision_tries {
            self.provision_tries = v;
        }
        if let Some(v) = env.provision_delay_secs {
            self.provision_delay_secs = v;
        }
        if let Some(v) = &env.ssh_user {
            self.ssh.username = v.clone();
        }
        if let Some(v) = &env.ssh_key {
            self.ssh.private_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = &env.log_dir {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env.skipped_is_success {
            self.skipped_is_success = v;
        }
        if let Some(v) = &env.report_url {
            self.report_url = Some(v.clone());
        }
    }

    pub fn group_config(&self) -> GroupConfig {
        let mut group = GroupConfig::new(self.backend)
            .with_deadline(Duration::from_secs(self.deadline_secs))
            .cancel_pending(self.cancel_pending)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms));
        if let Some(workers) = self.max_workers {
            group = group.with_max_workers(workers);
        }
        group
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            skip_list: self.skip.clone(),
            group: self.group_config(),
            provision_tries: self.provision_tries.max(1),
            provision_delay: Duration::from_secs(self.provision_delay_secs),
            worker_program: None,
            ssh: self.ssh.clone(),
        }
    }
}

/// Load a suite file (YAML or JSON by extension)
pub fn load_suite(path: impl AsRef<Path>) -> Result<Suite> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read suite file {}", path.display()))?;

    let mut suite: Suite = if is_yaml_file(path) {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse suite {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse suite {}", path.display()))?
    };

    if suite.name.is_empty() {
        suite.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("suite")
            .to_string();
    }
    if suite.tests.is_empty() {
        warn!("Suite {} has no entries", suite.name);
    }
    Ok(suite)
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.backend, Backend::Thread);
        assert_eq!(config.deadline_secs, 3600);
        assert_eq!(config.provision_tries, 3);
        assert_eq!(config.provision_delay_secs, 15);
        assert!(config.skipped_is_success);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: AppConfig = serde_yaml::from_str(
            "backend: process\nmax-workers: 2\nskip: [fio]\nssh:\n  username: qa\n",
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Process);
        assert_eq!(config.max_workers, Some(2));
        assert_eq!(config.skip, vec!["fio".to_string()]);
        assert_eq!(config.ssh.username, "qa");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.deadline_secs, 3600);
    }

    #[test]
    fn test_load_yaml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = [
            (
                "config.yaml",
                "report-url: http://tracker/runs\nmonitor:\n  start: start-perf {entry}\n  stop: stop-perf\n",
            ),
            (
                "config.json",
                r#"{"report-url": "http://tracker/runs", "monitor": {"start": "start-perf {entry}", "stop": "stop-perf"}}"#,
            ),
        ];

        for (name, content) in files {
            let path = dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            let config = AppConfig::load(&path).unwrap();
            assert_eq!(config.report_url.as_deref(), Some("http://tracker/runs"));
            assert_eq!(
                config.monitor,
                Some(MonitorCommands {
                    start: "start-perf {entry}".to_string(),
                    stop: "stop-perf".to_string(),
                })
            );
            assert_eq!(config.deadline_secs, 3600);
        }
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = AppConfig::default();
        let env = EnvOverrides {
            backend: Some("process".to_string()),
            deadline_secs: Some(60),
            skipped_is_success: Some(false),
            ssh_user: Some("root".to_string()),
            ..Default::default()
        };
        config.apply_env(&env);
        assert_eq!(config.backend, Backend::Process);
        assert_eq!(config.deadline_secs, 60);
        assert!(!config.skipped_is_success);
        assert_eq!(config.ssh.username, "root");
    }

    #[test]
    fn test_scheduler_settings() {
        let config = AppConfig {
            max_workers: Some(3),
            poll_interval_ms: 50,
            skip: vec!["sleep".to_string()],
            ..Default::default()
        };
        let settings = config.scheduler_settings();
        assert_eq!(settings.group.workers(), 3);
        assert_eq!(settings.group.deadline(), Duration::from_secs(3600));
        assert_eq!(settings.group.poll_interval, Duration::from_millis(50));
        assert_eq!(settings.skip_list, vec!["sleep".to_string()]);
        assert_eq!(settings.provision_delay, Duration::from_secs(15));
    }

    #[test]
    fn test_load_suite_names_unnamed_suites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tier-1.yaml");
        std::fs::write(&path, "tests:\n  - name: nap\n    target: sleep\n").unwrap();

        let suite = load_suite(&path).unwrap();
        assert_eq!(suite.name, "tier-1");
        assert_eq!(suite.tests[0].target, "sleep");
    }

    #[test]
    fn test_load_suite_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_suite(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
