//! Test targets
//!
//! A target is the code an entry runs against its clusters. Targets report a
//! status code ([`CODE_PASS`](crate::models::CODE_PASS), a failing code, or
//! [`CODE_SKIP`](crate::models::CODE_SKIP)) or return an error.

mod command;
mod sleep;

pub use command::CommandTarget;
pub use sleep::SleepTarget;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cluster::SshClient;
use crate::executor::TaskContext;
use crate::models::{ClusterHandle, ConfigMap};

/// Per-invocation context handed to a target.
///
/// Each invocation gets its own context, so concurrently running targets
/// never share comment or error state.
#[derive(Debug)]
pub struct TestContext {
    pub name: String,
    pub run_id: String,
    pub run_dir: PathBuf,

    /// Suite configuration merged with the entry's overrides
    pub config: ConfigMap,

    pub clusters: BTreeMap<String, ClusterHandle>,
    pub ssh: SshClient,
    comments: Vec<String>,
    task: Option<TaskContext>,
}

impl TestContext {
    pub fn new(
        name: impl Into<String>,
        run_id: impl Into<String>,
        run_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            run_id: run_id.into(),
            run_dir: run_dir.into(),
            config: ConfigMap::new(),
            clusters: BTreeMap::new(),
            ssh: SshClient::default(),
            comments: Vec::new(),
            task: None,
        }
    }

    pub fn with_config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    pub fn with_clusters(mut self, clusters: BTreeMap<String, ClusterHandle>) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn with_ssh(mut self, ssh: SshClient) -> Self {
        self.ssh = ssh;
        self
    }

    /// Attach the task group context when running as a group task
    pub fn with_task(mut self, task: TaskContext) -> Self {
        self.task = Some(task);
        self
    }

    /// True once an enclosing task group stopped waiting for this target
    pub fn shutdown_requested(&self) -> bool {
        self.task.as_ref().is_some_and(|t| t.shutdown_requested())
    }

    /// Completes when an enclosing task group requests shutdown; never
    /// completes for a directly invoked target.
    pub async fn shutdown(&self) {
        match &self.task {
            Some(task) => task.shutdown().await,
            None => std::future::pending().await,
        }
    }

    pub fn comment(&mut self, comment: impl Into<String>) {
        self.comments.push(comment.into());
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn take_comments(&mut self) -> Vec<String> {
        std::mem::take(&mut self.comments)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.config.get(key).and_then(Value::as_i64)
    }

    /// Cluster named by the `cluster` config key, or the first one
    pub fn cluster(&self) -> Option<&ClusterHandle> {
        match self.get_str("cluster") {
            Some(name) => self.clusters.get(name),
            None => self.clusters.values().next(),
        }
    }
}

/// Code executed for a suite entry
#[async_trait]
pub trait TestTarget: Send + Sync {
    /// Run against the clusters in `ctx` and return a status code
    async fn run(&self, ctx: &mut TestContext) -> anyhow::Result<i32>;

    fn description(&self) -> &str {
        ""
    }
}

/// Lookup table from target identifiers to targets
#[derive(Clone, Default)]
pub struct TargetRegistry {
    targets: BTreeMap<String, Arc<dyn TestTarget>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the targets shipped in this crate
    pub fn builtin() -> Self {
        Self::new()
            .with("command", CommandTarget)
            .with("sleep", SleepTarget)
    }

    pub fn with(mut self, id: impl Into<String>, target: impl TestTarget + 'static) -> Self {
        self.register(id, Arc::new(target));
        self
    }

    pub fn register(&mut self, id: impl Into<String>, target: Arc<dyn TestTarget>) {
        self.targets.insert(id.into(), target);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TestTarget>> {
        self.targets.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.targets.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.targets.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_registry() {
        let registry = TargetRegistry::builtin();
        assert!(registry.contains("command"));
        assert!(registry.contains("sleep"));
        assert!(registry.get("fio").is_none());
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["command", "sleep"]);
    }

    #[test]
    fn test_context_config_getters() {
        let mut config = ConfigMap::new();
        config.insert("pool".to_string(), json!("rbd"));
        config.insert("seconds".to_string(), json!(1.5));
        config.insert("local".to_string(), json!(true));

        let mut ctx = TestContext::new("io", "ABC123", "/tmp/run").with_config(config);
        assert_eq!(ctx.get_str("pool"), Some("rbd"));
        assert_eq!(ctx.get_f64("seconds"), Some(1.5));
        assert_eq!(ctx.get_bool("local"), Some(true));
        assert!(ctx.cluster().is_none());
        assert!(!ctx.shutdown_requested());

        ctx.comment("first");
        assert_eq!(ctx.take_comments(), vec!["first".to_string()]);
        assert!(ctx.comments().is_empty());
    }
}
