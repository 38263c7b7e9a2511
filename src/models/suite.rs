//! Suite and entry models
//!
//! A suite is an ordered list of entries plus global configuration. Entries
//! are immutable once the suite is loaded.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use super::ClusterSpec;

/// Entry-level configuration map
pub type ConfigMap = Map<String, Value>;

/// One named unit of suite work
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestEntry {
    pub name: String,

    /// Identifier of the target in the target registry
    #[serde(default)]
    pub target: String,

    /// Clusters the entry runs against; empty means every cluster
    #[serde(default)]
    pub clusters: Vec<String>,

    #[serde(default)]
    pub config: ConfigMap,

    /// Sub-entries dispatched together into one task group
    #[serde(default, deserialize_with = "entry_list")]
    pub parallel: Vec<TestEntry>,

    /// Overrides the suite-level abort-on-fail default
    #[serde(default)]
    pub abort_on_fail: Option<bool>,

    #[serde(default, rename = "do-not-skip-tc")]
    pub do_not_skip: bool,

    #[serde(default)]
    pub destroy_cluster: bool,

    #[serde(default)]
    pub recreate_cluster: bool,
}

impl TestEntry {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_parallel(mut self, entries: Vec<TestEntry>) -> Self {
        self.parallel = entries;
        self
    }

    pub fn abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = Some(abort);
        self
    }

    pub fn do_not_skip(mut self) -> Self {
        self.do_not_skip = true;
        self
    }

    pub fn is_parallel(&self) -> bool {
        !self.parallel.is_empty()
    }

    /// Identifier used for registry lookups and skip-list matching
    pub fn target_id(&self) -> &str {
        if self.target.is_empty() {
            &self.name
        } else {
            &self.target
        }
    }
}

/// Suite file contents
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Suite {
    /// Defaults to the suite file's stem when loaded from disk
    #[serde(default)]
    pub name: String,

    /// Global configuration merged under every entry's own config
    #[serde(default)]
    pub config: ConfigMap,

    #[serde(default)]
    pub abort_on_fail: bool,

    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,

    #[serde(default, deserialize_with = "entry_list")]
    pub tests: Vec<TestEntry>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterSpec) -> Self {
        self.clusters.push(cluster);
        self
    }

    pub fn with_entry(mut self, entry: TestEntry) -> Self {
        self.tests.push(entry);
        self
    }
}

/// One invocation of a suite
#[derive(Clone, Debug)]
pub struct SuiteRun {
    pub suite: Suite,
    pub run_id: String,
    pub run_dir: PathBuf,
}

impl SuiteRun {
    pub fn new(suite: Suite, run_id: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            suite,
            run_id: run_id.into(),
            run_dir: run_dir.into(),
        }
    }

    pub fn entries(&self) -> &[TestEntry] {
        &self.suite.tests
    }

    /// Effective abort-on-fail policy of an entry
    pub fn aborts_on_fail(&self, entry: &TestEntry) -> bool {
        entry.abort_on_fail.unwrap_or(self.suite.abort_on_fail)
    }
}

/// Entries may be written bare or wrapped as `- test: {...}`
#[derive(Deserialize)]
#[serde(untagged)]
enum EntryItem {
    Wrapped { test: TestEntry },
    Plain(TestEntry),
}

fn entry_list<'de, D>(deserializer: D) -> Result<Vec<TestEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = Vec::<EntryItem>::deserialize(deserializer)?;
    Ok(items
        .into_iter()
        .map(|item| match item {
            EntryItem::Wrapped { test } => test,
            EntryItem::Plain(entry) => entry,
        })
        .collect())
}

/// Deep-merge `overrides` on top of `base`.
///
/// Nested objects are merged key by key; any other value in `overrides`
/// replaces the base value.
pub fn merge_config(base: &ConfigMap, overrides: &ConfigMap) -> ConfigMap {
    let mut merged = base.clone();
    for (key, value) in overrides {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                *existing = merge_config(existing, incoming);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
