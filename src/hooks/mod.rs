//! Side effects around entry dispatch
//!
//! A [`Monitor`] is started before an entry is dispatched and stopped after
//! it finished; a [`RecipeCollector`] fingerprints the environment once the
//! entry completed. Hook failures are logged by the scheduler and never
//! change an entry's outcome.

mod monitor;
mod recipe;

pub use monitor::{CommandMonitor, NoopMonitor};
pub use recipe::{EnvironmentRecipe, RemoteRecipe};

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::models::ClusterHandle;

/// Clusters an entry runs against, by name
pub type Clusters = BTreeMap<String, ClusterHandle>;

/// Performance or resource monitoring around one entry
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn start(&self, entry: &str, clusters: &Clusters) -> anyhow::Result<()>;

    async fn stop(&self, entry: &str, clusters: &Clusters) -> anyhow::Result<()>;
}

/// Environment/version fingerprint of the resources an entry ran against
#[async_trait]
pub trait RecipeCollector: Send + Sync {
    async fn collect(&self, clusters: &Clusters) -> anyhow::Result<BTreeMap<String, String>>;
}
