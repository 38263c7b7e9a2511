use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

use super::{Clusters, RecipeCollector};
use crate::cluster::SshClient;

/// Fingerprint of the controlling host
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvironmentRecipe;

#[async_trait]
impl RecipeCollector for EnvironmentRecipe {
    async fn collect(&self, clusters: &Clusters) -> anyhow::Result<BTreeMap<String, String>> {
        let mut recipe = BTreeMap::new();
        recipe.insert("os".to_string(), std::env::consts::OS.to_string());
        recipe.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        recipe.insert(
            "tool_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        for cluster in clusters.values() {
            recipe.insert(
                format!("{}.nodes", cluster.name),
                cluster.nodes.len().to_string(),
            );
        }
        Ok(recipe)
    }
}

/// Named commands run on the first node of every cluster; each command's
/// trimmed output becomes a recipe value keyed `<cluster>.<name>`.
#[derive(Clone, Debug)]
pub struct RemoteRecipe {
    ssh: SshClient,
    commands: BTreeMap<String, String>,
}

impl RemoteRecipe {
    pub fn new(ssh: SshClient, commands: BTreeMap<String, String>) -> Self {
        Self { ssh, commands }
    }
}

#[async_trait]
impl RecipeCollector for RemoteRecipe {
    async fn collect(&self, clusters: &Clusters) -> anyhow::Result<BTreeMap<String, String>> {
        let mut recipe = EnvironmentRecipe.collect(clusters).await?;
        for cluster in clusters.values() {
            let Some(node) = cluster.first_node() else {
                continue;
            };
            let ssh = self.ssh.for_user(cluster.ssh_user.as_deref());
            for (name, command) in &self.commands {
                debug!("Collecting {} from {}", name, node.hostname);
                let output = ssh.exec_with_retry(&node.address, command).await?;
                if !output.is_success() {
                    anyhow::bail!(
                        "recipe command '{}' failed on {} with exit code {}",
                        name,
                        node.hostname,
                        output.exit_code
                    );
                }
                recipe.insert(
                    format!("{}.{}", cluster.name, name),
                    output.stdout.trim().to_string(),
                );
            }
        }
        Ok(recipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClusterHandle, Node};
    use chrono::Utc;

    #[tokio::test]
    async fn test_environment_recipe() {
        let mut clusters = Clusters::new();
        clusters.insert(
            "ceph".to_string(),
            ClusterHandle {
                name: "ceph".to_string(),
                nodes: vec![Node {
                    hostname: "node1".to_string(),
                    address: "10.0.0.1".to_string(),
                    roles: vec![],
                }],
                ssh_user: None,
                created_at: Utc::now(),
            },
        );

        let recipe = EnvironmentRecipe.collect(&clusters).await.unwrap();
        assert_eq!(recipe["os"], std::env::consts::OS);
        assert_eq!(recipe["tool_version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(recipe["ceph.nodes"], "1");
    }
}
