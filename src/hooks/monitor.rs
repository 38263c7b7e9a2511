use async_trait::async_trait;
use tracing::{debug, info};

use super::{Clusters, Monitor};
use crate::cluster::SshClient;

/// Monitor that does nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMonitor;

#[async_trait]
impl Monitor for NoopMonitor {
    async fn start(&self, _entry: &str, _clusters: &Clusters) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _entry: &str, _clusters: &Clusters) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs a start and a stop command on every node of every cluster.
///
/// `{entry}` in either command is replaced with the entry name, so that a
/// collector can write per-entry output files.
#[derive(Clone, Debug)]
pub struct CommandMonitor {
    ssh: SshClient,
    start_command: String,
    stop_command: String,
}

impl CommandMonitor {
    pub fn new(
        ssh: SshClient,
        start_command: impl Into<String>,
        stop_command: impl Into<String>,
    ) -> Self {
        Self {
            ssh,
            start_command: start_command.into(),
            stop_command: stop_command.into(),
        }
    }

    async fn run_everywhere(
        &self,
        template: &str,
        entry: &str,
        clusters: &Clusters,
    ) -> anyhow::Result<()> {
        let command = render(template, entry);
        for cluster in clusters.values() {
            let ssh = self.ssh.for_user(cluster.ssh_user.as_deref());
            for node in &cluster.nodes {
                debug!("Monitor on {}: {}", node.hostname, command);
                let output = ssh.exec(&node.address, &command).await?;
                if !output.is_success() {
                    anyhow::bail!(
                        "monitor command failed on {} with exit code {}: {}",
                        node.hostname,
                        output.exit_code,
                        output.stderr.trim_end()
                    );
                }
            }
        }
        Ok(())
    }
}

fn render(template: &str, entry: &str) -> String {
    template.replace("{entry}", entry)
}

#[async_trait]
impl Monitor for CommandMonitor {
    async fn start(&self, entry: &str, clusters: &Clusters) -> anyhow::Result<()> {
        info!("Starting monitor for {}", entry);
        self.run_everywhere(&self.start_command, entry, clusters).await
    }

    async fn stop(&self, entry: &str, clusters: &Clusters) -> anyhow::Result<()> {
        info!("Stopping monitor for {}", entry);
        self.run_everywhere(&self.stop_command, entry, clusters).await
    }
}
