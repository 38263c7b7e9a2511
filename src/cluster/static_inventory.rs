//! Provisioner backed by a static node inventory

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

use super::{ProvisionError, Provisioner, SshClient};
use crate::models::{ClusterHandle, ClusterSpec, Node};

/// Builds cluster handles from the nodes declared in the suite.
///
/// With SSH verification enabled every node must answer over SSH; an
/// unreachable node is reported as a transient failure so that the caller can
/// retry while machines are still booting.
#[derive(Clone, Debug, Default)]
pub struct StaticProvisioner {
    ssh: Option<SshClient>,
}

impl StaticProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify_ssh(mut self, ssh: SshClient) -> Self {
        self.ssh = Some(ssh);
        self
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterHandle, ProvisionError> {
        if spec.nodes.is_empty() {
            return Err(ProvisionError::Fatal {
                cluster: spec.name.clone(),
                message: "no nodes declared".to_string(),
            });
        }

        let nodes: Vec<Node> = spec
            .nodes
            .iter()
            .map(|n| Node {
                hostname: n.hostname.clone(),
                address: n.address.clone().unwrap_or_else(|| n.hostname.clone()),
                roles: n.roles.clone(),
            })
            .collect();

        if let Some(ssh) = &self.ssh {
            let ssh = ssh.for_user(spec.ssh_user.as_deref());
            let limit = Duration::from_secs(ssh.config().timeout_secs);
            for node in &nodes {
                debug!("Verifying SSH access to {} ({})", node.hostname, node.address);
                if !ssh.wait_for_ssh(&node.address, limit).await {
                    return Err(ProvisionError::Transient {
                        cluster: spec.name.clone(),
                        message: format!("node {} is not reachable", node.hostname),
                    });
                }
            }
        }

        info!("Cluster {} ready with {} node(s)", spec.name, nodes.len());
        Ok(ClusterHandle {
            name: spec.name.clone(),
            nodes,
            ssh_user: spec.ssh_user.clone(),
            created_at: Utc::now(),
        })
    }

    async fn destroy(&self, cluster: &ClusterHandle) -> anyhow::Result<()> {
        // Static machines outlive the run; only the handle is released.
        info!("Released cluster {}", cluster);
        Ok(())
    }
}
