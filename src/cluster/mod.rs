//! Cluster provisioning and remote access
//!
//! The scheduler acquires a [`ClusterHandle`] per declared cluster through a
//! [`Provisioner`] before running entries, and releases it on request.

mod ssh;
mod static_inventory;

pub use ssh::{exec_local, CommandOutput, SshClient, SshConfig};
pub use static_inventory::StaticProvisioner;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ClusterHandle, ClusterSpec};

/// Error raised by a provisioning backend
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Retryable failure, such as a node that is not reachable yet
    #[error("transient provisioning failure for '{cluster}': {message}")]
    Transient { cluster: String, message: String },

    #[error("provisioning failed for '{cluster}': {message}")]
    Fatal { cluster: String, message: String },
}

impl ProvisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionError::Transient { .. })
    }
}

/// Source of cluster handles
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Bring up (or look up) the cluster described by `spec`
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterHandle, ProvisionError>;

    /// Release a cluster acquired through [`create`](Provisioner::create)
    async fn destroy(&self, cluster: &ClusterHandle) -> anyhow::Result<()>;
}
