//! Cluster models
//!
//! Declared cluster inventories and the handles produced by provisioning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node declared in a suite's cluster inventory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub hostname: String,

    /// Address used for remote execution; defaults to the hostname
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,
}

/// Cluster declaration consumed by a provisioner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterSpec {
    pub name: String,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    /// Remote login user for the cluster's nodes
    #[serde(default)]
    pub ssh_user: Option<String>,
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            ssh_user: None,
        }
    }

    pub fn with_node(mut self, hostname: impl Into<String>, roles: &[&str]) -> Self {
        self.nodes.push(NodeSpec {
            hostname: hostname.into(),
            address: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        });
        self
    }
}

/// A provisioned node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub address: String,
    pub roles: Vec<String>,
}

impl Node {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Handle to a set of provisioned remote machines.
///
/// Referenced by tasks for issuing remote commands; created and destroyed
/// only by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHandle {
    pub name: String,
    pub nodes: Vec<Node>,
    pub ssh_user: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ClusterHandle {
    /// Nodes carrying the given role, or every node when `role` is `None`
    pub fn nodes_with_role(&self, role: Option<&str>) -> Vec<&Node> {
        match role {
            Some(role) => self.nodes.iter().filter(|n| n.has_role(role)).collect(),
            None => self.nodes.iter().collect(),
        }
    }

    pub fn first_node(&self) -> Option<&Node> {
        self.nodes.first()
    }
}

impl fmt::Display for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} nodes)", self.name, self.nodes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ClusterHandle {
        ClusterHandle {
            name: "ceph".to_string(),
            nodes: vec![
                Node {
                    hostname: "node1".to_string(),
                    address: "10.0.0.1".to_string(),
                    roles: vec!["mon".to_string(), "mgr".to_string()],
                },
                Node {
                    hostname: "node2".to_string(),
                    address: "10.0.0.2".to_string(),
                    roles: vec!["osd".to_string()],
                },
            ],
            ssh_user: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_nodes_with_role() {
        let handle = handle();
        assert_eq!(handle.nodes_with_role(Some("osd")).len(), 1);
        assert_eq!(handle.nodes_with_role(Some("rgw")).len(), 0);
        assert_eq!(handle.nodes_with_role(None).len(), 2);
    }

    #[test]
    fn test_cluster_spec_yaml() {
        let yaml = r#"
name: ceph
ssh-user: cephuser
nodes:
  - hostname: node1
    address: 10.0.0.1
    roles: [mon, mgr]
  - hostname: node2
"#;
        let spec: ClusterSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.ssh_user.as_deref(), Some("cephuser"));
        assert_eq!(spec.nodes.len(), 2);
        assert!(spec.nodes[1].roles.is_empty());
        assert!(spec.nodes[1].address.is_none());
    }
}
