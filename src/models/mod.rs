//! Data models for suite execution
//!
//! This module contains the data structures shared by the scheduler, the
//! task groups and the result pipeline.

mod cluster;
mod record;
mod suite;

pub use cluster::{ClusterHandle, ClusterSpec, Node, NodeSpec};
pub use record::{ErrorKind, TestRecord, TestStatus, CODE_PASS, CODE_SKIP};
pub use suite::{merge_config, ConfigMap, Suite, SuiteRun, TestEntry};
