//! Sub-entry execution shared by both task-group backends
//!
//! A parallel entry's sub-entries are described by [`WorkerRequest`]s and
//! answered with [`WorkerResponse`]s. Thread-backed groups call [`execute`]
//! directly; process-backed groups re-run this binary with the hidden
//! `worker` subcommand, which reads one request from stdin and prints one
//! response to stdout through [`serve`].

use anyhow::Context;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use tracing::{debug, error};

use super::TaskContext;
use crate::cluster::{SshClient, SshConfig};
use crate::models::{ClusterHandle, ConfigMap, ErrorKind, TestEntry, CODE_PASS};
use crate::targets::{TargetRegistry, TestContext};

/// Status code reported for a sub-entry that raised instead of returning
pub const CODE_ERROR: i32 = 1;

/// Everything a worker needs to run one sub-entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub entry: TestEntry,

    /// Configuration already merged with the suite and parent entry
    pub config: ConfigMap,

    pub clusters: BTreeMap<String, ClusterHandle>,
    pub run_id: String,
    pub run_dir: PathBuf,

    #[serde(default)]
    pub ssh: SshConfig,
}

/// Outcome of one sub-entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub name: String,
    pub code: i32,

    #[serde(default)]
    pub comments: Vec<String>,

    #[serde(default)]
    pub error_kind: Option<ErrorKind>,

    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerResponse {
    fn failed(name: &str, kind: ErrorKind, message: String) -> Self {
        Self {
            name: name.to_string(),
            code: CODE_ERROR,
            comments: Vec::new(),
            error_kind: Some(kind),
            error: Some(message),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.code == CODE_PASS && self.error.is_none()
    }
}

/// Run the sub-entry described by `request` in the current process
pub async fn execute(
    registry: &TargetRegistry,
    request: WorkerRequest,
    task: Option<TaskContext>,
) -> WorkerResponse {
    let name = request.entry.name.clone();
    let target_id = request.entry.target_id().to_string();

    let Some(target) = registry.get(&target_id) else {
        return WorkerResponse::failed(
            &name,
            ErrorKind::UnknownTarget,
            format!("unknown target '{target_id}'"),
        );
    };

    let mut ctx = TestContext::new(&name, request.run_id, request.run_dir)
        .with_config(request.config)
        .with_clusters(request.clusters)
        .with_ssh(SshClient::new(request.ssh));
    if let Some(task) = task {
        ctx = ctx.with_task(task);
    }

    debug!("Running sub-entry {} with target {}", name, target_id);
    let outcome = AssertUnwindSafe(target.run(&mut ctx)).catch_unwind().await;
    let comments = ctx.take_comments();

    let mut response = match outcome {
        Ok(Ok(code)) => WorkerResponse {
            name: name.clone(),
            code,
            comments: Vec::new(),
            error_kind: None,
            error: None,
        },
        Ok(Err(e)) => WorkerResponse::failed(&name, ErrorKind::TargetFailure, format!("{e:#}")),
        Err(panic) => WorkerResponse::failed(
            &name,
            ErrorKind::Panic,
            super::group::panic_message(panic.as_ref()),
        ),
    };
    response.comments = comments;
    response
}

/// Child side of the process backend: one request in, one response out
pub async fn serve(registry: &TargetRegistry) -> anyhow::Result<()> {
    serve_io(registry, std::io::stdin(), std::io::stdout()).await
}

async fn serve_io<R: Read, W: Write>(
    registry: &TargetRegistry,
    mut input: R,
    mut output: W,
) -> anyhow::Result<()> {
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .context("Failed to read worker request")?;
    let request: WorkerRequest =
        serde_json::from_str(&raw).context("Failed to parse worker request")?;

    let response = execute(registry, request, None).await;
    if let Some(message) = &response.error {
        error!("{}: {}", response.name, message);
    }

    serde_json::to_writer(&mut output, &response).context("Failed to write worker response")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}
