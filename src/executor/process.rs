//! Child-process tasks
//!
//! A [`ProcessTask`] describes one unit of work executed in its own process,
//! so concurrently running units cannot observe each other's process-wide
//! state. The command's standard input is fed from a byte buffer and its
//! output is turned into the task value by a decoder.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

type Decoder<T> = Box<dyn FnOnce(Output) -> Result<T> + Send>;

/// Command executed by a process-backed task group
pub struct ProcessTask<T> {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    decode: Decoder<T>,
}

impl<T> ProcessTask<T> {
    /// Create a task whose value is produced by `decode` from the child's output
    pub fn new<F>(program: impl Into<PathBuf>, decode: F) -> Self
    where
        F: FnOnce(Output) -> Result<T> + Send + 'static,
    {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stdin: None,
            decode: Box::new(decode),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Spawn the child, feed its input and decode its output.
    ///
    /// The child is not killed if the caller stops waiting for it.
    pub async fn run(self) -> Result<T> {
        debug!("Spawning worker process {}", self.program.display());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        if let Some(input) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)
                    .await
                    .context("Failed to write worker input")?;
                // Dropping the pipe closes the child's stdin.
            }
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for worker process")?;

        (self.decode)(output)
    }
}

impl<T: DeserializeOwned + 'static> ProcessTask<T> {
    /// Task exchanging JSON: `request` on stdin, one JSON value on stdout
    pub fn json<R: Serialize>(program: impl Into<PathBuf>, request: &R) -> Result<Self> {
        let input = serde_json::to_vec(request).context("Failed to encode worker request")?;
        Ok(Self::new(program, decode_json).stdin(input))
    }
}

fn decode_json<T: DeserializeOwned>(output: Output) -> Result<T> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let payload = stdout.trim();
    if payload.is_empty() {
        anyhow::bail!(
            "worker exited with {} without a response",
            output.status.code().map_or("a signal".to_string(), |c| format!("code {c}"))
        );
    }
    serde_json::from_str(payload).context("Failed to decode worker response")
}

impl<T> fmt::Debug for ProcessTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTask")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("current_dir", &self.current_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::executor::{Backend, GroupConfig, TaskError, TaskGroup};
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Deserialize)]
    struct Reply {
        name: String,
        code: i32,
    }

    #[tokio::test]
    async fn test_json_task_decodes_stdout() {
        let task: ProcessTask<Reply> = ProcessTask::new("sh", decode_json)
            .args(["-c", r#"echo '{"name":"fio","code":0}'"#]);
        let reply = task.run().await.unwrap();
        assert_eq!(
            reply,
            Reply {
                name: "fio".to_string(),
                code: 0
            }
        );
    }

    #[tokio::test]
    async fn test_stdin_reaches_child() {
        let task = ProcessTask::new("cat", |output: Output| {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        })
        .stdin("ping");
        assert_eq!(task.run().await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn test_silent_worker_is_an_error() {
        let task: ProcessTask<Reply> =
            ProcessTask::new("sh", decode_json).args(["-c", "exit 3"]);
        let err = task.run().await.unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn test_process_group_runs_children_concurrently() {
        let config = GroupConfig::new(Backend::Process)
            .with_max_workers(2)
            .with_poll_interval(Duration::from_millis(5));
        let mut group = TaskGroup::new(config);
        for code in [0, 1] {
            let script = format!(r#"echo '{{"name":"w{code}","code":{code}}}'"#);
            let task = ProcessTask::new("sh", decode_json).args(["-c".to_string(), script]);
            group.spawn_process(task);
        }
        group.spawn_process(ProcessTask::new("sh", decode_json).args(["-c", "exit 2"]));

        let err = group.close().await.unwrap_err();
        assert!(matches!(err, TaskError::Failed { index: 2, .. }));
        let results: &[Reply] = group.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].code, 1);
    }
}
