use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{TestContext, TestTarget};
use crate::cluster::{exec_local, CommandOutput};
use crate::models::CODE_PASS;

/// Runs shell commands on cluster nodes.
///
/// Config keys:
/// - `commands` (string or list; `command` is accepted as well)
/// - `role`: only nodes carrying this role, default every node
/// - `cluster`: cluster name, default the first cluster of the entry
/// - `local`: run on the controlling host instead of over SSH
///
/// Every command runs on every selected node. The first failing exit code
/// is returned after all commands ran.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandTarget;

fn commands(ctx: &TestContext) -> anyhow::Result<Vec<String>> {
    let value = ctx
        .get("commands")
        .or_else(|| ctx.get("command"))
        .context("missing 'commands' in entry config")?;
    match value {
        Value::String(cmd) => Ok(vec![cmd.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .with_context(|| format!("command must be a string, got {item}"))
            })
            .collect(),
        other => anyhow::bail!("'commands' must be a string or list, got {other}"),
    }
}

fn record(ctx: &mut TestContext, host: &str, command: &str, output: &CommandOutput) {
    debug!("{}: {}", host, output.stdout.trim_end());
    if output.is_success() {
        ctx.comment(format!("{host}: `{command}` ok"));
    } else {
        warn!(
            "{}: `{}` exited with {}: {}",
            host,
            command,
            output.exit_code,
            output.stderr.trim_end()
        );
        ctx.comment(format!("{host}: `{command}` exited with {}", output.exit_code));
    }
}

#[async_trait]
impl TestTarget for CommandTarget {
    async fn run(&self, ctx: &mut TestContext) -> anyhow::Result<i32> {
        let commands = commands(ctx)?;
        let mut code = CODE_PASS;

        if ctx.get_bool("local").unwrap_or(false) {
            for command in &commands {
                info!("{}: running `{}` locally", ctx.name, command);
                let output = exec_local(command).await?;
                record(ctx, "localhost", command, &output);
                if code == CODE_PASS && !output.is_success() {
                    code = output.exit_code;
                }
            }
            return Ok(code);
        }

        let cluster = ctx
            .cluster()
            .context("entry has no cluster to run commands on")?
            .clone();
        let role = ctx.get_str("role").map(str::to_string);
        let nodes = cluster.nodes_with_role(role.as_deref());
        if nodes.is_empty() {
            anyhow::bail!(
                "no nodes with role '{}' in cluster {}",
                role.as_deref().unwrap_or("*"),
                cluster.name
            );
        }

        let ssh = ctx.ssh.for_user(cluster.ssh_user.as_deref());
        for command in &commands {
            for node in &nodes {
                info!("{}: running `{}` on {}", ctx.name, command, node.hostname);
                let output = ssh.exec(&node.address, command).await?;
                record(ctx, &node.hostname, command, &output);
                if code == CODE_PASS && !output.is_success() {
                    code = output.exit_code;
                }
            }
        }
        Ok(code)
    }

    fn description(&self) -> &str {
        "run shell commands on cluster nodes"
    }
}
