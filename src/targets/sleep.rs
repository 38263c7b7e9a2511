use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::{TestContext, TestTarget};
use crate::models::CODE_PASS;

/// Waits for `seconds`, then returns `code` (default 0).
///
/// Stops early when an enclosing task group requests shutdown.
#[derive(Clone, Copy, Debug, Default)]
pub struct SleepTarget;

#[async_trait]
impl TestTarget for SleepTarget {
    async fn run(&self, ctx: &mut TestContext) -> anyhow::Result<i32> {
        let seconds = ctx.get_f64("seconds").unwrap_or(0.0).max(0.0);
        let code = match ctx.get_i64("code") {
            Some(code) => i32::try_from(code)?,
            None => CODE_PASS,
        };

        info!("{}: sleeping {:.1}s", ctx.name, seconds);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
            _ = ctx.shutdown() => {
                warn!("{}: interrupted by shutdown request", ctx.name);
                anyhow::bail!("interrupted after shutdown request");
            }
        }

        ctx.comment(format!("slept {seconds:.1}s"));
        Ok(code)
    }

    fn description(&self) -> &str {
        "wait for a configured duration"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sleep_returns_configured_code() {
        let mut ctx = TestContext::new("nap", "ABC123", "/tmp/run");
        ctx.config.insert("seconds".to_string(), json!(0.01));
        ctx.config.insert("code".to_string(), json!(3));

        assert_eq!(SleepTarget.run(&mut ctx).await.unwrap(), 3);
        assert_eq!(ctx.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_sleep_defaults_to_pass() {
        let mut ctx = TestContext::new("nap", "ABC123", "/tmp/run");
        assert_eq!(SleepTarget.run(&mut ctx).await.unwrap(), CODE_PASS);
    }
}
