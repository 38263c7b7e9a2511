//! External reporting of run summaries
//!
//! Sinks are best effort: the aggregator logs their errors and never lets
//! them change a run's exit indicator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::RunSummary;
use crate::models::TestStatus;

/// Destination for a finished run's summary
#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, summary: &RunSummary) -> Result<()>;
}

/// Writes one log line per failed entry plus a closing line
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn submit(&self, summary: &RunSummary) -> Result<()> {
        for record in summary
            .entries
            .iter()
            .filter(|r| r.status == TestStatus::Fail)
        {
            info!(
                "FAILED {} ({}): {}",
                record.name,
                record
                    .error_kind
                    .map(|k| k.to_string())
                    .unwrap_or_default(),
                record.error_message.as_deref().unwrap_or("")
            );
        }
        info!(
            "Run {} of {}: {}/{} passed, exit code {}",
            summary.run_id, summary.suite, summary.passed, summary.total, summary.exit_code
        );
        Ok(())
    }
}

/// Posts the JSON summary to an HTTP endpoint
#[derive(Clone, Debug)]
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReportSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn submit(&self, summary: &RunSummary) -> Result<()> {
        debug!("POST {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{} answered with HTTP {}", self.url, status);
        }
        info!("Submitted run summary to {}", self.url);
        Ok(())
    }
}
