//! Run summaries and the run exit indicator

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use super::{ReportSink, ResultsStorage};
use crate::executor::SuiteOutcome;
use crate::models::{TestRecord, TestStatus};
use crate::utils::format_duration;

/// Environment information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    /// Operating system
    pub os: String,

    /// Architecture
    pub arch: String,

    /// Tool version
    pub tool_version: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Persisted summary of one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub suite: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Total elapsed wall time in milliseconds
    pub duration_ms: u64,

    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_run: usize,

    /// Zero only if no entry failed
    pub exit_code: i32,

    pub aborted_at: Option<String>,
    pub provisioning_error: Option<String>,
    pub environment: EnvironmentInfo,

    /// Entry records in suite order
    pub entries: Vec<TestRecord>,
}

impl RunSummary {
    /// Pass rate over executed entries, in percent
    pub fn pass_rate(&self) -> f64 {
        let executed = self.total - self.not_run;
        if executed == 0 {
            0.0
        } else {
            (self.passed as f64 / executed as f64) * 100.0
        }
    }
}

/// Turns a scheduler outcome into a summary, persists it and reports it
#[derive(Clone)]
pub struct ResultAggregator {
    skipped_is_success: bool,
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self {
            skipped_is_success: true,
            sinks: Vec::new(),
        }
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether skipped entries count as successful for the exit indicator
    pub fn skipped_is_success(mut self, value: bool) -> Self {
        self.skipped_is_success = value;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// 0 when every executed entry passed (or was skipped, if allowed)
    pub fn exit_code(&self, outcome: &SuiteOutcome) -> i32 {
        if outcome.provisioning_error.is_some() {
            return 1;
        }
        let ok = outcome.records.iter().all(|r| match r.status {
            TestStatus::Pass | TestStatus::NotExecuted => true,
            TestStatus::Skipped => self.skipped_is_success,
            TestStatus::Fail | TestStatus::Running => false,
        });
        if ok {
            0
        } else {
            1
        }
    }

    pub fn summarize(&self, outcome: &SuiteOutcome) -> RunSummary {
        let count = |status: TestStatus| {
            outcome
                .records
                .iter()
                .filter(|r| r.status == status)
                .count()
        };
        let duration_ms = (outcome.finished_at - outcome.started_at)
            .num_milliseconds()
            .max(0) as u64;

        RunSummary {
            run_id: outcome.run_id.clone(),
            suite: outcome.suite.clone(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            duration_ms,
            total: outcome.records.len(),
            passed: count(TestStatus::Pass),
            failed: count(TestStatus::Fail),
            skipped: count(TestStatus::Skipped),
            not_run: count(TestStatus::NotExecuted),
            exit_code: self.exit_code(outcome),
            aborted_at: outcome.aborted_at.clone(),
            provisioning_error: outcome.provisioning_error.clone(),
            environment: EnvironmentInfo::default(),
            entries: outcome.records.clone(),
        }
    }

    /// Submit to every sink; failures are only logged
    pub async fn report(&self, summary: &RunSummary) {
        for sink in &self.sinks {
            if let Err(e) = sink.submit(summary).await {
                error!("Report sink '{}' failed: {:#}", sink.name(), e);
            }
        }
    }

    /// Summarize, write `<run_dir>/run_summary.json`, then report
    pub async fn finalize(&self, outcome: &SuiteOutcome) -> Result<(RunSummary, PathBuf)> {
        let summary = self.summarize(outcome);
        let path = ResultsStorage::save(&summary, &outcome.run_dir)?;
        info!(
            "Run {} finished in {}: {} passed, {} failed, {} skipped, {} not run",
            summary.run_id,
            format_duration(summary.duration_ms),
            summary.passed,
            summary.failed,
            summary.skipped,
            summary.not_run
        );
        self.report(&summary).await;
        Ok((summary, path))
    }
}
