//! Execution records for suite entries
//!
//! Defines entry status, error kinds and the mutable per-entry record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Status code returned by a target that passed
pub const CODE_PASS: i32 = 0;

/// Status code returned by a target that asked to be skipped
pub const CODE_SKIP: i32 = -1;

/// Entry execution status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    NotExecuted,
    Running,
    Pass,
    Fail,
    Skipped,
}

impl TestStatus {
    /// Map a target status code to a terminal status
    pub fn from_code(code: i32) -> Self {
        match code {
            CODE_PASS => TestStatus::Pass,
            CODE_SKIP => TestStatus::Skipped,
            _ => TestStatus::Fail,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::NotExecuted => "-",
            TestStatus::Running => "…",
            TestStatus::Pass => "✓",
            TestStatus::Fail => "✗",
            TestStatus::Skipped => "○",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Pass | TestStatus::Fail | TestStatus::Skipped
        )
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::NotExecuted => write!(f, "NOT RUN"),
            TestStatus::Running => write!(f, "RUNNING"),
            TestStatus::Pass => write!(f, "PASS"),
            TestStatus::Fail => write!(f, "FAIL"),
            TestStatus::Skipped => write!(f, "SKIP"),
        }
    }
}

/// Category of the error attached to a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The target returned an error or a failing status code
    TargetFailure,
    /// No target is registered under the entry's identifier
    UnknownTarget,
    /// The target panicked
    Panic,
    /// A task of a parallel entry failed
    TaskFailure,
    /// A parallel entry's group deadline elapsed with tasks pending
    GroupTimeout,
    /// Cluster provisioning failed
    Provisioning,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TargetFailure => "TargetFailure",
            ErrorKind::UnknownTarget => "UnknownTarget",
            ErrorKind::Panic => "Panic",
            ErrorKind::TaskFailure => "TaskFailure",
            ErrorKind::GroupTimeout => "GroupTimeout",
            ErrorKind::Provisioning => "ProvisioningError",
        };
        f.write_str(name)
    }
}

/// Mutable execution record of one suite entry.
///
/// Created in `NotExecuted` when a run begins and only ever advanced by the
/// scheduler: `NotExecuted -> Running -> {Pass, Fail, Skipped}`, or
/// `NotExecuted -> Skipped` for skip-listed entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRecord {
    pub name: String,
    pub target: String,
    pub status: TestStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub comments: Vec<String>,

    /// Environment/version fingerprint collected after dispatch
    #[serde(default)]
    pub recipe: BTreeMap<String, String>,

    /// Status codes of the sub-entries of a parallel entry
    #[serde(default)]
    pub sub_results: BTreeMap<String, i32>,
}

impl TestRecord {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            status: TestStatus::NotExecuted,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            error_kind: None,
            error_message: None,
            comments: Vec::new(),
            recipe: BTreeMap::new(),
            sub_results: BTreeMap::new(),
        }
    }

    /// Enter `Running` right before dispatch
    pub fn start(&mut self) {
        debug_assert_eq!(self.status, TestStatus::NotExecuted);
        self.status = TestStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Finalize a running record from the target's status code
    pub fn finish(&mut self, code: i32, duration_ms: u64) {
        self.status = TestStatus::from_code(code);
        self.finished_at = Some(Utc::now());
        self.duration_ms = duration_ms;
        if self.status == TestStatus::Fail && self.error_kind.is_none() {
            self.error_kind = Some(ErrorKind::TargetFailure);
            self.error_message = Some(format!("target returned status code {code}"));
        }
    }

    /// Finalize a record as failed with an attached error
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>, duration_ms: u64) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = TestStatus::Fail;
        self.finished_at = Some(Utc::now());
        self.duration_ms = duration_ms;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
    }

    /// Transition straight to `Skipped` without invoking the target
    pub fn skip(&mut self, reason: impl Into<String>) {
        let now = Utc::now();
        self.status = TestStatus::Skipped;
        self.started_at = Some(now);
        self.finished_at = Some(now);
        self.comments.push(reason.into());
    }

    /// Leave the record `NotExecuted` with the reason it never ran
    pub fn not_run(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.status = TestStatus::NotExecuted;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
    }

    pub fn comment(&mut self, comment: impl Into<String>) {
        self.comments.push(comment.into());
    }
}

impl fmt::Display for TestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.status.symbol(),
            self.name,
            self.duration_ms
        )?;
        if let Some(msg) = &self.error_message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}
