//! Execution engine
//!
//! Bounded task groups, bounded retries and the suite scheduler built on
//! top of them.

mod group;
mod process;
mod retry;
mod scheduler;
pub mod worker;

pub use group::{
    Backend, GroupConfig, TaskContext, TaskError, TaskGroup, TaskHandle, TaskOutcome,
    DEFAULT_DEADLINE, POLL_INTERVAL,
};
pub use process::ProcessTask;
pub use retry::RetryingCall;
pub use scheduler::{Scheduler, SchedulerSettings, SuiteOutcome, PROVISION_DELAY, PROVISION_TRIES};
pub use worker::{WorkerRequest, WorkerResponse};
