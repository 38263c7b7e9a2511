//! Result aggregation, storage and reporting

mod aggregator;
mod report;
mod storage;

pub use aggregator::{EnvironmentInfo, ResultAggregator, RunSummary};
pub use report::{LogSink, ReportSink, WebhookSink};
pub use storage::{
    create_run_dir, generate_run_id, ExportFormat, ResultsStorage, SUMMARY_FILE,
};
