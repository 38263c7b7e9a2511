//! Output formatting for run summaries

mod formatter;

pub use formatter::{OutputFormat, ResultFormatter};
