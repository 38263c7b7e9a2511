//! Run directories and summary artifacts
//!
//! Every run gets a short identifier and its own directory; the run summary
//! is stored there as pretty-printed JSON and can be exported to CSV.

use anyhow::{Context, Result};
use rand::Rng;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::RunSummary;

/// File name of the run summary inside a run directory
pub const SUMMARY_FILE: &str = "run_summary.json";

const RUN_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const RUN_ID_LEN: usize = 6;

/// Generate a six character run identifier, e.g. `K3Q9ZB`
pub fn generate_run_id() -> String {
    let mut rng = rand::rng();
    (0..RUN_ID_LEN)
        .map(|_| RUN_ID_CHARS[rng.random_range(0..RUN_ID_CHARS.len())] as char)
        .collect()
}

/// Directory for a run: `<log_dir>/suite-run-<id>`, or under `/tmp`
pub fn run_dir_path(log_dir: Option<&Path>, run_id: &str) -> PathBuf {
    log_dir
        .unwrap_or_else(|| Path::new("/tmp"))
        .join(format!("suite-run-{run_id}"))
}

/// Create the directory for a run
pub fn create_run_dir(log_dir: Option<&Path>, run_id: &str) -> Result<PathBuf> {
    let dir = run_dir_path(log_dir, run_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create run directory {}", dir.display()))?;
    debug!("Run directory: {}", dir.display());
    Ok(dir)
}

/// Export format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_str)
    }
}

/// Reads and writes run summaries
pub struct ResultsStorage;

impl ResultsStorage {
    /// Write the summary into `run_dir`, creating the directory if needed
    pub fn save(summary: &RunSummary, run_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join(SUMMARY_FILE);
        let file = File::create(&path).context("Failed to create run summary file")?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, summary).context("Failed to write run summary")?;

        info!("Saved run summary to {}", path.display());
        Ok(path)
    }

    /// Load a summary from a file, or from a run directory containing one
    pub fn load(path: &Path) -> Result<RunSummary> {
        let path = if path.is_dir() {
            path.join(SUMMARY_FILE)
        } else {
            path.to_path_buf()
        };
        let file = File::open(&path)
            .with_context(|| format!("Failed to open run summary {}", path.display()))?;
        let reader = BufReader::new(file);

        let summary: RunSummary =
            serde_json::from_reader(reader).context("Failed to parse run summary")?;
        debug!("Loaded run summary from {}", path.display());
        Ok(summary)
    }

    /// Export a summary to a file
    pub fn export(summary: &RunSummary, path: &Path, format: ExportFormat) -> Result<()> {
        match format {
            ExportFormat::Json => {
                let file = File::create(path)?;
                let writer = BufWriter::new(file);
                serde_json::to_writer_pretty(writer, summary)?;
            }
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_path(path)?;

                writer.write_record([
                    "run_id",
                    "name",
                    "target",
                    "status",
                    "started_at",
                    "duration_ms",
                    "error_kind",
                    "error",
                    "comments",
                ])?;

                for record in &summary.entries {
                    writer.write_record([
                        summary.run_id.clone(),
                        record.name.clone(),
                        record.target.clone(),
                        record.status.to_string(),
                        record
                            .started_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default(),
                        record.duration_ms.to_string(),
                        record
                            .error_kind
                            .map(|k| k.to_string())
                            .unwrap_or_default(),
                        record.error_message.clone().unwrap_or_default(),
                        record.comments.join("; "),
                    ])?;
                }
                writer.flush()?;
            }
        }

        info!("Exported results to {}", path.display());
        Ok(())
    }
}
