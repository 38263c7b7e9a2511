//! Console rendering of run summaries

use crate::models::{TestRecord, TestStatus};
use crate::results::RunSummary;
use crate::utils::format_duration;

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Format one entry record
    pub fn format_record(&self, record: &TestRecord) -> String {
        match self.format {
            OutputFormat::Table => self.format_record_table(record),
            OutputFormat::Json => serde_json::to_string(record).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(record).unwrap_or_default(),
            OutputFormat::Csv => self.format_record_csv(record),
            OutputFormat::Summary => record.to_string(),
        }
    }

    fn paint(&self, status: TestStatus, text: &str) -> String {
        if !self.colorize {
            return text.to_string();
        }
        let code = match status {
            TestStatus::Pass => "32",
            TestStatus::Fail => "31",
            TestStatus::Skipped => "33",
            TestStatus::NotExecuted | TestStatus::Running => "90",
        };
        format!("\x1b[{code}m{text}\x1b[0m")
    }

    fn format_record_table(&self, record: &TestRecord) -> String {
        let status = format!("{} {:7}", record.status.symbol(), record.status.to_string());
        let mut line = format!(
            "{:32} {} [{:>8}]",
            record.name,
            self.paint(record.status, &status),
            format_duration(record.duration_ms)
        );
        if let Some(kind) = record.error_kind {
            line.push_str(&format!(" {kind}"));
        }
        line
    }

    fn format_record_csv(&self, record: &TestRecord) -> String {
        csv_rows(std::slice::from_ref(record), false)
            .trim_end()
            .to_string()
    }

    /// Format a whole run
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json => serde_json::to_string(summary).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(summary).unwrap_or_default(),
            OutputFormat::Csv => self.format_summary_csv(summary),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!(
            "  Run {} - {}\n",
            summary.run_id, summary.suite
        ));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        for record in &summary.entries {
            output.push_str(&format!("  {}\n", self.format_record_table(record)));
            for (sub, code) in &record.sub_results {
                let status = TestStatus::from_code(*code);
                output.push_str(&format!(
                    "      {} {:26} {}\n",
                    status.symbol(),
                    sub,
                    self.paint(status, &code.to_string())
                ));
            }
        }

        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        output.push_str(&format!(
            "  Total: {} | Pass: {} | Fail: {} | Skip: {} | Not run: {}\n",
            summary.total,
            self.paint(TestStatus::Pass, &summary.passed.to_string()),
            self.paint(TestStatus::Fail, &summary.failed.to_string()),
            summary.skipped,
            summary.not_run
        ));
        output.push_str(&format!(
            "  Pass Rate: {:5.1}% | Duration: {}\n",
            summary.pass_rate(),
            format_duration(summary.duration_ms)
        ));
        if let Some(entry) = &summary.aborted_at {
            output.push_str(&format!("  Aborted after: {entry}\n"));
        }
        if let Some(error) = &summary.provisioning_error {
            output.push_str(&format!("  Provisioning failed: {error}\n"));
        }
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_summary_csv(&self, summary: &RunSummary) -> String {
        csv_rows(&summary.entries, true)
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        format!(
            "{} [{}]: {}/{} passed ({:.1}%) in {}, exit code {}",
            summary.suite,
            summary.run_id,
            summary.passed,
            summary.total,
            summary.pass_rate(),
            format_duration(summary.duration_ms),
            summary.exit_code
        )
    }
}

const CSV_HEADER: [&str; 5] = ["name", "target", "status", "duration_ms", "error"];

fn csv_rows(records: &[TestRecord], header: bool) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut write = || -> csv::Result<()> {
        if header {
            writer.write_record(CSV_HEADER)?;
        }
        for record in records {
            writer.write_record([
                record.name.clone(),
                record.target.clone(),
                record.status.to_string(),
                record.duration_ms.to_string(),
                record.error_message.clone().unwrap_or_default(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    };
    if let Err(e) = write() {
        return format!("csv error: {e}");
    }
    writer
        .into_inner()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}
