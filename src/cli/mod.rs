//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Bounded concurrent test-suite runner for live clusters
#[derive(Parser, Debug)]
#[command(name = "suite-harness")]
#[command(version)]
#[command(about = "Run test suites against provisioned clusters")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a suite
    Run(RunArgs),

    /// List the entries of a suite
    List(ListArgs),

    /// View a stored run summary
    Results(ResultsArgs),

    /// Child side of the process backend
    #[command(hide = true)]
    Worker,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Suite file (YAML or JSON)
    #[arg(short, long)]
    pub suite: PathBuf,

    /// Target identifiers to skip (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Backend of parallel entries (thread, process)
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Parallel entry deadline in seconds
    #[arg(short, long)]
    pub deadline: Option<u64>,

    /// Concurrent workers per parallel entry
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Cancel queued tasks when the deadline elapses
    #[arg(long)]
    pub cancel_pending: bool,

    /// Parent directory of the run directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Webhook receiving the run summary
    #[arg(long)]
    pub report_url: Option<String>,

    /// Application config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Reuse a run identifier instead of generating one
    #[arg(long)]
    pub run_id: Option<String>,

    /// Treat skipped entries as failures for the exit status
    #[arg(long)]
    pub skipped_is_failure: bool,
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Suite file (YAML or JSON)
    #[arg(short, long)]
    pub suite: PathBuf,

    /// Show targets, clusters and policies
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for results command
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Run summary file or run directory
    #[arg(short = 'i', long)]
    pub file: PathBuf,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Export to a file (.json or .csv)
    #[arg(short, long)]
    pub export: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "suite-harness",
            "run",
            "--suite",
            "tier-0.yaml",
            "--skip",
            "fio,rados-bench",
            "--backend",
            "process",
            "--max-workers",
            "4",
            "--cancel-pending",
        ]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.suite, PathBuf::from("tier-0.yaml"));
                assert_eq!(run.skip, vec!["fio", "rados-bench"]);
                assert_eq!(run.backend.as_deref(), Some("process"));
                assert_eq!(run.max_workers, Some(4));
                assert!(run.cancel_pending);
                assert_eq!(run.format, "table");
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = Args::parse_from([
            "suite-harness",
            "list",
            "--suite",
            "s.yaml",
            "--detailed",
            "--verbose",
        ]);
        assert!(args.verbose);
        match args.command {
            Command::List(list) => assert!(list.detailed),
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_worker_is_hidden_but_parses() {
        let args = Args::parse_from(["suite-harness", "worker"]);
        assert!(matches!(args.command, Command::Worker));
    }
}
