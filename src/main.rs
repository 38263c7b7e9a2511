//! suite-harness - bounded concurrent test-suite runner
//!
//! Runs an ordered suite of test entries against provisioned clusters.
//! Entries run one at a time; a parallel entry fans its sub-entries out into
//! a task group backed by runtime threads or child processes, bounded by a
//! worker count and a deadline.
//!
//! ## Usage
//!
//! ```bash
//! # Run a suite
//! suite-harness run --suite tier-0.yaml
//!
//! # Skip targets and use process-backed parallel entries
//! suite-harness run --suite tier-0.yaml --skip fio --backend process
//!
//! # Show the entries of a suite
//! suite-harness list --suite tier-0.yaml --detailed
//!
//! # Show a stored run and export it
//! suite-harness results --file /tmp/suite-run-K3Q9ZB --export run.csv
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

mod cli;
mod cluster;
mod config;
mod executor;
mod hooks;
mod models;
mod output;
mod results;
mod targets;
mod utils;

use cli::Args;
use cluster::{SshClient, StaticProvisioner};
use config::AppConfig;
use executor::{Backend, Scheduler};
use hooks::{CommandMonitor, EnvironmentRecipe, RemoteRecipe};
use models::{SuiteRun, TestEntry};
use output::{OutputFormat, ResultFormatter};
use results::{ExportFormat, ResultAggregator, ResultsStorage, WebhookSink};
use targets::TargetRegistry;
use utils::LogLevel;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Some(LogLevel::Debug)
    } else {
        args.log_level.as_deref().and_then(LogLevel::from_str)
    };
    utils::init_logger(level);

    match args.command {
        cli::Command::Run(run_args) => {
            let code = run_suite(run_args).await?;
            std::process::exit(code);
        }
        cli::Command::List(list_args) => {
            list_suite(list_args)?;
        }
        cli::Command::Results(results_args) => {
            show_results(results_args)?;
        }
        cli::Command::Worker => {
            executor::worker::serve(&TargetRegistry::builtin()).await?;
        }
    }

    Ok(())
}

/// Merge CLI flags over the discovered config
fn resolve_config(args: &cli::RunArgs) -> Result<AppConfig> {
    let mut config = AppConfig::discover(args.config.as_deref())?;

    if let Some(backend) = &args.backend {
        config.backend = Backend::from_str(backend)
            .ok_or_else(|| anyhow::anyhow!("Unknown backend: {}", backend))?;
    }
    if let Some(deadline) = args.deadline {
        config.deadline_secs = deadline;
    }
    if let Some(workers) = args.max_workers {
        config.max_workers = Some(workers);
    }
    if args.cancel_pending {
        config.cancel_pending = true;
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = Some(dir.clone());
    }
    if let Some(url) = &args.report_url {
        config.report_url = Some(url.clone());
    }
    if args.skipped_is_failure {
        config.skipped_is_success = false;
    }
    config.skip.extend(
        args.skip
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    );
    Ok(config)
}

async fn run_suite(args: cli::RunArgs) -> Result<i32> {
    let config = resolve_config(&args)?;
    let suite = config::load_suite(&args.suite)?;
    let format = OutputFormat::from_str(&args.format).unwrap_or(OutputFormat::Table);

    let run_id = args.run_id.clone().unwrap_or_else(results::generate_run_id);
    let run_dir = results::create_run_dir(config.log_dir.as_deref(), &run_id)?;
    info!(
        "Run {} of suite {} ({} entries, {} backend), logs in {}",
        run_id,
        suite.name,
        suite.tests.len(),
        config.backend,
        run_dir.display()
    );

    let registry = TargetRegistry::builtin();
    for entry in &suite.tests {
        warn_unknown_targets(&registry, entry);
    }

    let ssh = SshClient::new(config.ssh.clone());
    let mut provisioner = StaticProvisioner::new();
    if config.verify_ssh {
        provisioner = provisioner.verify_ssh(ssh.clone());
    }

    let mut scheduler = Scheduler::new(registry, Arc::new(provisioner))
        .with_settings(config.scheduler_settings());
    if let Some(monitor) = &config.monitor {
        scheduler = scheduler.with_monitor(Arc::new(CommandMonitor::new(
            ssh.clone(),
            monitor.start.clone(),
            monitor.stop.clone(),
        )));
    }
    scheduler = if config.recipe_commands.is_empty() {
        scheduler.with_recipe(Arc::new(EnvironmentRecipe))
    } else {
        scheduler.with_recipe(Arc::new(RemoteRecipe::new(
            ssh,
            config.recipe_commands.clone(),
        )))
    };

    let run = SuiteRun::new(suite, run_id, run_dir);
    let outcome = scheduler.run(&run).await;

    let mut aggregator = ResultAggregator::new().skipped_is_success(config.skipped_is_success);
    if let Some(url) = &config.report_url {
        aggregator = aggregator.with_sink(Arc::new(WebhookSink::new(url.clone())?));
    }
    let (summary, path) = aggregator.finalize(&outcome).await?;

    println!("{}", ResultFormatter::new(format).format_summary(&summary));
    info!("Run summary: {}", path.display());

    Ok(summary.exit_code)
}

fn warn_unknown_targets(registry: &TargetRegistry, entry: &TestEntry) {
    if entry.is_parallel() {
        for sub in &entry.parallel {
            warn_unknown_targets(registry, sub);
        }
    } else if !registry.contains(entry.target_id()) {
        warn!(
            "Entry '{}' uses unknown target '{}'",
            entry.name,
            entry.target_id()
        );
    }
}

fn list_suite(args: cli::ListArgs) -> Result<()> {
    let suite = config::load_suite(&args.suite)?;
    let registry = TargetRegistry::builtin();

    println!("\nSuite {} ({} entries)\n", suite.name, suite.tests.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let run = SuiteRun::new(suite.clone(), "", "");
    for (i, entry) in suite.tests.iter().enumerate() {
        if args.detailed {
            let mut flags = Vec::new();
            if run.aborts_on_fail(entry) {
                flags.push("abort-on-fail");
            }
            if entry.do_not_skip {
                flags.push("do-not-skip");
            }
            if entry.recreate_cluster {
                flags.push("recreate-cluster");
            }
            if entry.destroy_cluster {
                flags.push("destroy-cluster");
            }
            let clusters = if entry.clusters.is_empty() {
                "all clusters".to_string()
            } else {
                entry.clusters.join(", ")
            };
            println!(
                "  {:2}. {:28} [{}] {} {}",
                i + 1,
                entry.name,
                describe_target(&registry, entry),
                clusters,
                flags.join(" ")
            );
        } else {
            println!("  {:2}. {}", i + 1, entry.name);
        }

        for sub in &entry.parallel {
            if args.detailed {
                println!(
                    "        - {:24} [{}]",
                    sub.name,
                    describe_target(&registry, sub)
                );
            } else {
                println!("        - {}", sub.name);
            }
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    if args.detailed {
        println!("Available targets:\n");
        for id in registry.ids() {
            let description = registry
                .get(id)
                .map(|t| t.description().to_string())
                .unwrap_or_default();
            println!("  - {id:12} {description}");
        }
        println!();
    }
    Ok(())
}

fn describe_target(registry: &TargetRegistry, entry: &TestEntry) -> String {
    if entry.is_parallel() {
        format!("parallel x{}", entry.parallel.len())
    } else if registry.contains(entry.target_id()) {
        entry.target_id().to_string()
    } else {
        format!("{} (unknown)", entry.target_id())
    }
}

fn show_results(args: cli::ResultsArgs) -> Result<()> {
    let summary = ResultsStorage::load(&args.file)?;
    let format = OutputFormat::from_str(&args.format).unwrap_or(OutputFormat::Table);
    println!("{}", ResultFormatter::new(format).format_summary(&summary));

    if let Some(path) = &args.export {
        let export = ExportFormat::from_extension(path)
            .with_context(|| format!("Cannot infer export format from {}", path.display()))?;
        ResultsStorage::export(&summary, path, export)?;
    }
    Ok(())
}
