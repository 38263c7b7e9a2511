//! Suite scheduler
//!
//! Walks a suite's entries in declaration order and drives each entry's
//! record through `NotExecuted -> Running -> {Pass, Fail, Skipped}`.
//!
//! An entry with nested `parallel` sub-entries is dispatched as one task
//! group and fails if any sub-entry reports a nonzero code; any other entry
//! calls its target directly. Clusters are acquired through the provisioner
//! with bounded retries before the first entry runs, and are destroyed or
//! recreated when an entry asks for it.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::group::panic_message;
use super::worker::{self, WorkerRequest, WorkerResponse, CODE_ERROR};
use super::{Backend, GroupConfig, ProcessTask, RetryingCall, TaskGroup};
use crate::cluster::{ProvisionError, Provisioner, SshClient, SshConfig};
use crate::hooks::{Clusters, Monitor, NoopMonitor, RecipeCollector};
use crate::models::{
    merge_config, ClusterSpec, ConfigMap, ErrorKind, SuiteRun, TestEntry, TestRecord,
    TestStatus, CODE_PASS,
};
use crate::targets::{TargetRegistry, TestContext};
use crate::utils::Timer;

/// Provisioning attempts before a run is aborted
pub const PROVISION_TRIES: u32 = 3;

/// Delay between provisioning attempts
pub const PROVISION_DELAY: Duration = Duration::from_secs(15);

/// Scheduler settings
#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    /// Target identifiers whose entries are skipped
    pub skip_list: Vec<String>,

    /// Task group configuration for parallel entries
    pub group: GroupConfig,

    pub provision_tries: u32,
    pub provision_delay: Duration,

    /// Program started for process-backed sub-entries; defaults to the
    /// running executable
    pub worker_program: Option<PathBuf>,

    pub ssh: SshConfig,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            skip_list: Vec::new(),
            group: GroupConfig::default(),
            provision_tries: PROVISION_TRIES,
            provision_delay: PROVISION_DELAY,
            worker_program: None,
            ssh: SshConfig::default(),
        }
    }
}

/// Everything a run produced
#[derive(Clone, Debug)]
pub struct SuiteOutcome {
    pub suite: String,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub records: Vec<TestRecord>,

    /// Entry whose failure stopped the run
    pub aborted_at: Option<String>,

    /// Error that prevented every entry from running
    pub provisioning_error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Sequential driver of a suite run
pub struct Scheduler {
    settings: SchedulerSettings,
    registry: TargetRegistry,
    provisioner: Arc<dyn Provisioner>,
    monitor: Arc<dyn Monitor>,
    recipe: Option<Arc<dyn RecipeCollector>>,
    clusters: Clusters,
}

impl Scheduler {
    pub fn new(registry: TargetRegistry, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            settings: SchedulerSettings::default(),
            registry,
            provisioner,
            monitor: Arc::new(NoopMonitor),
            recipe: None,
            clusters: Clusters::new(),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_recipe(mut self, recipe: Arc<dyn RecipeCollector>) -> Self {
        self.recipe = Some(recipe);
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Clusters currently held
    pub fn clusters(&self) -> &Clusters {
        &self.clusters
    }

    fn is_skipped(&self, entry: &TestEntry) -> bool {
        !entry.do_not_skip
            && self
                .settings
                .skip_list
                .iter()
                .any(|s| s == entry.target_id())
    }

    /// Run every entry of `run` and return the records in suite order
    pub async fn run(&mut self, run: &SuiteRun) -> SuiteOutcome {
        let started_at = Utc::now();
        let mut records: Vec<TestRecord> = run
            .entries()
            .iter()
            .map(|e| TestRecord::new(&e.name, e.target_id()))
            .collect();

        info!(
            "Starting suite {} ({} entries, run {})",
            run.suite.name,
            records.len(),
            run.run_id
        );

        let mut outcome = SuiteOutcome {
            suite: run.suite.name.clone(),
            run_id: run.run_id.clone(),
            run_dir: run.run_dir.clone(),
            records: Vec::new(),
            aborted_at: None,
            provisioning_error: None,
            started_at,
            finished_at: started_at,
        };

        for spec in &run.suite.clusters {
            if let Err(e) = self.acquire(spec).await {
                error!("Aborting run, cluster provisioning failed: {}", e);
                let held: Vec<String> = self.clusters.keys().cloned().collect();
                for name in held {
                    self.release(&name).await;
                }
                let message = e.to_string();
                for record in &mut records {
                    record.not_run(ErrorKind::Provisioning, message.clone());
                }
                outcome.records = records;
                outcome.provisioning_error = Some(message);
                outcome.finished_at = Utc::now();
                return outcome;
            }
        }

        for (entry, record) in run.entries().iter().zip(records.iter_mut()) {
            if self.is_skipped(entry) {
                info!(
                    "Skipping {} (target {} is in the skip list)",
                    entry.name,
                    entry.target_id()
                );
                record.skip(format!("target '{}' is in the skip list", entry.target_id()));
                continue;
            }

            self.run_entry(run, entry, record).await;
            info!("  {}", record);

            if record.status == TestStatus::Fail && run.aborts_on_fail(entry) {
                warn!("{} failed with abort-on-fail set, stopping the run", entry.name);
                outcome.aborted_at = Some(entry.name.clone());
                break;
            }
        }

        outcome.records = records;
        outcome.finished_at = Utc::now();
        outcome
    }

    /// Drive one entry from `NotExecuted` to a terminal status
    async fn run_entry(&mut self, run: &SuiteRun, entry: &TestEntry, record: &mut TestRecord) {
        let clusters = match self.prepare_clusters(run, entry).await {
            Ok(clusters) => clusters,
            Err(message) => {
                record.fail(ErrorKind::Provisioning, message, 0);
                return;
            }
        };
        let config = merge_config(&run.suite.config, &entry.config);

        if let Err(e) = self.monitor.start(&entry.name, &clusters).await {
            warn!("Monitor failed to start for {}: {:#}", entry.name, e);
        }

        record.start();
        let timer = Timer::start(&entry.name);
        if entry.is_parallel() {
            self.dispatch_parallel(run, entry, config, &clusters, record, timer)
                .await;
        } else {
            self.dispatch_direct(run, entry, config, &clusters, record, timer)
                .await;
        }

        if let Err(e) = self.monitor.stop(&entry.name, &clusters).await {
            warn!("Monitor failed to stop for {}: {:#}", entry.name, e);
        }

        if let Some(recipe) = &self.recipe {
            match recipe.collect(&clusters).await {
                Ok(collected) => record.recipe = collected,
                Err(e) => warn!("Recipe collection failed for {}: {:#}", entry.name, e),
            }
        }

        if entry.destroy_cluster {
            for name in clusters.keys() {
                self.release(name).await;
            }
        }
    }

    /// Clusters an entry runs against, recreating or re-acquiring as needed
    async fn prepare_clusters(
        &mut self,
        run: &SuiteRun,
        entry: &TestEntry,
    ) -> Result<Clusters, String> {
        let specs: Vec<&ClusterSpec> = if entry.clusters.is_empty() {
            run.suite.clusters.iter().collect()
        } else {
            entry
                .clusters
                .iter()
                .map(|name| {
                    run.suite
                        .clusters
                        .iter()
                        .find(|c| &c.name == name)
                        .ok_or_else(|| format!("unknown cluster '{name}'"))
                })
                .collect::<Result<_, _>>()?
        };

        let mut clusters = Clusters::new();
        for spec in specs {
            if entry.recreate_cluster {
                info!("Recreating cluster {} for {}", spec.name, entry.name);
                self.release(&spec.name).await;
            }
            if !self.clusters.contains_key(&spec.name) {
                self.acquire(spec).await.map_err(|e| e.to_string())?;
            }
            if let Some(handle) = self.clusters.get(&spec.name) {
                clusters.insert(spec.name.clone(), handle.clone());
            }
        }
        Ok(clusters)
    }

    async fn acquire(&mut self, spec: &ClusterSpec) -> Result<(), ProvisionError> {
        info!("Acquiring cluster {}", spec.name);
        let retry = RetryingCall::new(
            self.settings.provision_tries,
            self.settings.provision_delay,
            ProvisionError::is_transient,
        );
        let provisioner = self.provisioner.as_ref();
        let handle = retry.call(|| provisioner.create(spec)).await?;
        self.clusters.insert(spec.name.clone(), handle);
        Ok(())
    }

    async fn release(&mut self, name: &str) {
        let Some(handle) = self.clusters.remove(name) else {
            return;
        };
        info!("Destroying cluster {}", handle);
        if let Err(e) = self.provisioner.destroy(&handle).await {
            error!("Failed to destroy cluster {}: {:#}", name, e);
        }
    }

    async fn dispatch_direct(
        &self,
        run: &SuiteRun,
        entry: &TestEntry,
        config: ConfigMap,
        clusters: &Clusters,
        record: &mut TestRecord,
        timer: Timer,
    ) {
        let Some(target) = self.registry.get(entry.target_id()) else {
            record.fail(
                ErrorKind::UnknownTarget,
                format!("unknown target '{}'", entry.target_id()),
                timer.stop(),
            );
            return;
        };

        let mut ctx = TestContext::new(&entry.name, &run.run_id, &run.run_dir)
            .with_config(config)
            .with_clusters(clusters.clone())
            .with_ssh(SshClient::new(self.settings.ssh.clone()));

        debug!("Dispatching {} to target {}", entry.name, entry.target_id());
        let outcome = AssertUnwindSafe(target.run(&mut ctx)).catch_unwind().await;
        for comment in ctx.take_comments() {
            record.comment(comment);
        }

        let elapsed = timer.stop();
        match outcome {
            Ok(Ok(code)) => record.finish(code, elapsed),
            Ok(Err(e)) => {
                error!("{} raised: {:#}", entry.name, e);
                record.fail(ErrorKind::TargetFailure, format!("{e:#}"), elapsed);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{} panicked: {}", entry.name, message);
                record.fail(ErrorKind::Panic, message, elapsed);
            }
        }
    }

    async fn dispatch_parallel(
        &self,
        run: &SuiteRun,
        entry: &TestEntry,
        config: ConfigMap,
        clusters: &Clusters,
        record: &mut TestRecord,
        timer: Timer,
    ) {
        let mut group: TaskGroup<WorkerResponse> = TaskGroup::new(self.settings.group.clone());
        let mut names = Vec::new();

        for sub in &entry.parallel {
            if self.is_skipped(sub) {
                info!("Skipping sub-entry {} of {}", sub.name, entry.name);
                record.comment(format!("{}: skipped", sub.name));
                continue;
            }
            let request = WorkerRequest {
                entry: sub.clone(),
                config: merge_config(&config, &sub.config),
                clusters: clusters.clone(),
                run_id: run.run_id.clone(),
                run_dir: run.run_dir.clone(),
                ssh: self.settings.ssh.clone(),
            };
            names.push(sub.name.clone());
            if let Err(e) = self.submit(&mut group, request) {
                error!("Failed to submit {}: {:#}", sub.name, e);
                record.comment(format!("{}: not submitted: {e:#}", sub.name));
                names.pop();
            }
        }

        info!(
            "Dispatched {} sub-entries of {} to a {}-backed group",
            group.count(),
            entry.name,
            group.config().backend
        );

        // Sub-entry outcomes come back through the group in spawn order.
        let mut failed = Vec::new();
        let mut task_errors = 0;
        let mut incomplete = 0;
        let mut index = 0;
        while let Some(outcome) = group.next().await {
            let name = names.get(index).cloned().unwrap_or_default();
            index += 1;
            match outcome {
                Ok(response) => {
                    for comment in &response.comments {
                        record.comment(format!("{}: {}", response.name, comment));
                    }
                    if let Some(error) = &response.error {
                        task_errors += 1;
                        record.comment(format!("{}: {}", response.name, error));
                    }
                    if response.code != CODE_PASS {
                        failed.push(format!("{} ({})", response.name, response.code));
                    }
                    record.sub_results.insert(response.name, response.code);
                }
                Err(e) => {
                    if e.is_incomplete() {
                        incomplete += 1;
                    } else {
                        task_errors += 1;
                    }
                    record.comment(format!("{name}: {e}"));
                    failed.push(format!("{name} ({e})"));
                    record.sub_results.insert(name, CODE_ERROR);
                }
            }
        }
        if let Err(e) = group.close().await {
            debug!("Task group of {} closed with {}", entry.name, e);
        }

        let elapsed = timer.stop();
        if failed.is_empty() && !group.timed_out() {
            record.finish(CODE_PASS, elapsed);
        } else if incomplete > 0 || group.timed_out() {
            record.fail(
                ErrorKind::GroupTimeout,
                format!(
                    "deadline of {:?} elapsed with {} sub-entries unfinished; failed: {}",
                    group.config().deadline(),
                    incomplete.max(group.unresolved()),
                    failed.join(", ")
                ),
                elapsed,
            );
        } else {
            let kind = if task_errors > 0 {
                ErrorKind::TaskFailure
            } else {
                ErrorKind::TargetFailure
            };
            record.fail(kind, format!("sub-entries failed: {}", failed.join(", ")), elapsed);
        }
    }

    fn submit(
        &self,
        group: &mut TaskGroup<WorkerResponse>,
        request: WorkerRequest,
    ) -> anyhow::Result<()> {
        match group.config().backend {
            Backend::Thread => {
                let registry = self.registry.clone();
                group.spawn(move |task| async move {
                    Ok(worker::execute(&registry, request, Some(task)).await)
                });
            }
            Backend::Process => {
                let program = match &self.settings.worker_program {
                    Some(program) => program.clone(),
                    None => std::env::current_exe()?,
                };
                let task = ProcessTask::json(program, &request)?.arg("worker");
                group.spawn_process(task);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("clusters", &self.clusters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticProvisioner;
    use crate::hooks::EnvironmentRecipe;
    use crate::models::{ClusterHandle, Node, Suite};
    use crate::targets::{SleepTarget, TestTarget};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct Counting {
        code: i32,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TestTarget for Counting {
        async fn run(&self, ctx: &mut TestContext) -> anyhow::Result<i32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.comment(format!("ran {}", ctx.name));
            Ok(self.code)
        }
    }

    struct Panicking;

    #[async_trait]
    impl TestTarget for Panicking {
        async fn run(&self, _ctx: &mut TestContext) -> anyhow::Result<i32> {
            let missing: Option<i32> = None;
            Ok(missing.expect("target crashed"))
        }
    }

    /// Fails the first `failures` creations, then succeeds
    #[derive(Default)]
    struct FlakyProvisioner {
        failures: u32,
        fatal: bool,
        /// Always refused, fatally
        rejected: Option<&'static str>,
        created: AtomicU32,
        destroyed: AtomicU32,
    }

    #[async_trait]
    impl Provisioner for FlakyProvisioner {
        async fn create(&self, spec: &ClusterSpec) -> Result<ClusterHandle, ProvisionError> {
            let attempt = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            if self.rejected == Some(spec.name.as_str()) {
                return Err(ProvisionError::Fatal {
                    cluster: spec.name.clone(),
                    message: "no capacity".to_string(),
                });
            }
            if attempt <= self.failures {
                let cluster = spec.name.clone();
                let message = format!("attempt {attempt} failed");
                return Err(if self.fatal {
                    ProvisionError::Fatal { cluster, message }
                } else {
                    ProvisionError::Transient { cluster, message }
                });
            }
            Ok(ClusterHandle {
                name: spec.name.clone(),
                nodes: vec![Node {
                    hostname: "node1".to_string(),
                    address: "10.0.0.1".to_string(),
                    roles: vec!["mon".to_string()],
                }],
                ssh_user: None,
                created_at: Utc::now(),
            })
        }

        async fn destroy(&self, _cluster: &ClusterHandle) -> anyhow::Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenHooks;

    #[async_trait]
    impl Monitor for BrokenHooks {
        async fn start(&self, _entry: &str, _clusters: &Clusters) -> anyhow::Result<()> {
            anyhow::bail!("monitor agent missing")
        }

        async fn stop(&self, _entry: &str, _clusters: &Clusters) -> anyhow::Result<()> {
            anyhow::bail!("monitor agent missing")
        }
    }

    #[async_trait]
    impl RecipeCollector for BrokenHooks {
        async fn collect(&self, _clusters: &Clusters) -> anyhow::Result<BTreeMap<String, String>> {
            anyhow::bail!("version query failed")
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            provision_delay: Duration::from_millis(1),
            group: GroupConfig::default().with_poll_interval(Duration::from_millis(5)),
            ..Default::default()
        }
    }

    /// Registry with targets t1..tN returning the given codes, plus call counters
    fn registry(codes: &[i32]) -> (TargetRegistry, Vec<Arc<AtomicUsize>>) {
        let mut registry = TargetRegistry::new();
        let mut counters = Vec::new();
        for (i, &code) in codes.iter().enumerate() {
            let calls = Arc::new(AtomicUsize::new(0));
            registry.register(
                format!("t{}", i + 1),
                Arc::new(Counting {
                    code,
                    calls: Arc::clone(&calls),
                }),
            );
            counters.push(calls);
        }
        (registry, counters)
    }

    fn three_entry_suite() -> Suite {
        Suite::new("tier-0")
            .with_entry(TestEntry::new("e1", "t1"))
            .with_entry(TestEntry::new("e2", "t2").abort_on_fail(true))
            .with_entry(TestEntry::new("e3", "t3"))
    }

    fn suite_run(suite: Suite) -> SuiteRun {
        SuiteRun::new(suite, "TEST01", "/tmp/suite-run-TEST01")
    }

    fn scheduler(registry: TargetRegistry) -> Scheduler {
        Scheduler::new(registry, Arc::new(StaticProvisioner::new())).with_settings(settings())
    }

    fn statuses(outcome: &SuiteOutcome) -> Vec<TestStatus> {
        outcome.records.iter().map(|r| r.status).collect()
    }

    #[tokio::test]
    async fn test_abort_on_fail_stops_the_run() {
        let (registry, calls) = registry(&[0, 1, 0]);
        let outcome = scheduler(registry).run(&suite_run(three_entry_suite())).await;

        assert_eq!(
            statuses(&outcome),
            vec![TestStatus::Pass, TestStatus::Fail, TestStatus::NotExecuted]
        );
        assert_eq!(outcome.aborted_at.as_deref(), Some("e2"));
        assert_eq!(calls[2].load(Ordering::SeqCst), 0);
        assert_eq!(outcome.records[1].error_kind, Some(ErrorKind::TargetFailure));
        assert!(outcome.records[2].started_at.is_none());
    }

    #[tokio::test]
    async fn test_failure_without_abort_continues() {
        let (registry, calls) = registry(&[0, 1, 0]);
        let suite = Suite::new("tier-0")
            .with_entry(TestEntry::new("e1", "t1"))
            .with_entry(TestEntry::new("e2", "t2"))
            .with_entry(TestEntry::new("e3", "t3"));
        let outcome = scheduler(registry).run(&suite_run(suite)).await;

        assert_eq!(
            statuses(&outcome),
            vec![TestStatus::Pass, TestStatus::Fail, TestStatus::Pass]
        );
        assert!(outcome.aborted_at.is_none());
        assert_eq!(calls[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_list_never_invokes_target() {
        let (registry, calls) = registry(&[0, 0, 0]);
        let mut scheduler = scheduler(registry).with_settings(SchedulerSettings {
            skip_list: vec!["t2".to_string()],
            ..settings()
        });
        let outcome = scheduler.run(&suite_run(three_entry_suite())).await;

        assert_eq!(
            statuses(&outcome),
            vec![TestStatus::Pass, TestStatus::Skipped, TestStatus::Pass]
        );
        assert_eq!(calls[1].load(Ordering::SeqCst), 0);
        assert!(outcome.records[1].comments[0].contains("skip list"));
    }

    #[tokio::test]
    async fn test_do_not_skip_overrides_skip_list() {
        let (registry, calls) = registry(&[0, 0]);
        let suite = Suite::new("tier-0")
            .with_entry(TestEntry::new("e1", "t1"))
            .with_entry(TestEntry::new("e2", "t2").do_not_skip());
        let mut scheduler = scheduler(registry).with_settings(SchedulerSettings {
            skip_list: vec!["t1".to_string(), "t2".to_string()],
            ..settings()
        });
        let outcome = scheduler.run(&suite_run(suite)).await;

        assert_eq!(statuses(&outcome), vec![TestStatus::Skipped, TestStatus::Pass]);
        assert_eq!(calls[0].load(Ordering::SeqCst), 0);
        assert_eq!(calls[1].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provisioning_failure_aborts_before_any_entry() {
        let (registry, calls) = registry(&[0, 0, 0]);
        let provisioner = Arc::new(FlakyProvisioner {
            failures: u32::MAX,
            ..Default::default()
        });
        let suite = three_entry_suite().with_cluster(ClusterSpec::new("ceph").with_node("n1", &[]));
        let mut scheduler = Scheduler::new(registry, provisioner.clone())
            .with_settings(SchedulerSettings {
                provision_tries: 2,
                ..settings()
            });
        let outcome = scheduler.run(&suite_run(suite)).await;

        assert!(outcome.provisioning_error.is_some());
        assert_eq!(provisioner.created.load(Ordering::SeqCst), 2);
        for record in &outcome.records {
            assert_eq!(record.status, TestStatus::NotExecuted);
            assert_eq!(record.error_kind, Some(ErrorKind::Provisioning));
        }
        assert!(calls.iter().all(|c| c.load(Ordering::SeqCst) == 0));
    }

    #[tokio::test]
    async fn test_fatal_provisioning_error_is_not_retried() {
        let (registry, _) = registry(&[0]);
        let provisioner = Arc::new(FlakyProvisioner {
            failures: 1,
            fatal: true,
            ..Default::default()
        });
        let suite = Suite::new("s")
            .with_cluster(ClusterSpec::new("ceph"))
            .with_entry(TestEntry::new("e1", "t1"));
        let outcome = Scheduler::new(registry, provisioner.clone())
            .with_settings(settings())
            .run(&suite_run(suite))
            .await;

        assert!(outcome.provisioning_error.is_some());
        assert_eq!(provisioner.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_acquisition_releases_clusters_already_held() {
        let (registry, calls) = registry(&[0]);
        let provisioner = Arc::new(FlakyProvisioner {
            rejected: Some("rgw"),
            ..Default::default()
        });
        let suite = Suite::new("s")
            .with_cluster(ClusterSpec::new("ceph"))
            .with_cluster(ClusterSpec::new("rgw"))
            .with_entry(TestEntry::new("e1", "t1"));
        let mut scheduler = Scheduler::new(registry, provisioner.clone()).with_settings(settings());
        let outcome = scheduler.run(&suite_run(suite)).await;

        assert!(outcome.provisioning_error.is_some());
        assert_eq!(provisioner.created.load(Ordering::SeqCst), 2);
        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 1);
        assert!(scheduler.clusters().is_empty());
        assert_eq!(calls[0].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_provisioning_errors_are_retried() {
        let (registry, calls) = registry(&[0]);
        let provisioner = Arc::new(FlakyProvisioner {
            failures: 2,
            ..Default::default()
        });
        let suite = Suite::new("s")
            .with_cluster(ClusterSpec::new("ceph"))
            .with_entry(TestEntry::new("e1", "t1"));
        let mut scheduler = Scheduler::new(registry, provisioner.clone()).with_settings(settings());
        let outcome = scheduler.run(&suite_run(suite)).await;

        assert_eq!(statuses(&outcome), vec![TestStatus::Pass]);
        assert_eq!(provisioner.created.load(Ordering::SeqCst), 3);
        assert_eq!(calls[0].load(Ordering::SeqCst), 1);
        assert!(scheduler.clusters().contains_key("ceph"));
    }

    #[tokio::test]
    async fn test_destroyed_cluster_is_reacquired_for_later_entries() {
        let (registry, _) = registry(&[0, 0, 0]);
        let provisioner = Arc::new(FlakyProvisioner::default());
        let mut first = TestEntry::new("e1", "t1");
        first.destroy_cluster = true;
        let mut third = TestEntry::new("e3", "t3");
        third.recreate_cluster = true;
        let suite = Suite::new("s")
            .with_cluster(ClusterSpec::new("ceph"))
            .with_entry(first)
            .with_entry(TestEntry::new("e2", "t2"))
            .with_entry(third);

        let outcome = Scheduler::new(registry, provisioner.clone())
            .with_settings(settings())
            .run(&suite_run(suite))
            .await;

        assert!(outcome.records.iter().all(|r| r.status == TestStatus::Pass));
        // Initial acquire, re-acquire after destroy, recreate.
        assert_eq!(provisioner.created.load(Ordering::SeqCst), 3);
        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entry_with_unknown_cluster_fails() {
        let (registry, calls) = registry(&[0]);
        let mut entry = TestEntry::new("e1", "t1");
        entry.clusters = vec!["missing".to_string()];
        let outcome = scheduler(registry)
            .run(&suite_run(Suite::new("s").with_entry(entry)))
            .await;

        assert_eq!(outcome.records[0].status, TestStatus::Fail);
        assert_eq!(outcome.records[0].error_kind, Some(ErrorKind::Provisioning));
        assert_eq!(calls[0].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parallel_entry_fails_when_a_sub_entry_fails() {
        let (registry, calls) = registry(&[0, 2, 0]);
        let suite = Suite::new("s")
            .with_entry(TestEntry::new("io", "").with_parallel(vec![
                TestEntry::new("fio-a", "t1"),
                TestEntry::new("fio-b", "t2"),
            ]))
            .with_entry(TestEntry::new("after", "t3"));
        let outcome = scheduler(registry).run(&suite_run(suite)).await;

        let io = &outcome.records[0];
        assert_eq!(io.status, TestStatus::Fail);
        assert_eq!(io.error_kind, Some(ErrorKind::TargetFailure));
        assert_eq!(io.sub_results.get("fio-a"), Some(&0));
        assert_eq!(io.sub_results.get("fio-b"), Some(&2));
        assert!(io.comments.iter().any(|c| c == "fio-a: ran fio-a"));
        assert_eq!(outcome.records[1].status, TestStatus::Pass);
        assert_eq!(calls[0].load(Ordering::SeqCst), 1);
        assert_eq!(calls[1].load(Ordering::SeqCst), 1);
    }

    /// Answers with code 3 for sub-entries named `fail-*`, 0 otherwise
    #[cfg(unix)]
    const STUB_WORKER: &str = r#"#!/bin/sh
[ "$1" = worker ] || exit 9
request=$(cat)
name=$(printf '%s' "$request" | sed -n 's/^{"entry":{"name":"\([^"]*\)".*/\1/p')
case "$name" in
  fail-*) code=3 ;;
  *) code=0 ;;
esac
printf '{"name":"%s","code":%s,"comments":["handled by worker"]}\n' "$name" "$code"
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_backend_dispatches_through_worker_program() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("worker.sh");
        std::fs::write(&program, STUB_WORKER).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let suite = Suite::new("s").with_entry(TestEntry::new("io", "").with_parallel(vec![
            TestEntry::new("a", "sleep"),
            TestEntry::new("fail-b", "sleep"),
        ]));
        // No targets registered here, so only the child can answer.
        let mut scheduler = scheduler(TargetRegistry::new()).with_settings(SchedulerSettings {
            worker_program: Some(program),
            group: GroupConfig {
                backend: Backend::Process,
                ..settings().group
            },
            ..settings()
        });
        let outcome = scheduler.run(&suite_run(suite)).await;

        let io = &outcome.records[0];
        assert_eq!(io.status, TestStatus::Fail, "{:?}", io);
        assert_eq!(io.error_kind, Some(ErrorKind::TargetFailure));
        assert_eq!(io.sub_results.get("a"), Some(&0));
        assert_eq!(io.sub_results.get("fail-b"), Some(&3));
        assert!(io.comments.iter().any(|c| c == "a: handled by worker"));
    }

    #[tokio::test]
    async fn test_parallel_entry_passes_with_merged_config() {
        let registry = TargetRegistry::builtin();
        let mut suite = Suite::new("s").with_entry(
            TestEntry::new("naps", "")
                .with_config("seconds", json!(0.01))
                .with_parallel(vec![
                    TestEntry::new("a", "sleep"),
                    TestEntry::new("b", "sleep").with_config("seconds", json!(0.02)),
                ]),
        );
        suite.config.insert("code".to_string(), json!(0));
        let outcome = scheduler(registry).run(&suite_run(suite)).await;

        let record = &outcome.records[0];
        assert_eq!(record.status, TestStatus::Pass, "{:?}", record);
        assert_eq!(record.sub_results.len(), 2);
        assert!(record.comments.iter().any(|c| c == "b: slept 0.0s"));
    }

    #[tokio::test]
    async fn test_parallel_deadline_marks_group_timeout() {
        let registry = TargetRegistry::new().with("sleep", SleepTarget);
        let suite = Suite::new("s").with_entry(TestEntry::new("slow", "").with_parallel(vec![
            TestEntry::new("quick", "sleep"),
            TestEntry::new("stuck", "sleep").with_config("seconds", json!(30)),
        ]));
        let mut settings = settings();
        settings.group = settings.group.with_deadline(Duration::from_millis(50));
        let outcome = Scheduler::new(registry, Arc::new(StaticProvisioner::new()))
            .with_settings(settings)
            .run(&suite_run(suite))
            .await;

        let record = &outcome.records[0];
        assert_eq!(record.status, TestStatus::Fail);
        assert_eq!(record.error_kind, Some(ErrorKind::GroupTimeout));
        assert_eq!(record.sub_results.get("quick"), Some(&CODE_PASS));
        assert_eq!(record.sub_results.get("stuck"), Some(&CODE_ERROR));
        assert!(record.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_skip_list_applies_to_sub_entries() {
        let (registry, calls) = registry(&[0, 0]);
        let suite = Suite::new("s").with_entry(TestEntry::new("io", "").with_parallel(vec![
            TestEntry::new("a", "t1"),
            TestEntry::new("b", "t2"),
        ]));
        let mut scheduler = scheduler(registry).with_settings(SchedulerSettings {
            skip_list: vec!["t2".to_string()],
            ..settings()
        });
        let outcome = scheduler.run(&suite_run(suite)).await;

        assert_eq!(outcome.records[0].status, TestStatus::Pass);
        assert_eq!(outcome.records[0].sub_results.len(), 1);
        assert_eq!(calls[1].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hook_failures_do_not_change_outcome() {
        let (registry, _) = registry(&[0, 1]);
        let suite = Suite::new("s")
            .with_entry(TestEntry::new("e1", "t1"))
            .with_entry(TestEntry::new("e2", "t2"));
        let outcome = scheduler(registry)
            .with_monitor(Arc::new(BrokenHooks))
            .with_recipe(Arc::new(BrokenHooks))
            .run(&suite_run(suite))
            .await;

        assert_eq!(statuses(&outcome), vec![TestStatus::Pass, TestStatus::Fail]);
        assert_eq!(
            outcome.records[1].error_kind,
            Some(ErrorKind::TargetFailure)
        );
        assert!(outcome.records[0].recipe.is_empty());
    }

    #[tokio::test]
    async fn test_recipe_is_attached_to_records() {
        let (registry, _) = registry(&[0]);
        let outcome = scheduler(registry)
            .with_recipe(Arc::new(EnvironmentRecipe))
            .run(&suite_run(Suite::new("s").with_entry(TestEntry::new("e1", "t1"))))
            .await;

        assert_eq!(outcome.records[0].recipe["os"], std::env::consts::OS);
    }

    #[tokio::test]
    async fn test_unknown_and_panicking_targets_fail_their_entry() {
        let registry = TargetRegistry::new().with("crash", Panicking);
        let suite = Suite::new("s")
            .with_entry(TestEntry::new("e1", "nope"))
            .with_entry(TestEntry::new("e2", "crash"));
        let outcome = scheduler(registry).run(&suite_run(suite)).await;

        assert_eq!(outcome.records[0].error_kind, Some(ErrorKind::UnknownTarget));
        assert_eq!(outcome.records[1].error_kind, Some(ErrorKind::Panic));
        assert_eq!(
            outcome.records[1].error_message.as_deref(),
            Some("target crashed")
        );
    }

    #[tokio::test]
    async fn test_skip_code_marks_entry_skipped() {
        let (registry, _) = registry(&[-1]);
        let outcome = scheduler(registry)
            .run(&suite_run(Suite::new("s").with_entry(TestEntry::new("e1", "t1"))))
            .await;

        assert_eq!(statuses(&outcome), vec![TestStatus::Skipped]);
        assert!(outcome.records[0].error_kind.is_none());
    }
}
