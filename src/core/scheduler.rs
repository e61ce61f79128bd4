use crate::core::catalog::Catalog;
use crate::core::executor::{Executor, JobProcess, ProcessStatus, SpawnError};
use crate::core::job::PortBlock;
use crate::core::metrics::StopConditionEvaluator;
use crate::core::ports::{self, PortExhaustionError};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::{Duration, Instant};

pub const DEFAULT_NUM_PARALLEL: usize = 2;
pub const DEFAULT_MAX_WORKERS: u32 = 3;
pub const DEFAULT_BASE_PORT: u16 = 5005;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("at least one slot is required")]
    NoSlots,
    #[error("scheduler has no executor")]
    NoExecutor,
    #[error("tick interval must be greater than zero")]
    ZeroInterval,
    #[error(
        "job {run_id} needs {units} resource units but max_workers is {max_workers}; it could never start"
    )]
    Unschedulable {
        run_id: String,
        units: u32,
        max_workers: u32,
    },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("cannot reserve ports for {run_id}")]
    Ports {
        run_id: String,
        #[source]
        source: PortExhaustionError,
    },
}

/// The job currently holding a slot.
struct Occupant {
    process: Box<dyn JobProcess>,
    ports: PortBlock,
    run_id: String,
    sub_run_ids: Vec<String>,
    resource_units: u32,
    started_at: Instant,
}

/// Read-only view of one slot, for logging and inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub index: usize,
    pub run_id: Option<String>,
    pub ports: PortBlock,
    pub elapsed: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RunOutcome {
    #[strum(to_string = "completed")]
    Completed,
    #[strum(to_string = "interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedRun {
    pub run_id: String,
    pub reason: String,
}

/// What happened to every admitted job by the time the loop returned.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Exited with code 0.
    pub completed: Vec<String>,
    /// Exited with a non-zero code or by signal.
    pub failed: Vec<String>,
    /// Halted by a stop condition.
    pub stopped: Vec<StoppedRun>,
    /// Killed because the run was interrupted. Not counted as failures.
    pub interrupted: Vec<String>,
    /// Jobs never admitted.
    pub pending: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.failed.is_empty()
    }
}

/// Runs a catalog of jobs on `num_parallel` slots, never holding more than
/// `max_workers` resource units at once.
///
/// All state is owned by the single task driving [`SlotScheduler::run`].
pub struct SlotScheduler {
    catalog: Catalog,
    executor: Box<dyn Executor>,
    evaluator: Option<StopConditionEvaluator>,
    slots: Vec<Option<Occupant>>,
    reserved_ports: BTreeSet<u16>,
    /// Jobs admitted so far; the next pending job is `catalog[cursor]`.
    cursor: usize,
    max_workers: u32,
    base_port: u16,
    interval: Duration,
    completed: Vec<String>,
    failed: Vec<String>,
    stopped: Vec<StoppedRun>,
}

impl SlotScheduler {
    pub fn builder(catalog: Catalog) -> SchedulerBuilder {
        SchedulerBuilder::new(catalog)
    }

    pub fn has_pending_runs(&self) -> bool {
        self.cursor < self.catalog.len()
    }

    pub fn has_active_runs(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn reserved_ports(&self) -> &BTreeSet<u16> {
        &self.reserved_ports
    }

    /// Resource units held by occupied slots.
    pub fn reserved_units(&self) -> u32 {
        self.slots
            .iter()
            .flatten()
            .map(|occupant| occupant.resource_units)
            .sum()
    }

    pub fn snapshot(&self) -> Vec<SlotView> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotView {
                index,
                run_id: slot.as_ref().map(|o| o.run_id.clone()),
                ports: slot.as_ref().map(|o| o.ports.clone()).unwrap_or_default(),
                elapsed: slot.as_ref().map(|o| o.started_at.elapsed()),
            })
            .collect()
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Drive the control loop until every job has finished or `shutdown`
    /// resolves. Shutdown is observed between ticks; every running job is
    /// killed before returning.
    ///
    /// A spawn failure or port exhaustion also kills every running job and is
    /// returned as an error.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunSummary, SchedulerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let started = Instant::now();

        while self.has_active_runs() || self.has_pending_runs() {
            self.tick().await?;

            if !self.has_active_runs() && !self.has_pending_runs() {
                break;
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    let interrupted = self.terminate_all();
                    tracing::warn!("Training was interrupted.");
                    return Ok(self.summary(RunOutcome::Interrupted, interrupted, started.elapsed()));
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        Ok(self.summary(RunOutcome::Completed, Vec::new(), started.elapsed()))
    }

    /// One pass of the control loop: reap and supervise occupied slots, then
    /// admit as many pending jobs as fit.
    pub async fn tick(&mut self) -> Result<(), SchedulerError> {
        self.supervise().await;
        if let Err(e) = self.admit() {
            tracing::error!("Aborting: {}", e);
            self.terminate_all();
            return Err(e);
        }
        Ok(())
    }

    async fn supervise(&mut self) {
        if !self.has_active_runs() {
            return;
        }
        for view in self.snapshot() {
            tracing::debug!(
                "slot {}: {} ports={} elapsed={}",
                view.index,
                view.run_id.as_deref().unwrap_or("-"),
                crate::utils::format_ports(&view.ports),
                view.elapsed
                    .map(crate::utils::format_duration)
                    .unwrap_or_default()
            );
        }

        for index in 0..self.slots.len() {
            let status = match self.slots[index].as_mut() {
                Some(occupant) => occupant.process.poll(),
                None => continue,
            };

            match status {
                ProcessStatus::Exited(_) => self.reap(index, status),
                ProcessStatus::Running => {
                    let (Some(evaluator), Some(occupant)) =
                        (self.evaluator.as_ref(), self.slots[index].as_ref())
                    else {
                        continue;
                    };
                    let verdict = evaluator
                        .first_stop(self.catalog.stop_conditions(), &occupant.sub_run_ids)
                        .await;
                    if let Some(reason) = verdict {
                        self.stop(index, reason);
                    }
                }
            }
        }
    }

    /// Pending jobs start strictly in queue order; if the next one does not
    /// fit, nothing behind it is considered this tick.
    fn admit(&mut self) -> Result<usize, SchedulerError> {
        let mut admitted = 0;

        while let Some(job) = self.catalog.get(self.cursor) {
            let reserved = self.reserved_units();
            if reserved + job.resource_units > self.max_workers {
                tracing::debug!(
                    "{} waits: needs {} units, {}/{} in use",
                    job.run_id,
                    job.resource_units,
                    reserved,
                    self.max_workers
                );
                break;
            }
            let Some(slot) = self.free_slot() else {
                break;
            };

            let ports = ports::allocate(job.resource_units, self.base_port, &self.reserved_ports)
                .map_err(|source| SchedulerError::Ports {
                    run_id: job.run_id.clone(),
                    source,
                })?;
            let first_port = ports.first().copied().unwrap_or(self.base_port);
            let process = self.executor.spawn(job, first_port)?;

            tracing::info!(
                "{} started in slot {} on ports {:?}{}",
                job.run_id,
                slot,
                ports.as_slice(),
                process.pid().map(|p| format!(" (pid {p})")).unwrap_or_default()
            );
            self.reserved_ports.extend(ports.iter().copied());
            self.slots[slot] = Some(Occupant {
                process,
                ports,
                run_id: job.run_id.clone(),
                sub_run_ids: job.sub_run_ids.clone(),
                resource_units: job.resource_units,
                started_at: Instant::now(),
            });
            self.cursor += 1;
            admitted += 1;
        }

        debug_assert!(self.reserved_units() <= self.max_workers);
        debug_assert_eq!(self.reserved_units() as usize, self.reserved_ports.len());
        Ok(admitted)
    }

    fn vacate(&mut self, index: usize) -> Option<Occupant> {
        let occupant = self.slots[index].take()?;
        for port in &occupant.ports {
            self.reserved_ports.remove(port);
        }
        Some(occupant)
    }

    fn reap(&mut self, index: usize, status: ProcessStatus) {
        let Some(occupant) = self.vacate(index) else {
            return;
        };
        let elapsed = crate::utils::format_duration(occupant.started_at.elapsed());
        if status.is_success() {
            tracing::info!("{} complete after {}.", occupant.run_id, elapsed);
            self.completed.push(occupant.run_id);
        } else {
            match status {
                ProcessStatus::Exited(Some(code)) => tracing::error!(
                    "An error {} occurred in {} after {}",
                    code,
                    occupant.run_id,
                    elapsed
                ),
                _ => tracing::error!(
                    "{} was killed by a signal after {}",
                    occupant.run_id,
                    elapsed
                ),
            }
            self.failed.push(occupant.run_id);
        }
    }

    fn stop(&mut self, index: usize, reason: String) {
        let Some(mut occupant) = self.vacate(index) else {
            return;
        };
        tracing::warn!("Stopping {} because {}", occupant.run_id, reason);
        occupant.process.terminate();
        self.stopped.push(StoppedRun {
            run_id: occupant.run_id,
            reason,
        });
    }

    /// Kill every occupied slot and return the run ids that were killed.
    fn terminate_all(&mut self) -> Vec<String> {
        let mut killed = Vec::new();
        for index in 0..self.slots.len() {
            if let Some(mut occupant) = self.vacate(index) {
                tracing::info!("Terminating {} in slot {}", occupant.run_id, index);
                occupant.process.terminate();
                killed.push(occupant.run_id);
            }
        }
        killed
    }

    fn summary(&self, outcome: RunOutcome, interrupted: Vec<String>, elapsed: Duration) -> RunSummary {
        RunSummary {
            outcome,
            completed: self.completed.clone(),
            failed: self.failed.clone(),
            stopped: self.stopped.clone(),
            interrupted,
            pending: self.catalog.len() - self.cursor,
            elapsed,
        }
    }
}

/// Builder for creating SlotScheduler instances with dependency injection
pub struct SchedulerBuilder {
    catalog: Catalog,
    executor: Option<Box<dyn Executor>>,
    evaluator: Option<StopConditionEvaluator>,
    num_parallel: usize,
    max_workers: u32,
    base_port: u16,
    interval: Duration,
}

impl SchedulerBuilder {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            executor: None,
            evaluator: None,
            num_parallel: DEFAULT_NUM_PARALLEL,
            max_workers: DEFAULT_MAX_WORKERS,
            base_port: DEFAULT_BASE_PORT,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_executor(mut self, executor: Box<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_evaluator(mut self, evaluator: StopConditionEvaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_num_parallel(mut self, num_parallel: usize) -> Self {
        self.num_parallel = num_parallel;
        self
    }

    pub fn with_max_workers(mut self, max_workers: u32) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fails fast on jobs that could never fit the budget instead of letting
    /// the loop wait on them forever.
    pub fn build(self) -> Result<SlotScheduler, SchedulerError> {
        if self.num_parallel == 0 {
            return Err(SchedulerError::NoSlots);
        }
        if self.interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }
        let executor = self.executor.ok_or(SchedulerError::NoExecutor)?;

        if let Some(job) = self
            .catalog
            .jobs()
            .iter()
            .find(|job| job.resource_units > self.max_workers)
        {
            return Err(SchedulerError::Unschedulable {
                run_id: job.run_id.clone(),
                units: job.resource_units,
                max_workers: self.max_workers,
            });
        }

        if self.evaluator.is_none() && !self.catalog.stop_conditions().is_empty() {
            tracing::warn!(
                "{} stop conditions declared but no metrics endpoint configured; they will be ignored",
                self.catalog.stop_conditions().len()
            );
        }

        Ok(SlotScheduler {
            catalog: self.catalog,
            executor,
            evaluator: self.evaluator,
            slots: (0..self.num_parallel).map(|_| None).collect(),
            reserved_ports: BTreeSet::new(),
            cursor: 0,
            max_workers: self.max_workers,
            base_port: self.base_port,
            interval: self.interval,
            completed: Vec::new(),
            failed: Vec::new(),
            stopped: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{JobDescriptor, StopCondition};
    use crate::core::metrics::{tests as board, DEFAULT_QUERY_TIMEOUT};
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockLog {
        spawned: Vec<(String, u16)>,
        status: HashMap<String, ProcessStatus>,
        terminated: Vec<String>,
    }

    type SharedLog = Arc<Mutex<MockLog>>;

    /// Executor whose processes report whatever status the test scripted.
    struct MockExecutor {
        log: SharedLog,
        fail_on: Option<String>,
    }

    struct MockProcess {
        run_id: String,
        log: SharedLog,
    }

    impl JobProcess for MockProcess {
        fn poll(&mut self) -> ProcessStatus {
            self.log
                .lock()
                .unwrap()
                .status
                .get(&self.run_id)
                .copied()
                .unwrap_or(ProcessStatus::Running)
        }

        fn terminate(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.terminated.push(self.run_id.clone());
            log.status
                .insert(self.run_id.clone(), ProcessStatus::Exited(None));
        }
    }

    impl Executor for MockExecutor {
        fn spawn(
            &self,
            job: &JobDescriptor,
            base_port: u16,
        ) -> Result<Box<dyn JobProcess>, SpawnError> {
            if self.fail_on.as_deref() == Some(job.run_id.as_str()) {
                return Err(SpawnError {
                    program: "mock-trainer".to_string(),
                    run_id: job.run_id.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "mock-trainer not found"),
                });
            }
            self.log
                .lock()
                .unwrap()
                .spawned
                .push((job.run_id.clone(), base_port));
            Ok(Box::new(MockProcess {
                run_id: job.run_id.clone(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn catalog(units: &[u32]) -> Catalog {
        let jobs = units
            .iter()
            .enumerate()
            .map(|(i, &u)| {
                JobDescriptor::builder()
                    .index(i)
                    .config_path(format!("/configs/{i}.yaml"))
                    .run_id(format!("run-{i}"))
                    .sub_run_id(format!("run-{i}/Dino"))
                    .resource_units(u)
                    .build()
            })
            .collect();
        Catalog::from_jobs(jobs)
    }

    fn scheduler(
        catalog: Catalog,
        num_parallel: usize,
        max_workers: u32,
    ) -> (SchedulerBuilder, SharedLog) {
        let log = SharedLog::default();
        let builder = SlotScheduler::builder(catalog)
            .with_executor(Box::new(MockExecutor {
                log: Arc::clone(&log),
                fail_on: None,
            }))
            .with_num_parallel(num_parallel)
            .with_max_workers(max_workers)
            .with_base_port(5005)
            .with_interval(Duration::from_millis(1));
        (builder, log)
    }

    fn exit(log: &SharedLog, run_id: &str, code: Option<i32>) {
        log.lock()
            .unwrap()
            .status
            .insert(run_id.to_string(), ProcessStatus::Exited(code));
    }

    fn occupants(s: &SlotScheduler) -> Vec<Option<String>> {
        s.snapshot().into_iter().map(|v| v.run_id).collect()
    }

    #[tokio::test]
    async fn test_admission_scenario_under_budget() {
        let (builder, log) = scheduler(catalog(&[2, 1, 2]), 2, 3);
        let mut s = builder.build().unwrap();

        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-0".into()), Some("run-1".into())]);
        assert_eq!(s.reserved_units(), 3);
        assert_eq!(s.cursor(), 2);
        assert_eq!(
            log.lock().unwrap().spawned,
            vec![("run-0".to_string(), 5005), ("run-1".to_string(), 5007)]
        );

        // Nothing changes while both are running: 3 + 2 > 3.
        s.tick().await.unwrap();
        assert_eq!(s.cursor(), 2);

        exit(&log, "run-0", Some(0));
        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-2".into()), Some("run-1".into())]);
        let views = s.snapshot();
        assert_eq!(views[0].ports.as_slice(), &[5005, 5006]);
        assert_eq!(views[1].ports.as_slice(), &[5007]);
        assert_eq!(s.reserved_units(), 3);
        assert!(!s.has_pending_runs());
    }

    #[tokio::test]
    async fn test_freed_slot_is_not_enough_when_budget_is_short() {
        let (builder, log) = scheduler(catalog(&[2, 1, 2]), 2, 3);
        let mut s = builder.build().unwrap();

        s.tick().await.unwrap();
        exit(&log, "run-1", Some(0));
        s.tick().await.unwrap();
        // Slot 1 is free but 2 + 2 > 3.
        assert_eq!(occupants(&s), vec![Some("run-0".into()), None]);
        assert_eq!(s.cursor(), 2);

        exit(&log, "run-0", Some(0));
        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-2".into()), None]);
    }

    #[tokio::test]
    async fn test_admission_is_strictly_ordered() {
        let (builder, log) = scheduler(catalog(&[1, 3, 1]), 3, 3);
        let mut s = builder.build().unwrap();

        s.tick().await.unwrap();
        // run-1 does not fit next to run-0, and run-2 may not jump the queue.
        assert_eq!(occupants(&s), vec![Some("run-0".into()), None, None]);
        assert_eq!(s.cursor(), 1);

        exit(&log, "run-0", Some(0));
        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-1".into()), None, None]);
        assert_eq!(s.reserved_units(), 3);

        exit(&log, "run-1", Some(0));
        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-2".into()), None, None]);
        // The freed block at the base port is reused.
        assert_eq!(s.snapshot()[0].ports.as_slice(), &[5005]);
    }

    #[tokio::test]
    async fn test_lowest_free_slot_is_used() {
        let (builder, log) = scheduler(catalog(&[1, 1, 1]), 2, 3);
        let mut s = builder.build().unwrap();

        s.tick().await.unwrap();
        exit(&log, "run-0", Some(0));
        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-2".into()), Some("run-1".into())]);
    }

    #[test]
    fn test_oversized_job_fails_fast() {
        let (builder, _log) = scheduler(catalog(&[1, 4, 1]), 2, 3);
        match builder.build() {
            Err(SchedulerError::Unschedulable {
                run_id,
                units,
                max_workers,
            }) => {
                assert_eq!(run_id, "run-1");
                assert_eq!(units, 4);
                assert_eq!(max_workers, 3);
            }
            _ => panic!("expected an unschedulable job to be rejected"),
        }
    }

    #[test]
    fn test_zero_slots_rejected() {
        let (builder, _log) = scheduler(catalog(&[1]), 0, 3);
        assert!(matches!(builder.build(), Err(SchedulerError::NoSlots)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (builder, _log) = scheduler(catalog(&[1]), 2, 3);
        let builder = builder.with_interval(Duration::ZERO);
        assert!(matches!(builder.build(), Err(SchedulerError::ZeroInterval)));
    }

    #[tokio::test]
    async fn test_run_reports_failures() {
        let (builder, log) = scheduler(catalog(&[2, 1, 2]), 2, 3);
        exit(&log, "run-0", Some(0));
        exit(&log, "run-1", Some(0));
        exit(&log, "run-2", Some(1));
        let mut s = builder.build().unwrap();

        let summary = s.run(std::future::pending()).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.completed, vec!["run-0".to_string(), "run-1".to_string()]);
        assert_eq!(summary.failed, vec!["run-2".to_string()]);
        assert_eq!(summary.pending, 0);
        assert!(!summary.is_success());
        assert!(s.reserved_ports().is_empty());
        assert!(log.lock().unwrap().terminated.is_empty());
    }

    #[tokio::test]
    async fn test_run_all_successful() {
        let (builder, log) = scheduler(catalog(&[1, 1]), 1, 1);
        exit(&log, "run-0", Some(0));
        exit(&log, "run-1", Some(0));
        let mut s = builder.build().unwrap();

        let summary = s.run(std::future::pending()).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.completed.len(), 2);
    }

    #[tokio::test]
    async fn test_killed_by_signal_counts_as_failure() {
        let (builder, log) = scheduler(catalog(&[1]), 1, 1);
        exit(&log, "run-0", None);
        let mut s = builder.build().unwrap();

        let summary = s.run(std::future::pending()).await.unwrap();
        assert_eq!(summary.failed, vec!["run-0".to_string()]);
    }

    #[tokio::test]
    async fn test_interruption_terminates_active_slots() {
        let (builder, log) = scheduler(catalog(&[1, 1, 1]), 2, 3);
        let mut s = builder.with_interval(Duration::from_secs(60)).build().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = async move {
            let _ = rx.await;
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(());
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), s.run(shutdown))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(summary.interrupted, vec!["run-0".to_string(), "run-1".to_string()]);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.pending, 1);
        assert!(!summary.is_success());

        let log = log.lock().unwrap();
        assert_eq!(log.terminated, vec!["run-0".to_string(), "run-1".to_string()]);
        assert_eq!(log.spawned.len(), 2);
        assert!(!s.has_active_runs());
        assert!(s.reserved_ports().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let log = SharedLog::default();
        let mut s = SlotScheduler::builder(catalog(&[1, 1, 1]))
            .with_executor(Box::new(MockExecutor {
                log: Arc::clone(&log),
                fail_on: Some("run-1".to_string()),
            }))
            .with_num_parallel(3)
            .with_max_workers(3)
            .build()
            .unwrap();

        let err = s.run(std::future::pending()).await.unwrap_err();
        match err {
            SchedulerError::Spawn(e) => assert_eq!(e.run_id, "run-1"),
            other => panic!("unexpected error: {other}"),
        }
        // The job that did start is not left running.
        assert_eq!(log.lock().unwrap().terminated, vec!["run-0".to_string()]);
        assert!(!s.has_active_runs());
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_fatal() {
        let (builder, log) = scheduler(catalog(&[2, 2]), 2, 4);
        let mut s = builder.with_base_port(65533).build().unwrap();

        let err = s.tick().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Ports { ref run_id, .. } if run_id == "run-1"));
        assert_eq!(log.lock().unwrap().terminated, vec!["run-0".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_condition_halts_slot() {
        let (url, series, _requests) = board::start_board().await;
        board::put(&series, "run-0/Dino", "Losses/Value Loss", &[(100, 75.0)]);
        board::put(&series, "run-1/Dino", "Losses/Value Loss", &[(100, 12.0)]);

        let jobs = catalog(&[1, 1, 1]).jobs().to_vec();
        let mut first = jobs[0].clone();
        first.stop_conditions = vec![StopCondition::builder("Losses/Value Loss")
            .max(50.0)
            .min_step(10)
            .build()];
        let catalog = Catalog::from_jobs(vec![first, jobs[1].clone(), jobs[2].clone()]);

        let (builder, log) = scheduler(catalog, 2, 2);
        let evaluator = StopConditionEvaluator::new(url, DEFAULT_QUERY_TIMEOUT).unwrap();
        let mut s = builder.with_evaluator(evaluator).build().unwrap();

        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-0".into()), Some("run-1".into())]);

        // run-0 breaches the bound and is replaced by run-2 in the same tick.
        s.tick().await.unwrap();
        assert_eq!(occupants(&s), vec![Some("run-2".into()), Some("run-1".into())]);
        assert_eq!(log.lock().unwrap().terminated, vec!["run-0".to_string()]);
        assert_eq!(s.reserved_units(), 2);

        exit(&log, "run-1", Some(0));
        exit(&log, "run-2", Some(0));
        let summary = s.run(std::future::pending()).await.unwrap();
        assert_eq!(
            summary.stopped,
            vec![StoppedRun {
                run_id: "run-0".to_string(),
                reason: "Losses/Value Loss: 75 > 50 [step: 100]".to_string(),
            }]
        );
        // A stop is not a failure.
        assert!(summary.failed.is_empty());
        assert!(summary.is_success());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Random job sizes and exit orders: the budget holds and live
            /// port blocks stay disjoint at every tick, and every job runs.
            #[test]
            fn prop_budget_and_ports_hold(
                units in proptest::collection::vec(1u32..4, 1..12),
                num_parallel in 1usize..4,
                exits in proptest::collection::vec(any::<bool>(), 64),
            ) {
                let max_workers = 4;
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let (builder, log) = scheduler(catalog(&units), num_parallel, max_workers);
                let mut s = builder.build().unwrap();

                let mut ticks = 0;
                while s.has_active_runs() || s.has_pending_runs() {
                    rt.block_on(s.tick()).unwrap();
                    prop_assert!(s.reserved_units() <= max_workers);

                    let mut seen = BTreeSet::new();
                    for view in s.snapshot() {
                        for port in &view.ports {
                            prop_assert!(seen.insert(*port));
                        }
                    }
                    prop_assert_eq!(seen.len() as u32, s.reserved_units());

                    for (i, view) in s.snapshot().into_iter().enumerate() {
                        if let Some(run_id) = view.run_id {
                            if exits[(ticks + i) % exits.len()] {
                                exit(&log, &run_id, Some(0));
                            }
                        }
                    }
                    ticks += 1;
                    // Guarantee progress even if every flag is false.
                    if ticks % 8 == 0 {
                        for view in s.snapshot() {
                            if let Some(run_id) = view.run_id {
                                exit(&log, &run_id, Some(0));
                            }
                        }
                    }
                }

                let spawned: Vec<String> = log.lock().unwrap().spawned.iter().map(|(r, _)| r.clone()).collect();
                let expected: Vec<String> = (0..units.len()).map(|i| format!("run-{i}")).collect();
                prop_assert_eq!(spawned, expected);
            }
        }
    }
}
