//! Partition worker lifecycle.
//!
//! The manager owns the set of running [`ReviewWorker`]s, one per partition
//! with at least one valid enabled rule, and is the single writer of every
//! partition's rule snapshot. All changes to the set go through one lock, so
//! starts and stops for a partition never race.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::review_worker::{ReviewWorker, ReviewWorkerConfig, WorkerDeps, WorkerState};
use crate::content::PartitionKey;
use crate::dispatcher::RetryPolicy;
use crate::errors::{RepositoryError, WorkerError};
use crate::repository::{ReloadEvent, RuleRepository, RulesetStamp};
use crate::rules::snapshot::{RuleSnapshot, SnapshotPublisher, snapshot_channel};

#[derive(Debug, Clone)]
pub struct WorkerManagerConfig {
    pub worker: ReviewWorkerConfig,
    pub sync_interval: Duration,
    pub drain_timeout: Duration,
    pub max_rule_depth: usize,
}

impl WorkerManagerConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            worker: ReviewWorkerConfig::from_config(config),
            sync_interval: config.rule_sync_interval,
            drain_timeout: config.worker_drain_timeout,
            max_rule_depth: config.max_rule_depth,
        }
    }
}

const STARTUP_BACKOFF: RetryPolicy = RetryPolicy {
    max_attempts: u32::MAX,
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(30),
};

struct WorkerHandle {
    publisher: SnapshotPublisher,
    drain: CancellationToken,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<Result<(), WorkerError>>,
}

#[derive(Default)]
struct ManagerState {
    workers: HashMap<PartitionKey, WorkerHandle>,
    /// Last snapshot version per partition, kept across worker restarts.
    versions: HashMap<PartitionKey, u64>,
}

impl ManagerState {
    fn next_version(&mut self, partition: PartitionKey) -> u64 {
        let version = self.versions.entry(partition).or_insert(0);
        *version += 1;
        *version
    }
}

pub struct WorkerManager {
    repository: Arc<dyn RuleRepository>,
    deps: WorkerDeps,
    config: WorkerManagerConfig,
    hard_stop: CancellationToken,
    state: Mutex<ManagerState>,
    last_stamp: parking_lot::Mutex<Option<RulesetStamp>>,
}

impl WorkerManager {
    /// `hard_stop` is cancelled once the drain timeout expires on shutdown.
    /// Pass the same token to the remote function provider so in-flight
    /// calls are aborted.
    pub fn new(
        repository: Arc<dyn RuleRepository>,
        deps: WorkerDeps,
        config: WorkerManagerConfig,
        hard_stop: CancellationToken,
    ) -> Self {
        Self {
            repository,
            deps,
            config,
            hard_stop,
            state: Mutex::new(ManagerState::default()),
            last_stamp: parking_lot::Mutex::new(None),
        }
    }

    /// Reconcile, then follow reload events and the periodic sync until
    /// `cancel` fires. Always shuts every worker down before returning.
    pub async fn run(
        self: Arc<Self>,
        mut reloads: mpsc::Receiver<ReloadEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut failures = 0;
        loop {
            match self.reconcile_all().await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    let delay = STARTUP_BACKOFF.delay_for(failures);
                    error!(error = ?e, failures, delay_secs = delay.as_secs(), "Initial rule reconciliation failed");
                    tokio::select! {
                        () = cancel.cancelled() => {
                            self.shutdown().await;
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let mut sync = tokio::time::interval_at(
            Instant::now() + self.config.sync_interval,
            self.config.sync_interval,
        );
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reloads_open = true;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = reloads.recv(), if reloads_open => match event {
                    Some(ReloadEvent::Partition(partition)) => {
                        if let Err(e) = self.reconcile_partition(partition).await {
                            warn!(partition, error = ?e, "Partition reload failed, next sync will retry");
                        }
                    }
                    Some(ReloadEvent::Full) => {
                        if let Err(e) = self.reconcile_all().await {
                            warn!(error = ?e, "Full reload failed, next sync will retry");
                        }
                    }
                    None => {
                        warn!("Reload channel closed, relying on periodic sync");
                        reloads_open = false;
                    }
                },
                _ = sync.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!(error = ?e, "Periodic rule sync failed");
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Bring every partition in line with the repository.
    pub async fn reconcile_all(&self) -> Result<(), RepositoryError> {
        let stamp = self.repository.last_modified().await?;
        let mut state = self.state.lock().await;

        let mut partitions: BTreeSet<PartitionKey> = self
            .repository
            .active_partitions()
            .await?
            .into_iter()
            .collect();
        partitions.extend(state.workers.keys().copied());

        for partition in partitions {
            self.reconcile_locked(&mut state, partition).await?;
        }

        *self.last_stamp.lock() = Some(stamp);
        self.report_active(&state).await;
        debug!(active = state.workers.len(), "Full reconciliation finished");
        Ok(())
    }

    /// Reload one partition: install a new snapshot, or start or stop its
    /// worker when it gained its first or lost its last rule.
    pub async fn reconcile_partition(&self, partition: PartitionKey) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        self.reconcile_locked(&mut state, partition).await?;
        self.report_active(&state).await;
        Ok(())
    }

    /// Periodic sync: a full reconciliation when the rule table changed,
    /// otherwise only restart workers that stopped on their own.
    async fn sync(&self) -> Result<(), RepositoryError> {
        let stamp = self.repository.last_modified().await?;
        let unchanged = *self.last_stamp.lock() == Some(stamp);
        if !unchanged {
            return self.reconcile_all().await;
        }

        let mut state = self.state.lock().await;
        let finished: Vec<PartitionKey> = state
            .workers
            .iter()
            .filter(|(_, handle)| handle.task.is_finished())
            .map(|(partition, _)| *partition)
            .collect();
        for partition in finished {
            info!(partition, "Restarting finished worker");
            self.reconcile_locked(&mut state, partition).await?;
        }
        self.report_active(&state).await;
        Ok(())
    }

    async fn reconcile_locked(
        &self,
        state: &mut ManagerState,
        partition: PartitionKey,
    ) -> Result<(), RepositoryError> {
        let rules = self.repository.get_active_rules(partition).await?;

        let finished = state
            .workers
            .get(&partition)
            .is_some_and(|handle| handle.task.is_finished());
        if finished && let Some(handle) = state.workers.remove(&partition) {
            log_worker_exit(partition, handle.task.await);
        }

        let version = state.next_version(partition);
        let (snapshot, rejected) =
            RuleSnapshot::build(partition, version, rules, self.config.max_rule_depth);
        for e in &rejected {
            warn!(partition, error = %e, "Rejected malformed rule");
        }

        if snapshot.is_empty() {
            if let Some(handle) = state.workers.remove(&partition) {
                info!(partition, "Partition has no rules left, stopping worker");
                self.stop_worker(partition, handle).await;
            }
            return Ok(());
        }

        match state.workers.get(&partition) {
            Some(handle) => {
                info!(
                    partition,
                    version,
                    rules = snapshot.len(),
                    "Installed rule snapshot"
                );
                handle.publisher.publish(snapshot);
            }
            None => {
                info!(partition, version, rules = snapshot.len(), "Starting worker");
                let handle = self.spawn_worker(partition, snapshot);
                state.workers.insert(partition, handle);
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, partition: PartitionKey, snapshot: RuleSnapshot) -> WorkerHandle {
        let (publisher, reader) = snapshot_channel(snapshot);
        let worker = ReviewWorker::new(
            partition,
            self.config.worker.clone(),
            self.deps.clone(),
            reader,
        );
        let state = worker.state();
        let drain = CancellationToken::new();
        let task = tokio::spawn(worker.run(drain.clone()));

        WorkerHandle {
            publisher,
            drain,
            state,
            task,
        }
    }

    /// Drain a worker and wait for its batch to finish. A worker that does
    /// not stop within the drain timeout is aborted and awaited, so the
    /// partition never has two consumers. Entries of the aborted batch stay
    /// pending and are recovered by the next worker.
    async fn stop_worker(&self, partition: PartitionKey, mut handle: WorkerHandle) {
        handle.drain.cancel();
        match tokio::time::timeout(self.config.drain_timeout, &mut handle.task).await {
            Ok(result) => log_worker_exit(partition, result),
            Err(_) => {
                warn!(partition, "Worker did not drain in time, aborting task");
                handle.task.abort();
                log_worker_exit(partition, handle.task.await);
            }
        }
    }

    /// Drain every worker. After the drain timeout the hard-stop token is
    /// cancelled; workers still running after a second timeout are aborted.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let handles: Vec<(PartitionKey, WorkerHandle)> = state.workers.drain().collect();
        info!(workers = handles.len(), "Draining workers");

        for (_, handle) in &handles {
            handle.drain.cancel();
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        let mut lingering = Vec::new();
        for (partition, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle.task).await {
                Ok(result) => log_worker_exit(partition, result),
                Err(_) => lingering.push((partition, handle)),
            }
        }

        if !lingering.is_empty() {
            warn!(
                workers = lingering.len(),
                "Drain timeout expired, aborting in-flight remote calls"
            );
            self.hard_stop.cancel();

            let deadline = Instant::now() + self.config.drain_timeout;
            for (partition, mut handle) in lingering {
                match tokio::time::timeout_at(deadline, &mut handle.task).await {
                    Ok(result) => log_worker_exit(partition, result),
                    Err(_) => {
                        error!(partition, "Worker ignored hard stop, aborting task");
                        handle.task.abort();
                    }
                }
            }
        }

        self.report_active(&state).await;
        info!("All workers stopped");
    }

    /// Partitions with a worker, in ascending order.
    pub async fn active_partitions(&self) -> Vec<PartitionKey> {
        let state = self.state.lock().await;
        let mut partitions: Vec<PartitionKey> = state.workers.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    pub async fn worker_state(&self, partition: PartitionKey) -> Option<WorkerState> {
        let state = self.state.lock().await;
        state
            .workers
            .get(&partition)
            .map(|handle| *handle.state.borrow())
    }

    /// Version of the snapshot currently installed for `partition`.
    pub async fn snapshot_version(&self, partition: PartitionKey) -> Option<u64> {
        let state = self.state.lock().await;
        state
            .workers
            .get(&partition)
            .map(|handle| handle.publisher.current().version())
    }

    async fn report_active(&self, state: &ManagerState) {
        self.deps
            .metrics
            .gauge("reviewer.workers.active", state.workers.len() as u64)
            .await;
    }
}

fn log_worker_exit(partition: PartitionKey, result: Result<Result<(), WorkerError>, JoinError>) {
    match result {
        Ok(Ok(())) => debug!(partition, "Worker stopped"),
        Ok(Err(e)) => warn!(partition, error = ?e, "Worker exited with error"),
        Err(e) => error!(partition, error = ?e, "Worker task panicked or was aborted"),
    }
}
