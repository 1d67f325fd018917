use chart_snap_common::{
    CancellationToken, Clock, CoordinatorStats, Error, Result, TaskConfig, TaskStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broadcast-once completion signal shared by the executor and its joiners.
#[derive(Debug, Clone)]
pub struct DoneSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl DoneSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wake every waiter. Returns true only for the first call.
    fn fire(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }
}

/// Ownership of one execution, handed out by `try_start`.
///
/// Only the ticket of the current record can finish it. A ticket whose record
/// expired and was replaced is stale and finishing with it changes nothing.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    key: String,
    generation: u64,
    done: DoneSignal,
}

impl TaskTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn signal(&self) -> &DoneSignal {
        &self.done
    }

    pub fn is_fired(&self) -> bool {
        self.done.is_fired()
    }
}

struct TaskRecord {
    generation: u64,
    status: TaskStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    timeout: Duration,
    done: DoneSignal,
}

/// True when more than `limit` has passed since `since`, or `since` lies in the future.
fn elapsed_beyond(now: DateTime<Utc>, since: DateTime<Utc>, limit: Duration) -> bool {
    match (now - since).to_std() {
        Ok(elapsed) => elapsed > limit,
        Err(_) => true,
    }
}

impl TaskRecord {
    fn running(generation: u64, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            generation,
            status: TaskStatus::Running,
            started_at: now,
            completed_at: None,
            timeout,
            done: DoneSignal::new(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && elapsed_beyond(now, self.started_at, self.timeout)
    }

    fn is_stale(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.completed_at {
            Some(completed_at) if self.status != TaskStatus::Running => {
                elapsed_beyond(now, completed_at, retention)
            }
            _ => false,
        }
    }
}

/// In-memory dedup engine: at most one running execution per key.
///
/// `try_start`, `complete`, `fail` and the sweep take the write lock; `wait_for`
/// only reads the record and blocks on its signal outside the lock.
pub struct TaskCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    next_generation: AtomicU64,
    clock: Arc<dyn Clock>,
    task_timeout: Duration,
    retention: Duration,
    /// Stops the reaper when the coordinator is dropped.
    shutdown: CancellationToken,
}

impl CoordinatorInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut tasks = self.write();
        let before = tasks.len();

        tasks.retain(|key, record| {
            if record.is_expired(now) {
                warn!(task_key = %key, "Reaping abandoned task (started {})", record.started_at);
                record.done.fire();
                return false;
            }
            !record.is_stale(now, self.retention)
        });

        before - tasks.len()
    }
}

impl TaskCoordinator {
    /// Create a coordinator and start its background sweep.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime: the sweep is a spawned task.
    /// It stops when the coordinator is dropped.
    pub fn new(config: &TaskConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(CoordinatorInner {
            tasks: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            clock,
            task_timeout: config.task_timeout,
            retention: config.retention,
            shutdown: CancellationToken::new(),
        });

        Self::start_reaper(Arc::downgrade(&inner), config.sweep_interval);

        Self { inner }
    }

    fn start_reaper(inner: Weak<CoordinatorInner>, interval: Duration) -> Option<JoinHandle<()>> {
        let shutdown = inner.upgrade()?.shutdown.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(coordinator) = inner.upgrade() else {
                    break;
                };
                let removed = coordinator.sweep();
                if removed > 0 {
                    debug!("Task sweep removed {} record(s)", removed);
                }
            }
            debug!("Task reaper stopped");
        }))
    }

    /// Claim `key` for a new execution.
    ///
    /// Succeeds when the key is unknown, failed, or running past its timeout.
    /// The returned ticket is the only way to finish this execution.
    pub fn try_start(&self, key: &str) -> Result<TaskTicket> {
        let now = self.inner.clock.now();
        let mut tasks = self.inner.write();

        if let Some(existing) = tasks.get(key) {
            match existing.status {
                TaskStatus::Running if existing.is_expired(now) => {
                    warn!(task_key = %key, "Previous execution expired, starting over");
                    existing.done.fire();
                }
                TaskStatus::Running => {
                    return Err(Error::TaskAlreadyRunning {
                        key: key.to_string(),
                    });
                }
                TaskStatus::Completed => {
                    return Err(Error::TaskAlreadyCompleted {
                        key: key.to_string(),
                    });
                }
                TaskStatus::Failed => {
                    debug!(task_key = %key, "Restarting previously failed task");
                }
            }
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let record = TaskRecord::running(generation, now, self.inner.task_timeout);
        let ticket = TaskTicket {
            key: key.to_string(),
            generation,
            done: record.done.clone(),
        };
        tasks.insert(key.to_string(), record);
        info!(task_key = %key, generation, "Task started");
        Ok(ticket)
    }

    /// Block until the execution owning `key` finishes, or `timeout` elapses.
    pub async fn wait_for(&self, key: &str, timeout: Duration) -> Result<()> {
        let now = self.inner.clock.now();
        let signal = {
            let tasks = self.inner.read();
            let record = tasks.get(key).ok_or_else(|| Error::TaskNotFound {
                key: key.to_string(),
            })?;
            if record.is_expired(now) {
                None
            } else {
                Some(record.done.clone())
            }
        };

        let Some(signal) = signal else {
            self.discard_expired(key, now);
            return Err(Error::TaskNotFound {
                key: key.to_string(),
            });
        };

        match tokio::time::timeout(timeout, signal.fired()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::WaitTimeout {
                key: key.to_string(),
                timeout,
            }),
        }
    }

    fn discard_expired(&self, key: &str, now: DateTime<Utc>) {
        let mut tasks = self.inner.write();
        if tasks.get(key).is_some_and(|r| r.is_expired(now)) {
            if let Some(record) = tasks.remove(key) {
                warn!(task_key = %key, "Discarding abandoned task");
                record.done.fire();
            }
        }
    }

    /// Mark the ticket's execution completed. Returns false if the ticket no
    /// longer owns a running record.
    pub fn complete(&self, ticket: &TaskTicket) -> bool {
        self.finish(ticket, TaskStatus::Completed)
    }

    /// Mark the ticket's execution failed. Returns false if the ticket no
    /// longer owns a running record.
    pub fn fail(&self, ticket: &TaskTicket) -> bool {
        self.finish(ticket, TaskStatus::Failed)
    }

    fn finish(&self, ticket: &TaskTicket, status: TaskStatus) -> bool {
        let key = ticket.key();
        let now = self.inner.clock.now();
        let mut tasks = self.inner.write();

        let Some(record) = tasks.get_mut(key) else {
            debug!(task_key = %key, "Ignoring {} for unknown task", status);
            return false;
        };
        if record.generation != ticket.generation {
            warn!(
                task_key = %key,
                stale = ticket.generation,
                current = record.generation,
                "Ignoring {} from a superseded execution",
                status
            );
            return false;
        }
        if record.status != TaskStatus::Running {
            debug!(task_key = %key, "Task already {}, ignoring {}", record.status, status);
            return false;
        }

        record.status = status;
        record.completed_at = Some(now);
        record.done.fire();
        info!(task_key = %key, "Task {}", status);
        true
    }

    /// Drop expired running records and terminal records past retention.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn status(&self, key: &str) -> Option<TaskStatus> {
        self.inner.read().get(key).map(|r| r.status)
    }

    pub fn running_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .read()
            .iter()
            .filter(|(_, r)| r.status == TaskStatus::Running)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CoordinatorStats {
        let tasks = self.inner.read();
        let mut stats = CoordinatorStats {
            total: tasks.len(),
            ..Default::default()
        };
        for record in tasks.values() {
            match record.status {
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

impl Drop for TaskCoordinator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn coordinator() -> (TaskCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (TaskCoordinator::new(&TaskConfig::default(), clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_second_start_is_already_running() {
        let (tasks, _) = coordinator();
        tasks.try_start("NVDA_us_1d_20250101").unwrap();

        let second = tasks.try_start("NVDA_us_1d_20250101");
        assert!(matches!(second, Err(Error::TaskAlreadyRunning { .. })));
        assert_eq!(tasks.running_keys(), vec!["NVDA_us_1d_20250101".to_string()]);
    }

    #[tokio::test]
    async fn test_completed_key_is_not_restarted() {
        let (tasks, _) = coordinator();
        let ticket = tasks.try_start("k").unwrap();
        assert_eq!(ticket.key(), "k");
        assert!(tasks.complete(&ticket));

        assert!(matches!(
            tasks.try_start("k"),
            Err(Error::TaskAlreadyCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_key_restarts_with_new_signal() {
        let (tasks, _) = coordinator();
        let first = tasks.try_start("k").unwrap();
        assert!(tasks.fail(&first));
        assert!(first.is_fired());

        let second = tasks.try_start("k").unwrap();
        assert!(!second.is_fired());
        assert!(second.generation() > first.generation());
        assert_eq!(tasks.status("k"), Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_expired_running_record_is_reclaimed() {
        let (tasks, clock) = coordinator();
        let stale = tasks.try_start("k").unwrap();

        clock.advance(Duration::from_secs(5 * 60 + 1));
        let fresh = tasks.try_start("k").unwrap();

        assert!(stale.is_fired());
        assert!(!fresh.is_fired());
    }

    #[tokio::test]
    async fn test_superseded_owner_cannot_finish_new_record() {
        let (tasks, clock) = coordinator();
        let overdue = tasks.try_start("k").unwrap();

        clock.advance(Duration::from_secs(5 * 60 + 1));
        let current = tasks.try_start("k").unwrap();

        assert!(!tasks.fail(&overdue));
        assert!(!tasks.complete(&overdue));
        assert_eq!(tasks.status("k"), Some(TaskStatus::Running));
        assert!(!current.is_fired());
        assert!(matches!(
            tasks.try_start("k"),
            Err(Error::TaskAlreadyRunning { .. })
        ));

        assert!(tasks.complete(&current));
        assert!(current.is_fired());
        assert_eq!(tasks.status("k"), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_clock_skew_counts_as_expired() {
        let (tasks, clock) = coordinator();
        tasks.try_start("k").unwrap();

        clock.rewind(Duration::from_secs(10));
        assert!(tasks.try_start("k").is_ok());
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_once() {
        let (tasks, _) = coordinator();
        let ticket = tasks.try_start("k").unwrap();

        assert!(tasks.complete(&ticket));
        assert!(!tasks.complete(&ticket));
        assert!(!tasks.fail(&ticket));
        assert_eq!(tasks.status("k"), Some(TaskStatus::Completed));

        let (other, _) = coordinator();
        assert!(!other.complete(&ticket));
    }

    #[tokio::test]
    async fn test_waiters_wake_on_complete() {
        let (tasks, _) = coordinator();
        let tasks = Arc::new(tasks);
        let ticket = tasks.try_start("k").unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let tasks = tasks.clone();
            waiters.push(tokio::spawn(async move {
                tasks.wait_for("k", Duration::from_secs(60)).await
            }));
        }

        tokio::task::yield_now().await;
        tasks.complete(&ticket);

        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
        // Late joiners return immediately.
        assert!(tasks.wait_for("k", Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (tasks, _) = coordinator();
        let _owner = tasks.try_start("k").unwrap();

        let result = tasks.wait_for("k", Duration::from_secs(2)).await;
        assert!(matches!(result, Err(Error::WaitTimeout { .. })));
        assert_eq!(tasks.status("k"), Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_key() {
        let (tasks, _) = coordinator();
        let result = tasks.wait_for("nope", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_expired_key_discards_it() {
        let (tasks, clock) = coordinator();
        let ticket = tasks.try_start("k").unwrap();
        clock.advance(Duration::from_secs(600));

        let result = tasks.wait_for("k", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::TaskNotFound { .. })));
        assert!(ticket.is_fired());
        assert_eq!(tasks.status("k"), None);
        assert!(!tasks.fail(&ticket));
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_and_stale_records() {
        let (tasks, clock) = coordinator();
        let abandoned = tasks.try_start("abandoned").unwrap();
        let done = tasks.try_start("done").unwrap();
        tasks.complete(&done);

        clock.advance(Duration::from_secs(10 * 60));
        let fresh = tasks.try_start("fresh").unwrap();
        assert_eq!(tasks.sweep(), 1);
        assert!(abandoned.is_fired());
        assert_eq!(tasks.status("done"), Some(TaskStatus::Completed));

        clock.advance(Duration::from_secs(25 * 60));
        tasks.complete(&fresh);
        assert_eq!(tasks.sweep(), 1);
        assert_eq!(tasks.status("done"), None);
        assert_eq!(tasks.status("fresh"), Some(TaskStatus::Completed));

        let stats = tasks.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_runs_periodically() {
        let clock = Arc::new(ManualClock::default());
        let config = TaskConfig {
            sweep_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let tasks = TaskCoordinator::new(&config, clock.clone());
        let ticket = tasks.try_start("k").unwrap();

        clock.advance(Duration::from_secs(6 * 60));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(ticket.is_fired());
        assert_eq!(tasks.status("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_when_coordinator_is_dropped() {
        let config = TaskConfig {
            sweep_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let tasks = TaskCoordinator::new(&config, Arc::new(ManualClock::default()));
        let reaper =
            TaskCoordinator::start_reaper(Arc::downgrade(&tasks.inner), config.sweep_interval)
                .unwrap();

        drop(tasks);

        // Well before the next sweep would have been due.
        let stopped = tokio::time::timeout(Duration::from_secs(1), reaper).await;
        assert!(stopped.is_ok());
    }

    #[test]
    fn test_reaper_needs_a_live_coordinator() {
        assert!(TaskCoordinator::start_reaper(Weak::new(), Duration::from_secs(1)).is_none());
    }
}
