//! The queue monitor and worker supervisor.
//!
//! One `Supervisor` owns at most one worker process. Each cycle it consumes
//! a pending trigger, inspects the prompt queue, and when there is work (or a
//! trigger asks for it) starts a worker and waits for it to finish, time out,
//! or be stopped.
//!
//! # Failure handling
//!
//! - Worker failures and timeouts back off exponentially. After the retry
//!   policy is exhausted the supervisor sleeps `max_backoff` once and starts
//!   counting again.
//! - Redis errors back off the same way but never stop the loop.
//! - Spawns are rate limited by `min_spawn_interval`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::metrics::MetricsCollector;
use crate::status::{metadata, StatusReporter, WorkerState};
use crate::store::{keys, Store};

use super::process::{stop_gracefully, ManagedProcess, ProcessLauncher, Termination};
use super::queue::PromptQueue;
use super::trigger::{TriggerAction, TriggerWatcher};

/// Maximum characters of worker stderr copied into a `failed` status.
const STATUS_ERROR_CHARS: usize = 1000;

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exited with status 0.
    Success,
    /// Exited with a non-zero status, or could not be waited on.
    Failure { exit_code: Option<i32> },
    /// Exceeded the wall-clock limit and was terminated.
    Timeout,
    /// Stopped by a trigger or by supervisor shutdown.
    Stopped { restart: bool },
}

impl WorkerOutcome {
    /// Returns the metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Success => "success",
            WorkerOutcome::Failure { .. } => "failure",
            WorkerOutcome::Timeout => "timeout",
            WorkerOutcome::Stopped { .. } => "stopped",
        }
    }

    /// Returns true for outcomes that count towards the failure streak.
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerOutcome::Failure { .. } | WorkerOutcome::Timeout)
    }
}

/// What the monitor loop should do after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    /// Nothing to do; sleep the poll interval.
    Idle,
    /// More work is queued; start the next cycle immediately.
    Continue,
    /// Sleep the given delay before the next cycle.
    Backoff(Duration),
    /// Shutdown was requested.
    Shutdown,
}

/// Why the wait for a running worker ended.
enum WaitEvent {
    Exited(Result<Option<i32>, crate::error::ProcessError>),
    TimedOut,
    Stop { restart: bool },
    Shutdown,
}

/// A worker the supervisor has launched.
struct TrackedWorker {
    process: Box<dyn ManagedProcess>,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Queue-driven single-worker supervisor.
pub struct Supervisor {
    config: DispatchConfig,
    queue: PromptQueue,
    triggers: TriggerWatcher,
    reporter: StatusReporter,
    launcher: Arc<dyn ProcessLauncher>,
    worker: Option<TrackedWorker>,
    last_spawn: Option<Instant>,
    last_health: Option<Instant>,
    consecutive_failures: u32,
    store_failures: u32,
    pending_start: bool,
    shutdown_rx: broadcast::Receiver<()>,
    shutting_down: bool,
    metrics: MetricsCollector,
}

impl Supervisor {
    /// Creates a supervisor.
    ///
    /// # Arguments
    ///
    /// * `config` - Intervals, timeouts and retry policy
    /// * `store` - Store holding the queue, trigger and status keys
    /// * `launcher` - Starts worker processes
    /// * `shutdown_rx` - Receiver for the shutdown broadcast
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        launcher: Arc<dyn ProcessLauncher>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue: PromptQueue::new(Arc::clone(&store)),
            triggers: TriggerWatcher::new(Arc::clone(&store), config.trigger_max_age),
            reporter: StatusReporter::new(store, config.status_ttl),
            config,
            launcher,
            worker: None,
            last_spawn: None,
            last_health: None,
            consecutive_failures: 0,
            store_failures: 0,
            pending_start: false,
            shutdown_rx,
            shutting_down: false,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns true while a worker process is live.
    pub fn has_live_worker(&mut self) -> bool {
        match self.worker.as_mut() {
            Some(worker) => worker.process.is_alive(),
            None => false,
        }
    }

    /// Returns the current worker failure streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns how long to wait before the next spawn is allowed.
    pub fn spawn_cooldown(&self) -> Option<Duration> {
        let last = self.last_spawn?;
        let remaining = self.config.min_spawn_interval.saturating_sub(last.elapsed());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Starts a worker unless one is already live.
    ///
    /// Returns false without touching the status key when a worker is live.
    /// A launch failure publishes `error` and also returns false.
    pub async fn spawn_worker(&mut self) -> bool {
        if self.has_live_worker() {
            debug!("Worker already running, not spawning another");
            return false;
        }
        // A previous worker that exited unobserved is simply forgotten
        self.worker = None;

        self.reporter
            .publish_worker(
                WorkerState::Starting,
                metadata([("command", json!(self.config.worker_program))]),
            )
            .await;

        self.last_spawn = Some(Instant::now());

        match self.launcher.launch() {
            Ok(process) => {
                let started_at = Utc::now();
                let pid = process.pid();
                self.worker = Some(TrackedWorker {
                    process,
                    started: Instant::now(),
                    started_at,
                });
                self.metrics.set_worker_active(true);

                info!(worker_pid = ?pid, "Worker started");
                self.reporter
                    .publish_worker(
                        WorkerState::Running,
                        metadata([
                            ("worker_pid", json!(pid)),
                            ("started_at", json!(started_at.to_rfc3339())),
                        ]),
                    )
                    .await;
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to launch worker");
                self.reporter
                    .publish_worker(
                        WorkerState::Error,
                        metadata([
                            ("error", json!(e.to_string())),
                            ("failed_at", json!(Utc::now().to_rfc3339())),
                        ]),
                    )
                    .await;
                false
            }
        }
    }

    /// Waits for the running worker to finish.
    ///
    /// While waiting, the trigger key is polled every poll interval so a
    /// STOP_WORKER or RESTART_WORKER can interrupt the run. A worker that
    /// outlives `timeout` (measured from its start) is terminated, given the
    /// grace period, then killed.
    pub async fn await_worker(&mut self, timeout: Duration) -> WorkerOutcome {
        let Some(mut tracked) = self.worker.take() else {
            warn!("await_worker called without a running worker");
            return WorkerOutcome::Failure { exit_code: None };
        };

        let deadline = tokio::time::Instant::from_std(tracked.started) + timeout;
        let poll_every = self.config.poll_interval;
        let mut poll = tokio::time::interval_at(tokio::time::Instant::now() + poll_every, poll_every);

        let event = loop {
            tokio::select! {
                result = tracked.process.wait() => break WaitEvent::Exited(result),
                _ = tokio::time::sleep_until(deadline) => break WaitEvent::TimedOut,
                _ = self.shutdown_rx.recv() => break WaitEvent::Shutdown,
                _ = poll.tick() => {
                    self.heartbeat(true).await;
                    match self.triggers.check_trigger().await {
                        Some(TriggerAction::StopWorker) => {
                            self.metrics.record_trigger(TriggerAction::StopWorker.as_str());
                            break WaitEvent::Stop { restart: false };
                        }
                        Some(TriggerAction::RestartWorker) => {
                            self.metrics.record_trigger(TriggerAction::RestartWorker.as_str());
                            break WaitEvent::Stop { restart: true };
                        }
                        Some(TriggerAction::StartWorker) => {
                            self.metrics.record_trigger(TriggerAction::StartWorker.as_str());
                            debug!("START_WORKER ignored, worker already running");
                        }
                        None => {}
                    }
                }
            }
        };

        let pid = tracked.process.pid();
        let outcome = match event {
            WaitEvent::Exited(Ok(exit_code)) => {
                let output = tracked.process.take_output().await;
                if !output.stdout.is_empty() {
                    debug!(worker_pid = ?pid, stdout = %output.stdout, "Worker output");
                }

                if exit_code == Some(0) {
                    info!(
                        worker_pid = ?pid,
                        duration_secs = tracked.started.elapsed().as_secs_f64(),
                        "Worker completed"
                    );
                    self.reporter
                        .publish_worker(
                            WorkerState::Completed,
                            metadata([
                                ("exit_code", json!(0)),
                                ("started_at", json!(tracked.started_at.to_rfc3339())),
                                ("completed_at", json!(Utc::now().to_rfc3339())),
                            ]),
                        )
                        .await;
                    WorkerOutcome::Success
                } else {
                    let error_text = tail_chars(output.stderr.trim(), STATUS_ERROR_CHARS);
                    warn!(
                        worker_pid = ?pid,
                        exit_code = ?exit_code,
                        stderr = %error_text,
                        "Worker failed"
                    );
                    self.reporter
                        .publish_worker(
                            WorkerState::Failed,
                            metadata([
                                ("exit_code", json!(exit_code)),
                                ("error", json!(error_text)),
                                ("failed_at", json!(Utc::now().to_rfc3339())),
                            ]),
                        )
                        .await;
                    WorkerOutcome::Failure { exit_code }
                }
            }
            WaitEvent::Exited(Err(e)) => {
                error!(worker_pid = ?pid, error = %e, "Failed to wait for worker");
                if let Err(kill_err) = tracked.process.kill().await {
                    warn!(worker_pid = ?pid, error = %kill_err, "Failed to kill worker");
                }
                self.reporter
                    .publish_worker(
                        WorkerState::Failed,
                        metadata([
                            ("exit_code", json!(null)),
                            ("error", json!(e.to_string())),
                            ("failed_at", json!(Utc::now().to_rfc3339())),
                        ]),
                    )
                    .await;
                WorkerOutcome::Failure { exit_code: None }
            }
            WaitEvent::TimedOut => {
                warn!(
                    worker_pid = ?pid,
                    timeout_secs = timeout.as_secs(),
                    "Worker timed out, terminating"
                );
                self.terminate(tracked.process.as_mut()).await;
                self.reporter
                    .publish_worker(
                        WorkerState::Timeout,
                        metadata([
                            ("timeout_after", json!(timeout.as_secs())),
                            ("terminated_at", json!(Utc::now().to_rfc3339())),
                        ]),
                    )
                    .await;
                WorkerOutcome::Timeout
            }
            WaitEvent::Stop { restart } => {
                let reason = if restart { "RESTART_WORKER" } else { "STOP_WORKER" };
                info!(worker_pid = ?pid, reason = reason, "Stopping worker on trigger");
                self.terminate(tracked.process.as_mut()).await;
                self.publish_stopped(reason).await;
                WorkerOutcome::Stopped { restart }
            }
            WaitEvent::Shutdown => {
                info!(worker_pid = ?pid, "Shutdown requested, stopping worker");
                self.shutting_down = true;
                self.terminate(tracked.process.as_mut()).await;
                self.publish_stopped("shutdown").await;
                WorkerOutcome::Stopped { restart: false }
            }
        };

        self.metrics.set_worker_active(false);
        self.metrics
            .record_worker_run(outcome.label(), tracked.started.elapsed().as_secs_f64());

        outcome
    }

    /// Stops the live worker, if any. Returns true if a worker was stopped.
    pub async fn stop_worker(&mut self, reason: &str) -> bool {
        let Some(mut tracked) = self.worker.take() else {
            return false;
        };

        info!(worker_pid = ?tracked.process.pid(), reason = reason, "Stopping worker");
        self.terminate(tracked.process.as_mut()).await;
        self.metrics.set_worker_active(false);
        self.metrics
            .record_worker_run("stopped", tracked.started.elapsed().as_secs_f64());
        self.publish_stopped(reason).await;
        true
    }

    /// Runs one monitor cycle.
    pub async fn run_cycle(&mut self) -> CycleResult {
        let mut force = std::mem::take(&mut self.pending_start);

        if let Some(action) = self.triggers.check_trigger().await {
            self.metrics.record_trigger(action.as_str());
            match action {
                TriggerAction::StopWorker => {
                    self.stop_worker("STOP_WORKER").await;
                    return CycleResult::Idle;
                }
                TriggerAction::RestartWorker => {
                    self.stop_worker("RESTART_WORKER").await;
                    if self.sleep_or_shutdown(self.config.restart_delay).await {
                        return CycleResult::Shutdown;
                    }
                    force = true;
                }
                TriggerAction::StartWorker => force = true,
            }
        }

        match self.queue.check_queue_depth().await {
            Ok(depth) => {
                self.store_failures = 0;
                self.metrics.update_queue_depth(depth.pending, depth.processing);
                debug!(
                    pending = depth.pending,
                    processing = depth.processing,
                    "Checked queue depth"
                );
                if !(force || depth.has_work()) {
                    return CycleResult::Idle;
                }
            }
            Err(e) => {
                self.store_failures = self.store_failures.saturating_add(1);
                self.metrics.record_store_error("monitor");
                if !force {
                    let delay = self.config.monitor_retry.delay_for(self.store_failures);
                    error!(
                        error = %e,
                        consecutive_errors = self.store_failures,
                        retry_in_secs = delay.as_secs(),
                        "Failed to check queue depth"
                    );
                    return CycleResult::Backoff(delay);
                }
                warn!(error = %e, "Queue depth unavailable, honouring trigger anyway");
            }
        }

        if let Some(wait) = self.spawn_cooldown() {
            debug!(wait_ms = wait.as_millis() as u64, "Waiting out spawn interval");
            if self.sleep_or_shutdown(wait).await {
                return CycleResult::Shutdown;
            }
        }

        if !self.spawn_worker().await {
            if self.has_live_worker() {
                return CycleResult::Idle;
            }
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            return self.failure_backoff();
        }

        let outcome = self.await_worker(self.config.worker_timeout).await;
        match outcome {
            WorkerOutcome::Success => {
                self.consecutive_failures = 0;
                match self.queue.check_queue_depth().await {
                    Ok(depth) if depth.has_work() => {
                        info!(pending = depth.pending, "More prompts queued, continuing");
                        CycleResult::Continue
                    }
                    Ok(_) => CycleResult::Idle,
                    Err(e) => {
                        warn!(error = %e, "Failed to re-check queue depth");
                        CycleResult::Idle
                    }
                }
            }
            WorkerOutcome::Failure { .. } | WorkerOutcome::Timeout => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.failure_backoff()
            }
            WorkerOutcome::Stopped { restart: true } => {
                if self.sleep_or_shutdown(self.config.restart_delay).await {
                    return CycleResult::Shutdown;
                }
                self.pending_start = true;
                CycleResult::Continue
            }
            WorkerOutcome::Stopped { restart: false } => {
                if self.shutting_down {
                    CycleResult::Shutdown
                } else {
                    CycleResult::Idle
                }
            }
        }
    }

    /// Runs until shutdown.
    ///
    /// Transient errors never end the loop. On shutdown any live worker is
    /// stopped and the status becomes `stopped`.
    pub async fn monitor_loop(&mut self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            worker_timeout_secs = self.config.worker_timeout.as_secs(),
            "Queue monitor started"
        );

        self.reporter
            .publish_worker(
                WorkerState::Ready,
                metadata([
                    ("poll_interval", json!(self.config.poll_interval.as_secs())),
                    ("worker_timeout", json!(self.config.worker_timeout.as_secs())),
                ]),
            )
            .await;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    self.shutting_down = true;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    self.shutting_down = true;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
            if self.shutting_down {
                break;
            }

            self.heartbeat(self.worker.is_some()).await;

            let delay = match self.run_cycle().await {
                CycleResult::Continue => continue,
                CycleResult::Idle => self.config.poll_interval,
                CycleResult::Backoff(delay) => delay,
                CycleResult::Shutdown => break,
            };

            if self.sleep_or_shutdown(delay).await {
                break;
            }
        }

        if !self.stop_worker("shutdown").await {
            self.publish_stopped("shutdown").await;
        }
        self.metrics.set_worker_active(false);
        info!("Queue monitor stopped");
    }

    fn failure_backoff(&mut self) -> CycleResult {
        let policy = self.config.monitor_retry;
        let failures = self.consecutive_failures;
        let delay = policy.delay_for(failures);

        if policy.is_exhausted(failures) {
            warn!(
                consecutive_failures = failures,
                backoff_secs = delay.as_secs(),
                "Too many consecutive worker failures, backing off"
            );
            self.consecutive_failures = 0;
        } else {
            debug!(
                consecutive_failures = failures,
                backoff_secs = delay.as_secs_f64(),
                "Worker failed, backing off"
            );
        }

        CycleResult::Backoff(delay)
    }

    /// Sleeps for `duration`. Returns true if shutdown was requested instead.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown_rx.recv() => {
                self.shutting_down = true;
                true
            }
        }
    }

    async fn terminate(&mut self, process: &mut dyn ManagedProcess) {
        let pid = process.pid();
        match stop_gracefully(process, self.config.grace_period).await {
            Ok(Termination::Graceful(code)) => {
                debug!(worker_pid = ?pid, exit_code = ?code, "Worker exited after terminate");
            }
            Ok(Termination::Forced) => {
                warn!(worker_pid = ?pid, "Worker killed after grace period");
            }
            Err(e) => {
                error!(worker_pid = ?pid, error = %e, "Failed to stop worker");
            }
        }
    }

    async fn publish_stopped(&mut self, reason: &str) {
        self.reporter
            .publish_worker(
                WorkerState::Stopped,
                metadata([
                    ("reason", json!(reason)),
                    ("stopped_at", json!(Utc::now().to_rfc3339())),
                ]),
            )
            .await;
    }

    /// Publishes the health record at most once per health interval.
    ///
    /// `worker_active` is passed in because `await_worker` holds the worker
    /// outside `self.worker` while it runs.
    async fn heartbeat(&mut self, worker_active: bool) {
        let due = self
            .last_health
            .map_or(true, |last| last.elapsed() >= self.config.health_interval);
        if !due {
            return;
        }
        self.last_health = Some(Instant::now());

        let mut extra = Map::new();
        extra.insert("worker_active".to_string(), json!(worker_active));
        extra.insert(
            "consecutive_failures".to_string(),
            json!(self.consecutive_failures),
        );
        self.reporter
            .publish_health(keys::AUTOMATION_HEALTH, "queue_monitor", extra)
            .await;
    }
}

/// Returns at most the last `max` characters of `s`.
fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}
