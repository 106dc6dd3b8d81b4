//! Per-host refresh lifecycle.
//!
//! Every known host gets one lightweight task that walks the state machine
//!
//! ```text
//! disconnected -> connecting -> connected (polling) -> connecting ...
//!                     |
//!                     +-> backoff -> connecting ...
//!                     +-> given_up (until an explicit reconnect)
//! ```
//!
//! # Lifecycle
//!
//! - A successful connect resets the attempt counter, runs one refresh right
//!   away and then polls on the host's configured interval.
//! - A failed connect is retried after `min(initial * 2^(attempt-1), max)`.
//!   Once the attempt count exceeds the configured maximum the host is given up
//!   until [`RefreshScheduler::reconnect`] is called.
//! - While polling, only a refresh that fails with
//!   [`FleetError::NotConnected`] sends the host back to connecting. Any other
//!   failure is recorded in the store and the next tick tries again.
//!
//! # Concurrency
//!
//! At most one refresh per host is in flight. Scheduled ticks and manual
//! refreshes race for the same gate; the loser is dropped, not queued.
//! Stopping the scheduler cancels timers and backoff sleeps but lets a
//! running refresh finish, and never closes sessions.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fleet::config::{SchedulerConfig, validate_refresh_interval};
use crate::fleet::error::FleetError;
use crate::fleet::hosts::HostStore;
use crate::fleet::parsers::{CommandRunner, collect_accelerator_snapshot, collect_system_snapshot};
use crate::fleet::registry::RemoteSessions;
use crate::fleet::store::{SnapshotKind, TelemetryStore};
use crate::fleet::types::{
    AcceleratorSnapshot, CommandOutput, LifecycleState, RefreshConfig, RefreshOutcome,
    RefreshStatus, SystemSnapshot, Timestamp,
};

const NEVER: Timestamp = Timestamp::MIN;

/// Reconnect delay before attempt `attempt` (1-based).
pub fn reconnect_delay(config: &SchedulerConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    config
        .reconnect_initial
        .saturating_mul(1u32 << exponent)
        .min(config.reconnect_max)
}

fn refresh_outcome(result: Result<(), FleetError>) -> RefreshOutcome {
    match result {
        Ok(()) => RefreshOutcome::Completed,
        Err(e) => RefreshOutcome::Failed {
            error: e.to_string(),
        },
    }
}

struct HostTask {
    host_id: String,
    refreshing: AtomicBool,
    refresh_done: Notify,
    attempts: AtomicU32,
    last_connect_attempt_at: AtomicI64,
    state: watch::Sender<LifecycleState>,
    interval_ms: watch::Sender<u64>,
}

/// Clears the in-flight flag and wakes waiters when the refresh ends,
/// however it ends.
struct RefreshGuard<'a>(&'a HostTask);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
        self.0.refresh_done.notify_waiters();
    }
}

impl HostTask {
    fn new(host_id: &str, interval_ms: u64) -> Self {
        Self {
            host_id: host_id.to_string(),
            refreshing: AtomicBool::new(false),
            refresh_done: Notify::new(),
            attempts: AtomicU32::new(0),
            last_connect_attempt_at: AtomicI64::new(NEVER),
            state: watch::channel(LifecycleState::Disconnected).0,
            interval_ms: watch::channel(interval_ms).0,
        }
    }

    fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard(self))
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Host {}: {} -> {}", self.host_id, previous, state);
        }
    }

    fn last_connect_attempt_at(&self) -> Option<Timestamp> {
        match self.last_connect_attempt_at.load(Ordering::Acquire) {
            NEVER => None,
            at => Some(at),
        }
    }
}

/// Runs commands on one host's registry session and remembers how they went.
struct SessionRunner {
    registry: Arc<dyn RemoteSessions>,
    host_id: String,
    timeout: Duration,
    lost: AtomicBool,
    succeeded: AtomicBool,
    last_error: tokio::sync::Mutex<Option<FleetError>>,
}

impl SessionRunner {
    fn new(registry: Arc<dyn RemoteSessions>, host_id: &str, timeout: Duration) -> Self {
        Self {
            registry,
            host_id: host_id.to_string(),
            timeout,
            lost: AtomicBool::new(false),
            succeeded: AtomicBool::new(false),
            last_error: tokio::sync::Mutex::new(None),
        }
    }

    /// The refresh failed if the session went away or if no command ran at all.
    async fn outcome(&self) -> Result<(), FleetError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(FleetError::NotConnected(self.host_id.clone()));
        }
        if self.succeeded.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.last_error.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CommandRunner for SessionRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, FleetError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(FleetError::NotConnected(self.host_id.clone()));
        }
        match self
            .registry
            .execute(&self.host_id, command, self.timeout)
            .await
        {
            Ok(output) => {
                self.succeeded.store(true, Ordering::Release);
                Ok(output)
            }
            Err(e) => {
                if e.is_not_connected() {
                    self.lost.store(true, Ordering::Release);
                }
                *self.last_error.lock().await = Some(e.clone());
                Err(e)
            }
        }
    }
}

enum PollExit {
    Cancelled,
    ConnectionLost,
}

struct Inner {
    registry: Arc<dyn RemoteSessions>,
    hosts: Arc<dyn HostStore>,
    store: Arc<TelemetryStore>,
    config: SchedulerConfig,
    tasks: DashMap<String, Arc<HostTask>>,
    lifecycles: DashMap<String, CancellationToken>,
    root: Mutex<Option<CancellationToken>>,
}

/// Supervises one refresh lifecycle per host.
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(
        registry: Arc<dyn RemoteSessions>,
        hosts: Arc<dyn HostStore>,
        store: Arc<TelemetryStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                hosts,
                store,
                config,
                tasks: DashMap::new(),
                lifecycles: DashMap::new(),
                root: Mutex::new(None),
            }),
        }
    }

    /// Start a lifecycle for every known host plus the history sweep.
    /// Does nothing when already running.
    pub fn start(&self) {
        let root = {
            let mut slot = self.inner.root_slot();
            if slot.is_some() {
                return;
            }
            let root = CancellationToken::new();
            *slot = Some(root.clone());
            root
        };

        tokio::spawn(cleanup_loop(Arc::clone(&self.inner), root.child_token()));

        let host_ids = self.inner.hosts.list_host_ids();
        for host_id in &host_ids {
            self.inner.spawn_lifecycle(host_id);
        }
        info!("Scheduler started with {} host(s)", host_ids.len());
    }

    /// Cancel every timer and backoff sleep. Sessions stay open.
    pub fn stop(&self) {
        let Some(root) = self.inner.root_slot().take() else {
            return;
        };
        root.cancel();
        self.inner.lifecycles.clear();
        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.root_slot().is_some()
    }

    /// Track a host that appeared after start.
    pub fn add_host(&self, host_id: &str) -> Result<(), FleetError> {
        self.inner.require_host(host_id)?;
        if self.inner.lifecycles.contains_key(host_id) {
            return Ok(());
        }
        self.inner.task(host_id);
        if self.is_running() {
            self.inner.spawn_lifecycle(host_id);
        }
        Ok(())
    }

    /// Stop tracking a host. Returns whether it was tracked.
    pub fn remove_host(&self, host_id: &str) -> bool {
        if let Some((_, token)) = self.inner.lifecycles.remove(host_id) {
            token.cancel();
        }
        let removed = self.inner.tasks.remove(host_id).is_some();
        if removed {
            info!("Removed host {} from scheduler", host_id);
        }
        removed
    }

    /// Restart a host's lifecycle with a fresh attempt counter.
    ///
    /// This is the way out of `given_up`.
    pub fn reconnect(&self, host_id: &str) -> Result<(), FleetError> {
        self.inner.require_host(host_id)?;
        let task = self.inner.task(host_id);
        task.attempts.store(0, Ordering::Release);
        info!("Reconnect requested for host {}", host_id);
        self.inner.spawn_lifecycle(host_id);
        Ok(())
    }

    /// Manual refresh. Dropped (not queued) when one is already running.
    ///
    /// Runs whether or not auto-refresh is enabled for the host.
    pub async fn refresh_one(&self, host_id: &str) -> Result<RefreshOutcome, FleetError> {
        self.inner.require_host(host_id)?;
        let task = self.inner.task(host_id);
        Ok(match self.inner.gated_refresh(&task).await {
            None => {
                debug!("Refresh for host {} already in flight, skipping", host_id);
                RefreshOutcome::Skipped
            }
            Some(result) => refresh_outcome(result),
        })
    }

    /// Refresh now, or wait for the refresh already in flight to finish.
    ///
    /// Returns `Skipped` after waiting; the cache then holds whatever the
    /// other refresh wrote.
    pub async fn refresh_or_wait(&self, host_id: &str) -> Result<RefreshOutcome, FleetError> {
        self.inner.require_host(host_id)?;
        let task = self.inner.task(host_id);

        // Registered before the gate check so a refresh ending in between is seen
        let finished = task.refresh_done.notified();
        tokio::pin!(finished);
        finished.as_mut().enable();

        Ok(match self.inner.gated_refresh(&task).await {
            None => {
                debug!("Refresh for host {} in flight, waiting for it", host_id);
                finished.await;
                RefreshOutcome::Skipped
            }
            Some(result) => refresh_outcome(result),
        })
    }

    /// Change only the polling period.
    pub fn update_interval(&self, host_id: &str, interval_ms: u64) -> Result<RefreshConfig, FleetError> {
        self.inner.require_host(host_id)?;
        let config = RefreshConfig {
            interval_ms,
            ..self.inner.hosts.get_refresh_config(host_id)
        };
        self.set_refresh_config(host_id, config)
    }

    /// Persist `config` and apply its interval to a running timer.
    ///
    /// An in-flight refresh is not interrupted; the new period starts from
    /// the moment it is applied.
    pub fn set_refresh_config(
        &self,
        host_id: &str,
        config: RefreshConfig,
    ) -> Result<RefreshConfig, FleetError> {
        validate_refresh_interval(config.interval_ms)?;
        self.inner.require_host(host_id)?;
        self.inner.hosts.set_refresh_config(host_id, config)?;

        if let Some(task) = self.inner.tasks.get(host_id) {
            task.interval_ms.send_if_modified(|current| {
                let changed = *current != config.interval_ms;
                *current = config.interval_ms;
                changed
            });
        }
        info!(
            "Refresh config for host {}: auto={} interval={}ms",
            host_id, config.auto_refresh, config.interval_ms
        );
        Ok(config)
    }

    pub fn status(&self, host_id: &str) -> Result<RefreshStatus, FleetError> {
        self.inner.require_host(host_id)?;
        let config = self.inner.hosts.get_refresh_config(host_id);
        let task = self.inner.tasks.get(host_id).map(|t| Arc::clone(t.value()));
        Ok(RefreshStatus {
            host_id: host_id.to_string(),
            refreshing: task
                .as_ref()
                .is_some_and(|t| t.refreshing.load(Ordering::Acquire)),
            auto_refresh: config.auto_refresh,
            interval_ms: config.interval_ms,
            state: task.as_ref().map(|t| *t.state.borrow()),
            reconnect_attempts: task
                .as_ref()
                .map_or(0, |t| t.attempts.load(Ordering::Acquire)),
            last_connect_attempt_at: task.as_ref().and_then(|t| t.last_connect_attempt_at()),
        })
    }

    /// Watch a host's lifecycle state.
    pub fn subscribe(&self, host_id: &str) -> Option<watch::Receiver<LifecycleState>> {
        self.inner.tasks.get(host_id).map(|t| t.state.subscribe())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn root_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_host(&self, host_id: &str) -> Result<(), FleetError> {
        match self.hosts.get_host(host_id) {
            Some(_) => Ok(()),
            None => Err(FleetError::NotFound(format!("host {}", host_id))),
        }
    }

    fn task(&self, host_id: &str) -> Arc<HostTask> {
        self.tasks
            .entry(host_id.to_string())
            .or_insert_with(|| {
                let interval = self.hosts.get_refresh_config(host_id).interval_ms;
                Arc::new(HostTask::new(host_id, interval))
            })
            .clone()
    }

    /// (Re)start the host's lifecycle, cancelling any previous one.
    fn spawn_lifecycle(self: &Arc<Self>, host_id: &str) {
        let token = match self.root_slot().as_ref() {
            Some(root) => root.child_token(),
            None => CancellationToken::new(),
        };
        if let Some(previous) = self.lifecycles.insert(host_id.to_string(), token.clone()) {
            previous.cancel();
        }
        let task = self.task(host_id);
        tokio::spawn(run_lifecycle(Arc::clone(self), task, token));
    }

    async fn connect(&self, task: &HostTask) -> Result<(), FleetError> {
        let host = self
            .hosts
            .get_host(&task.host_id)
            .ok_or_else(|| FleetError::NotFound(format!("host {}", task.host_id)))?;
        task.last_connect_attempt_at
            .store(self.store.now_ms(), Ordering::Release);

        match self.registry.connect(&host, None).await {
            Ok(session) => {
                self.store.set_connection_status(&task.host_id, true, None);
                info!(
                    "Connected to {} ({}){}",
                    host.name,
                    host.id,
                    if session.reused { ", reused session" } else { "" }
                );
                Ok(())
            }
            Err(e) => {
                self.store
                    .set_connection_status(&task.host_id, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Poll until cancelled or until the session is gone.
    async fn poll(&self, task: &HostTask, cancel: &CancellationToken) -> PollExit {
        if let Some(Err(e)) = self.gated_refresh(task).await
            && e.is_not_connected()
        {
            return PollExit::ConnectionLost;
        }

        let mut interval_rx = task.interval_ms.subscribe();
        let mut ticker = new_ticker(*interval_rx.borrow_and_update());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return PollExit::Cancelled,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return PollExit::Cancelled;
                    }
                    let period = *interval_rx.borrow_and_update();
                    debug!("Host {} polling every {}ms", task.host_id, period);
                    ticker = new_ticker(period);
                }
                _ = ticker.tick() => {
                    if !self.hosts.get_refresh_config(&task.host_id).auto_refresh {
                        continue;
                    }
                    if let Some(Err(e)) = self.gated_refresh(task).await
                        && e.is_not_connected()
                    {
                        return PollExit::ConnectionLost;
                    }
                }
            }
        }
    }

    /// `None` when another refresh holds the gate.
    async fn gated_refresh(&self, task: &HostTask) -> Option<Result<(), FleetError>> {
        let _guard = task.try_begin_refresh()?;
        Some(self.refresh(&task.host_id).await)
    }

    async fn refresh(&self, host_id: &str) -> Result<(), FleetError> {
        match self.collect(host_id).await {
            Ok((accelerator, system, collected_at)) => {
                self.record(host_id, SnapshotKind::Accelerator, &accelerator, true, None);
                self.record(host_id, SnapshotKind::System, &system, true, None);
                self.store.set_connection_status(host_id, true, None);
                self.store
                    .append_accelerator_history(host_id, &accelerator, collected_at);
                self.store
                    .append_system_history(host_id, &system, collected_at);
                info!(
                    "Refreshed host {}: {} chip(s), {} mount(s)",
                    host_id,
                    accelerator.chips.len(),
                    system.storage.len()
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to refresh host {}: {}", host_id, e);
                let message = e.to_string();
                let now = self.store.now_ms();
                let accelerator = AcceleratorSnapshot {
                    collected_at: now,
                    ..Default::default()
                };
                let system = SystemSnapshot {
                    collected_at: now,
                    ..Default::default()
                };
                self.record(
                    host_id,
                    SnapshotKind::Accelerator,
                    &accelerator,
                    false,
                    Some(message.clone()),
                );
                self.record(
                    host_id,
                    SnapshotKind::System,
                    &system,
                    false,
                    Some(message.clone()),
                );
                self.store
                    .set_connection_status(host_id, false, Some(message));
                Err(e)
            }
        }
    }

    async fn collect(
        &self,
        host_id: &str,
    ) -> Result<(AcceleratorSnapshot, SystemSnapshot, Timestamp), FleetError> {
        if !self.registry.is_connected(host_id) {
            return Err(FleetError::NotConnected(host_id.to_string()));
        }
        let policy = self.config.command;
        let runner = SessionRunner::new(Arc::clone(&self.registry), host_id, policy.timeout);
        let collected_at = self.store.now_ms();

        let (accelerator, system) = futures::join!(
            collect_accelerator_snapshot(&runner, policy, collected_at),
            collect_system_snapshot(&runner, policy, collected_at),
        );
        runner.outcome().await?;
        Ok((accelerator, system, collected_at))
    }

    fn record<T: serde::Serialize>(
        &self,
        host_id: &str,
        kind: SnapshotKind,
        snapshot: &T,
        success: bool,
        error: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .write_snapshot(host_id, kind, snapshot, success, error)
        {
            error!("Failed to store {} snapshot for {}: {}", kind, host_id, e);
        }
    }
}

fn new_ticker(period_ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_lifecycle(inner: Arc<Inner>, task: Arc<HostTask>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        task.set_state(LifecycleState::Connecting);

        match inner.connect(&task).await {
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                task.attempts.store(0, Ordering::Release);
                task.set_state(LifecycleState::Connected);
                match inner.poll(&task, &cancel).await {
                    PollExit::Cancelled => break,
                    PollExit::ConnectionLost => {
                        warn!("Lost session to host {}, reconnecting", task.host_id);
                    }
                }
            }
            Err(FleetError::NotFound(what)) => {
                warn!("Stopping lifecycle: {} no longer exists", what);
                break;
            }
            Err(e) => {
                let attempt = task.attempts.fetch_add(1, Ordering::AcqRel) + 1;
                let max = inner.config.max_reconnect_attempts;
                if attempt > max {
                    error!(
                        "Max reconnection attempts reached for host {}: {}. Giving up.",
                        task.host_id, e
                    );
                    task.set_state(LifecycleState::GivenUp);
                    return;
                }
                let delay = reconnect_delay(&inner.config, attempt);
                warn!(
                    "Failed to connect to host {}: {} (attempt {}/{}, next retry in {:?})",
                    task.host_id, e, attempt, max, delay
                );
                task.set_state(LifecycleState::Backoff);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    // A newer lifecycle may already own the state
    let superseded = cancel.is_cancelled()
        && inner
            .lifecycles
            .get(&task.host_id)
            .is_some_and(|current| !current.is_cancelled());
    if !superseded {
        task.set_state(LifecycleState::Disconnected);
    }
}

async fn cleanup_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let period = inner.config.cleanup_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let removed = inner.store.cleanup(inner.config.history_retention);
                debug!("History sweep removed {} row(s)", removed);
            }
        }
    }
}
