//! Worker registry and the termination protocol.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::worker::{Worker, WorkerId};
use crate::config::LifecycleConfig;
use crate::events::{EventBus, GovernorEvent};
use crate::reaper::ProcessInspector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationOutcome {
    /// Closed gracefully and the process (if known) is gone.
    Graceful,
    /// Force-killed after a failed or skipped graceful close.
    ForceKilled,
    /// Nothing left to terminate.
    AlreadyExited,
    /// The process survived a force kill. The entry is removed regardless.
    StillAlive,
    /// Close failed and no process id is known, so nothing more can be done.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationReport {
    pub outcome: TerminationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_error: Option<String>,
}

impl TerminationReport {
    /// At most one error per worker: a failed close, or a kill that did not take.
    pub fn error(&self) -> Option<String> {
        match (&self.close_error, self.outcome) {
            (Some(err), _) => Some(err.clone()),
            (None, TerminationOutcome::StillAlive) => {
                Some("process survived force kill".to_string())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFailure {
    pub id: WorkerId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyCleanupReport {
    pub terminated: usize,
    pub errors: Vec<WorkerFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupCycleReport {
    pub cleaned: usize,
    pub remaining: usize,
}

/// Registry snapshot for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub connected: bool,
    pub in_use: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetireReason {
    MaxAge,
    Idle,
    ProcessExited,
    Disconnected,
}

struct ManagedWorker {
    handle: Arc<dyn Worker>,
    pid: Option<u32>,
    spawned_at: Instant,
    last_used: Instant,
    connected: bool,
    in_use: bool,
    terminating: bool,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    workers: HashMap<WorkerId, ManagedWorker>,
    monitor: Option<JoinHandle<()>>,
}

struct LifecycleInner {
    config: LifecycleConfig,
    inspector: Arc<dyn ProcessInspector>,
    events: EventBus,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

/// Owns the lifetime of every registered worker.
///
/// Cloning is cheap; clones share one registry. When the last clone is dropped
/// with workers still registered, their processes are force-killed.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<LifecycleInner>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        inspector: Arc<dyn ProcessInspector>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                inspector,
                events,
                next_id: AtomicU64::new(0),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub async fn register(&self, worker: Arc<dyn Worker>) -> WorkerId {
        let id = WorkerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let pid = worker.process_id();
        let now = Instant::now();
        let watcher = tokio::spawn(watch_disconnect(
            Arc::downgrade(&self.inner),
            id,
            worker.clone(),
        ));

        let mut registry = self.inner.registry.lock().await;
        registry.workers.insert(
            id,
            ManagedWorker {
                handle: worker,
                pid,
                spawned_at: now,
                last_used: now,
                connected: true,
                in_use: false,
                terminating: false,
                watcher,
            },
        );
        if registry.monitor.is_none() {
            registry.monitor = Some(self.spawn_monitor());
        }
        let count = registry.workers.len();
        drop(registry);

        info!(%id, ?pid, workers = count, "worker registered");
        self.inner
            .events
            .emit(GovernorEvent::WorkerRegistered { id, pid });
        id
    }

    /// Record a unit of work. Returns false for unknown ids.
    pub async fn touch(&self, id: WorkerId) -> bool {
        let mut registry = self.inner.registry.lock().await;
        match registry.workers.get_mut(&id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// In-use workers are exempt from age and idle retirement.
    pub async fn mark_in_use(&self, id: WorkerId, in_use: bool) -> bool {
        let mut registry = self.inner.registry.lock().await;
        match registry.workers.get_mut(&id) {
            Some(entry) => {
                entry.in_use = in_use;
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// The handle for `id`, unless it is unknown, terminating or disconnected.
    pub async fn usable(&self, id: WorkerId) -> Option<Arc<dyn Worker>> {
        let registry = self.inner.registry.lock().await;
        registry
            .workers
            .get(&id)
            .filter(|e| !e.terminating && e.connected && e.handle.is_connected())
            .map(|e| e.handle.clone())
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.registry.lock().await.workers.len()
    }

    pub async fn contains(&self, id: WorkerId) -> bool {
        self.inner.registry.lock().await.workers.contains_key(&id)
    }

    /// Process ids of every registered worker that exposes one.
    pub async fn live_pids(&self) -> HashSet<u32> {
        let registry = self.inner.registry.lock().await;
        registry.workers.values().filter_map(|e| e.pid).collect()
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let now = Instant::now();
        let registry = self.inner.registry.lock().await;
        let mut infos: Vec<WorkerInfo> = registry
            .workers
            .iter()
            .map(|(id, e)| WorkerInfo {
                id: *id,
                pid: e.pid,
                age_ms: now.duration_since(e.spawned_at).as_millis() as u64,
                idle_ms: now.duration_since(e.last_used).as_millis() as u64,
                connected: e.connected,
                in_use: e.in_use,
            })
            .collect();
        infos.sort_by_key(|w| w.id);
        infos
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner.registry.lock().await.monitor.is_some()
    }

    /// Terminate and remove a worker. `None` when the id is unknown or
    /// another caller is already terminating it.
    pub async fn unregister(&self, id: WorkerId) -> Option<TerminationReport> {
        let report = self.retire(id).await;
        self.stop_monitoring_if_idle().await;
        report
    }

    /// Retire workers that are too old, idle too long, dead or disconnected.
    pub async fn run_cleanup_cycle(&self) -> CleanupCycleReport {
        let report = self.cleanup_cycle().await;
        self.stop_monitoring_if_idle().await;
        report
    }

    /// Unregister every worker. Individual failures are collected, never fatal.
    pub async fn emergency_cleanup(&self) -> EmergencyCleanupReport {
        self.stop_monitoring().await;
        let ids: Vec<WorkerId> = {
            let registry = self.inner.registry.lock().await;
            registry.workers.keys().copied().collect()
        };
        if ids.is_empty() {
            return EmergencyCleanupReport::default();
        }
        warn!(workers = ids.len(), "emergency cleanup of all workers");

        let results = join_all(ids.iter().map(|id| self.retire(*id))).await;
        let mut report = EmergencyCleanupReport::default();
        for (id, result) in ids.into_iter().zip(results) {
            let Some(termination) = result else { continue };
            report.terminated += 1;
            if let Some(message) = termination.error() {
                report.errors.push(WorkerFailure { id, message });
            }
        }
        report
    }

    pub async fn stop_monitoring(&self) {
        if let Some(monitor) = self.inner.registry.lock().await.monitor.take() {
            monitor.abort();
            debug!("worker monitoring stopped");
        }
    }

    async fn stop_monitoring_if_idle(&self) {
        let mut registry = self.inner.registry.lock().await;
        if registry.workers.is_empty() {
            if let Some(monitor) = registry.monitor.take() {
                monitor.abort();
                debug!("registry empty; worker monitoring stopped");
            }
        }
    }

    async fn cleanup_cycle(&self) -> CleanupCycleReport {
        let config = &self.inner.config;
        let now = Instant::now();
        let candidates: Vec<(WorkerId, RetireReason)> = {
            let registry = self.inner.registry.lock().await;
            registry
                .workers
                .iter()
                .filter(|(_, e)| !e.terminating)
                .filter_map(|(id, e)| {
                    let reason = if e.pid.is_some_and(|pid| !self.inner.inspector.is_alive(pid))
                    {
                        RetireReason::ProcessExited
                    } else if !e.connected || !e.handle.is_connected() {
                        RetireReason::Disconnected
                    } else if e.in_use {
                        return None;
                    } else if now.duration_since(e.spawned_at) > config.max_age {
                        RetireReason::MaxAge
                    } else if now.duration_since(e.last_used) > config.max_idle {
                        RetireReason::Idle
                    } else {
                        return None;
                    };
                    Some((*id, reason))
                })
                .collect()
        };

        for (id, reason) in &candidates {
            debug!(%id, ?reason, "retiring worker");
        }
        let results = join_all(candidates.iter().map(|(id, _)| self.retire(*id))).await;
        let cleaned = results.iter().filter(|r| r.is_some()).count();
        let remaining = self.worker_count().await;

        if cleaned > 0 {
            info!(cleaned, remaining, "worker cleanup cycle");
        }
        self.inner
            .events
            .emit(GovernorEvent::CleanupPerformed { cleaned, remaining });
        CleanupCycleReport { cleaned, remaining }
    }

    async fn retire(&self, id: WorkerId) -> Option<TerminationReport> {
        let (handle, pid, connected) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry.workers.get_mut(&id)?;
            if entry.terminating {
                return None;
            }
            entry.terminating = true;
            entry.watcher.abort();
            let connected = entry.connected && entry.handle.is_connected();
            (entry.handle.clone(), entry.pid, connected)
        };

        // Detached so the entry is still removed when the caller stops
        // waiting (shutdown timeout, aborted monitor).
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let report = manager.terminate(id, handle, pid, connected).await;
            manager.finish_retire(id, report.outcome).await;
            report
        });
        match task.await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(%id, error = %err, "worker termination task failed");
                self.finish_retire(id, TerminationOutcome::Abandoned).await;
                Some(TerminationReport {
                    outcome: TerminationOutcome::Abandoned,
                    close_error: Some(err.to_string()),
                })
            }
        }
    }

    async fn finish_retire(&self, id: WorkerId, outcome: TerminationOutcome) {
        let (removed, remaining) = {
            let mut registry = self.inner.registry.lock().await;
            let removed = registry.workers.remove(&id).is_some();
            (removed, registry.workers.len())
        };
        if !removed {
            debug!(%id, "worker already removed by a forced cleanup");
            return;
        }
        info!(%id, outcome = ?outcome, workers = remaining, "worker unregistered");
        self.inner
            .events
            .emit(GovernorEvent::WorkerUnregistered { id, outcome });
    }

    /// Remove every entry now, including ones whose termination is still in
    /// flight. Known processes are force-killed without waiting for a
    /// graceful close. Returns the number of entries removed.
    pub async fn force_remove_all(&self) -> usize {
        let drained: Vec<(WorkerId, ManagedWorker)> = {
            let mut registry = self.inner.registry.lock().await;
            if let Some(monitor) = registry.monitor.take() {
                monitor.abort();
            }
            registry.workers.drain().collect()
        };
        for (id, entry) in &drained {
            entry.watcher.abort();
            let outcome = match entry.pid {
                None => TerminationOutcome::Abandoned,
                Some(pid) if !self.inner.inspector.is_alive(pid) => {
                    TerminationOutcome::AlreadyExited
                }
                Some(pid) => match self.inner.inspector.kill(pid) {
                    Ok(()) => TerminationOutcome::ForceKilled,
                    Err(err) => {
                        warn!(%id, pid, error = %err, "force kill failed");
                        TerminationOutcome::StillAlive
                    }
                },
            };
            warn!(%id, pid = ?entry.pid, ?outcome, "worker removed without finishing termination");
            self.inner.events.emit(GovernorEvent::WorkerUnregistered {
                id: *id,
                outcome,
            });
        }
        drained.len()
    }

    async fn terminate(
        &self,
        id: WorkerId,
        worker: Arc<dyn Worker>,
        pid: Option<u32>,
        connected: bool,
    ) -> TerminationReport {
        let config = &self.inner.config;
        let inspector = &self.inner.inspector;

        let mut close_error = None;
        if connected {
            match timeout(config.close_timeout, worker.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => close_error = Some(err.to_string()),
                Err(_) => {
                    close_error = Some(format!(
                        "graceful close timed out after {:?}",
                        config.close_timeout
                    ))
                }
            }
            if let Some(err) = &close_error {
                debug!(%id, error = %err, "graceful close failed");
            }
        }
        let graceful = connected && close_error.is_none();

        let Some(pid) = pid else {
            let outcome = match (&close_error, graceful) {
                (Some(_), _) => {
                    warn!(%id, "close failed and no process id is known; abandoning worker");
                    TerminationOutcome::Abandoned
                }
                (None, true) => TerminationOutcome::Graceful,
                (None, false) => TerminationOutcome::AlreadyExited,
            };
            return TerminationReport {
                outcome,
                close_error,
            };
        };

        if !inspector.is_alive(pid) {
            let outcome = if graceful {
                TerminationOutcome::Graceful
            } else {
                TerminationOutcome::AlreadyExited
            };
            return TerminationReport {
                outcome,
                close_error,
            };
        }

        if let Err(err) = inspector.kill(pid) {
            warn!(%id, pid, error = %err, "force kill failed");
        }
        tokio::time::sleep(config.kill_verify_delay).await;

        let outcome = if inspector.is_alive(pid) {
            warn!(%id, pid, "worker process still alive after force kill");
            TerminationOutcome::StillAlive
        } else {
            debug!(%id, pid, "worker process force-killed");
            TerminationOutcome::ForceKilled
        };
        TerminationReport {
            outcome,
            close_error,
        }
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let manager = LifecycleManager { inner };
                manager.cleanup_cycle().await;

                // Exits on its own instead of being aborted mid-cycle.
                let mut registry = manager.inner.registry.lock().await;
                if registry.workers.is_empty() {
                    registry.monitor = None;
                    debug!("registry empty; worker monitoring stopped");
                    break;
                }
            }
        })
    }
}

async fn watch_disconnect(inner: Weak<LifecycleInner>, id: WorkerId, worker: Arc<dyn Worker>) {
    worker.disconnected().await;
    let Some(inner) = inner.upgrade() else { return };
    let mut registry = inner.registry.lock().await;
    if let Some(entry) = registry.workers.get_mut(&id) {
        if entry.connected && !entry.terminating {
            entry.connected = false;
            drop(registry);
            info!(%id, "worker disconnected");
            inner.events.emit(GovernorEvent::WorkerDisconnected(id));
        }
    }
}

impl Drop for LifecycleInner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        if let Some(monitor) = registry.monitor.take() {
            monitor.abort();
        }
        for (id, entry) in registry.workers.drain() {
            entry.watcher.abort();
            let Some(pid) = entry.pid else { continue };
            if !self.inspector.is_alive(pid) {
                continue;
            }
            match self.inspector.kill(pid) {
                Ok(()) => warn!(%id, pid, "force-killed worker still registered at teardown"),
                Err(err) => warn!(%id, pid, error = %err, "failed to kill worker at teardown"),
            }
        }
    }
}
