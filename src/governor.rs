//! The governor: one explicitly constructed instance that ties sampling,
//! pressure, degradation, quotas and the worker lifecycle together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupReport, CleanupScheduler};
use crate::config::GovernorConfig;
use crate::degradation::{DegradationController, DegradationState};
use crate::events::{EventBus, GovernorEvent, DEFAULT_EVENT_CAPACITY};
use crate::lifecycle::{
    CleanupCycleReport, CommandWorkerFactory, CommandWorkerOptions, EmergencyCleanupReport,
    LifecycleManager, Worker, WorkerFactory, WorkerId, WorkerInfo,
};
use crate::metrics::pressure::{critical_dimensions, PressureTracker, PressureVector};
use crate::metrics::sampler::{MetricsSampler, SysinfoProbe, SystemProbe};
use crate::metrics::ResourceMetrics;
use crate::optimizer::PoolSizeOptimizer;
use crate::quota::{self, QuotaEnforcer, QuotaViolations, ReclaimHook};
use crate::reaper::{OrphanReaper, ProcessInspector, SweepReport, SysinfoInspector};
use crate::{GovernorError, Result};

/// Outcome of a non-blocking admission attempt.
pub enum Admission {
    Ready(WorkerLease),
    /// No worker is free and the pool is at its target size.
    Wait,
    Reject(GovernorError),
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Admission::Ready(lease) => f.debug_tuple("Ready").field(lease).finish(),
            Admission::Wait => f.write_str("Wait"),
            Admission::Reject(err) => f.debug_tuple("Reject").field(err).finish(),
        }
    }
}

/// Exclusive use of a pooled worker for one request.
///
/// Hand it back with [`Governor::release`]. A lease that is simply dropped is
/// released in the background.
pub struct WorkerLease {
    id: WorkerId,
    worker: Arc<dyn Worker>,
    governor: Weak<GovernorInner>,
    returned: bool,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("id", &self.id)
            .field("pid", &self.worker.process_id())
            .field("returned", &self.returned)
            .finish()
    }
}

impl WorkerLease {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let Some(inner) = self.governor.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            return;
        };
        let (id, worker) = (self.id, self.worker.clone());
        runtime.spawn(release_worker(inner, id, worker));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStatus {
    pub worker_count: usize,
    pub active_requests: usize,
    pub target_pool_size: usize,
    pub metrics: Option<ResourceMetrics>,
    pub pressure: PressureVector,
    pub degradation: DegradationState,
    pub quota: QuotaViolations,
    pub workers: Vec<WorkerInfo>,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceCleanupReport {
    pub workers: CleanupCycleReport,
    pub temp_files: CleanupReport,
}

#[derive(Debug)]
struct PolicyState {
    tracker: PressureTracker,
    pressured_ticks: u32,
    clear_ticks: u32,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<WorkerId>,
}

struct GovernorInner {
    config: GovernorConfig,
    events: EventBus,
    sampler: AsyncMutex<MetricsSampler>,
    latest: Mutex<Option<ResourceMetrics>>,
    policy: Mutex<PolicyState>,
    optimizer: PoolSizeOptimizer,
    degradation: Arc<DegradationController>,
    quota: QuotaEnforcer,
    lifecycle: LifecycleManager,
    reaper: OrphanReaper,
    cleanup: Arc<CleanupScheduler>,
    factory: Arc<dyn WorkerFactory>,
    pool: Mutex<PoolState>,
    spawn_gate: AsyncMutex<()>,
    in_flight: AtomicUsize,
    /// Callers blocked in `acquire`; counted as demand when sizing the pool.
    pending: AtomicUsize,
    target: AtomicUsize,
    released: Notify,
    started: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for GovernorInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Builds a [`Governor`]; every collaborator has a production default.
pub struct GovernorBuilder {
    config: GovernorConfig,
    probe: Option<Box<dyn SystemProbe>>,
    inspector: Option<Arc<dyn ProcessInspector>>,
    factory: Option<Arc<dyn WorkerFactory>>,
    reclaim_hook: Option<ReclaimHook>,
    event_capacity: usize,
}

impl GovernorBuilder {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            probe: None,
            inspector: None,
            factory: None,
            reclaim_hook: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn probe(mut self, probe: Box<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn ProcessInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.reclaim_hook = Some(hook);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Governor> {
        let config = self.config;
        config.validate()?;

        let events = EventBus::new(self.event_capacity);
        let inspector: Arc<dyn ProcessInspector> = self
            .inspector
            .unwrap_or_else(|| Arc::new(SysinfoInspector::new()));
        let probe = self.probe.unwrap_or_else(|| {
            let disk_path = config
                .cleanup
                .resolved_directories()
                .into_iter()
                .next()
                .unwrap_or_else(std::env::temp_dir);
            Box::new(SysinfoProbe::for_path(disk_path))
        });
        let factory: Arc<dyn WorkerFactory> = self.factory.unwrap_or_else(|| {
            Arc::new(CommandWorkerFactory::new(
                CommandWorkerOptions::chromium(),
                inspector.clone(),
            ))
        });

        let degradation = Arc::new(DegradationController::new(events.clone()));
        let mut quota = QuotaEnforcer::new(
            config.limits,
            config.degradation.enabled,
            degradation.clone(),
            events.clone(),
        );
        if let Some(hook) = self.reclaim_hook {
            quota = quota.with_reclaim_hook(hook);
        }
        let optimizer = PoolSizeOptimizer::new(config.pool.clone());
        let initial_target = optimizer
            .min_pool_size()
            .min(config.limits.max_worker_instances);

        let inner = GovernorInner {
            sampler: AsyncMutex::new(MetricsSampler::new(probe, &config.sampling)),
            latest: Mutex::new(None),
            policy: Mutex::new(PolicyState {
                tracker: PressureTracker::new(config.thresholds),
                pressured_ticks: 0,
                clear_ticks: 0,
            }),
            optimizer,
            quota,
            lifecycle: LifecycleManager::new(
                config.lifecycle.clone(),
                inspector.clone(),
                events.clone(),
            ),
            reaper: OrphanReaper::new(inspector, &config.reaper),
            cleanup: Arc::new(CleanupScheduler::new(
                &config.cleanup,
                &config.limits,
                events.clone(),
            )?),
            factory,
            degradation,
            pool: Mutex::new(PoolState::default()),
            spawn_gate: AsyncMutex::new(()),
            in_flight: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            target: AtomicUsize::new(initial_target),
            released: Notify::new(),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            events,
            config,
        };
        Ok(Governor {
            inner: Arc::new(inner),
        })
    }
}

/// Adaptive resource governor for a pool of rendering workers.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Governor {
    inner: Arc<GovernorInner>,
}

impl Governor {
    /// Build with production collaborators.
    pub fn new(config: GovernorConfig) -> Result<Self> {
        GovernorBuilder::new(config).build()
    }

    pub fn builder(config: GovernorConfig) -> GovernorBuilder {
        GovernorBuilder::new(config)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    pub fn degradation(&self) -> DegradationState {
        self.inner.degradation.state()
    }

    pub fn degradation_controller(&self) -> &Arc<DegradationController> {
        &self.inner.degradation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernorEvent> {
        self.inner.events.subscribe()
    }

    pub fn latest_metrics(&self) -> Option<ResourceMetrics> {
        *lock(&self.inner.latest)
    }

    pub fn pressure(&self) -> PressureVector {
        lock(&self.inner.policy).tracker.current()
    }

    pub fn target_pool_size(&self) -> usize {
        self.inner.target.load(Ordering::Acquire)
    }

    pub fn active_requests(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Callers currently waiting in [`Governor::acquire`].
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Start the sampling loop (first sample immediately) and, when enabled,
    /// the temp cleanup loop. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) || self.is_shutting_down() {
            return;
        }
        let mut tasks = lock(&self.inner.tasks);
        tasks.push(self.spawn_sampling_loop());

        if self.inner.config.cleanup.enabled {
            let weak = Arc::downgrade(&self.inner);
            let disk_pressure = move || {
                weak.upgrade()
                    .is_some_and(|inner| lock(&inner.policy).tracker.current().disk)
            };
            tasks.push(
                self.inner
                    .cleanup
                    .clone()
                    .spawn_periodic(disk_pressure, self.inner.cancel.clone()),
            );
        }
        info!(
            interval = ?self.inner.config.sampling.interval,
            "governor started"
        );
    }

    fn spawn_sampling_loop(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.sampling.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        Governor { inner }.tick().await;
                    }
                }
            }
            debug!("sampling loop stopped");
        })
    }

    /// Take one sample and apply the governance policy to it.
    pub async fn tick(&self) -> ResourceMetrics {
        let workers = self.inner.lifecycle.worker_count().await;
        let pids: Vec<u32> = self.inner.lifecycle.live_pids().await.into_iter().collect();
        let active = self.active_requests() + self.pending_requests();
        let metrics = self
            .inner
            .sampler
            .lock()
            .await
            .sample(workers, active, &pids)
            .await;
        *lock(&self.inner.latest) = Some(metrics);
        self.inner.events.emit(GovernorEvent::MetricsSampled(metrics));
        self.apply(&metrics).await;
        metrics
    }

    async fn apply(&self, metrics: &ResourceMetrics) {
        let inner = &self.inner;
        let config = &inner.config;

        let (previous, pressure, pressured_ticks, clear_ticks) = {
            let mut policy = lock(&inner.policy);
            let previous = policy.tracker.current();
            let pressure = policy.tracker.observe(metrics);
            if pressure.overall {
                policy.pressured_ticks = policy.pressured_ticks.saturating_add(1);
                policy.clear_ticks = 0;
            } else {
                policy.clear_ticks = policy.clear_ticks.saturating_add(1);
                policy.pressured_ticks = 0;
            }
            (previous, pressure, policy.pressured_ticks, policy.clear_ticks)
        };

        if pressure != previous {
            if pressure.overall {
                warn!(?pressure, "resource pressure changed");
            } else {
                info!("resource pressure cleared");
            }
            inner.events.emit(GovernorEvent::PressureChanged {
                pressure,
                metrics: *metrics,
            });
        }

        let violations = quota::check(metrics, &config.limits);
        if config.degradation.enabled && pressure.overall {
            inner.degradation.enable_request_throttling();
            if critical_dimensions(metrics, &config.thresholds).any() {
                inner.degradation.enable_quality_reduction();
            }
            if pressured_ticks >= config.degradation.sustained_samples {
                inner.degradation.disable_non_essential_features();
                inner.degradation.request_pool_shrink();
            }
        } else if !pressure.overall
            && !violations.any()
            && clear_ticks >= config.degradation.recovery_samples
            && inner.degradation.is_degraded()
        {
            inner.degradation.reset_degradation();
        }

        inner.quota.observe(metrics);
        self.resize(metrics).await;
    }

    async fn resize(&self, metrics: &ResourceMetrics) {
        let inner = &self.inner;
        let max_workers = inner.config.limits.max_worker_instances;
        let mut target = inner.optimizer.optimal(metrics).min(max_workers);
        if inner.degradation.take_pool_shrink_request() {
            let floor = inner.optimizer.min_pool_size().min(max_workers);
            target = target.saturating_sub(1).max(floor);
        }

        let previous = inner.target.swap(target, Ordering::AcqRel);
        if previous != target {
            info!(from = previous, to = target, "pool target resized");
            inner.events.emit(GovernorEvent::PoolResized {
                from: previous,
                to: target,
            });
            if target > previous {
                inner.released.notify_waiters();
            }
        }

        let registered = inner.lifecycle.worker_count().await;
        let excess: Vec<WorkerId> = {
            let mut pool = lock(&inner.pool);
            let surplus = registered.saturating_sub(target).min(pool.idle.len());
            pool.idle.drain(..surplus).collect()
        };
        if !excess.is_empty() {
            debug!(count = excess.len(), target, "dismissing idle workers above target");
            join_all(excess.into_iter().map(|id| inner.lifecycle.unregister(id))).await;
        }
    }

    /// Largest number of requests admitted at once right now.
    pub fn admission_limit(&self) -> usize {
        let max = self.inner.config.limits.max_concurrent_requests;
        if self.inner.degradation.is_request_throttling_enabled() {
            (max / 2).max(1)
        } else {
            max
        }
    }

    /// Non-blocking admission.
    pub async fn try_acquire(&self) -> Admission {
        let inner = &self.inner;
        if self.is_shutting_down() {
            return Admission::Reject(GovernorError::ShuttingDown);
        }
        let limit = self.admission_limit();
        if let Err(current) =
            inner
                .in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
        {
            debug!(in_flight = current, limit, "request rejected");
            return Admission::Reject(GovernorError::capacity(format!(
                "{} requests in flight (limit {})",
                current, limit
            )));
        }

        match self.checkout().await {
            Ok(Some(lease)) => Admission::Ready(lease),
            Ok(None) => {
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                Admission::Wait
            }
            Err(err) => {
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                warn!(error = %err, "worker checkout failed");
                Admission::Reject(err)
            }
        }
    }

    /// Wait for a worker up to `pool.acquire_timeout`.
    pub async fn acquire(&self) -> Result<WorkerLease> {
        let wait = self.inner.config.pool.acquire_timeout;
        let deadline = Instant::now() + wait;
        loop {
            // Registered before the attempt so a release in between is not missed.
            let released = self.inner.released.notified();
            match self.try_acquire().await {
                Admission::Ready(lease) => return Ok(lease),
                Admission::Reject(err) => return Err(err),
                Admission::Wait => {
                    let _pending = PendingGuard::enter(&self.inner.pending);
                    if timeout_at(deadline, released).await.is_err() {
                        return Err(GovernorError::capacity(format!(
                            "no worker became available within {:?}",
                            wait
                        )));
                    }
                }
            }
        }
    }

    /// Return a leased worker to the pool.
    pub async fn release(&self, mut lease: WorkerLease) {
        lease.returned = true;
        release_worker(self.inner.clone(), lease.id, lease.worker.clone()).await;
    }

    async fn checkout(&self) -> Result<Option<WorkerLease>> {
        let inner = &self.inner;
        loop {
            let next = lock(&inner.pool).idle.pop_front();
            let Some(id) = next else { break };
            if let Some(worker) = inner.lifecycle.usable(id).await {
                inner.lifecycle.mark_in_use(id, true).await;
                return Ok(Some(self.lease(id, worker)));
            }
            // Frees the slot so a replacement can be spawned below.
            debug!(%id, "dismissing unusable idle worker");
            inner.lifecycle.unregister(id).await;
        }

        let _gate = inner.spawn_gate.lock().await;
        if inner.lifecycle.worker_count().await >= self.target_pool_size() {
            return Ok(None);
        }
        let worker = inner.factory.spawn().await?;
        let id = inner.lifecycle.register(worker.clone()).await;
        if self.is_shutting_down() {
            inner.lifecycle.unregister(id).await;
            return Err(GovernorError::ShuttingDown);
        }
        inner.lifecycle.mark_in_use(id, true).await;
        Ok(Some(self.lease(id, worker)))
    }

    fn lease(&self, id: WorkerId, worker: Arc<dyn Worker>) -> WorkerLease {
        WorkerLease {
            id,
            worker,
            governor: Arc::downgrade(&self.inner),
            returned: false,
        }
    }

    pub async fn status(&self) -> GovernorStatus {
        let inner = &self.inner;
        GovernorStatus {
            worker_count: inner.lifecycle.worker_count().await,
            active_requests: self.active_requests(),
            target_pool_size: self.target_pool_size(),
            metrics: self.latest_metrics(),
            pressure: self.pressure(),
            degradation: self.degradation(),
            quota: inner.quota.last_violations(),
            workers: inner.lifecycle.workers().await,
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Run a worker cleanup cycle and a temp cleanup pass right now.
    pub async fn force_cleanup(&self) -> ForceCleanupReport {
        let workers = self.inner.lifecycle.run_cleanup_cycle().await;
        let temp_files = self.inner.cleanup.run(self.pressure().disk).await;
        ForceCleanupReport {
            workers,
            temp_files,
        }
    }

    /// Kill matching processes that are not registered workers.
    pub async fn sweep_orphans(&self) -> SweepReport {
        let spared = self.inner.lifecycle.live_pids().await;
        let report = self.inner.reaper.sweep_excluding(&spared).await;
        self.inner
            .events
            .emit(GovernorEvent::OrphansSwept(report.clone()));
        report
    }

    /// Stop timers, then terminate every worker within `shutdown_timeout`.
    /// Only the first call does any work.
    pub async fn shutdown(&self) -> Result<EmergencyCleanupReport> {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(EmergencyCleanupReport::default());
        }
        info!("governor shutting down");
        inner.cancel.cancel();
        for task in lock(&inner.tasks).drain(..) {
            task.abort();
        }
        lock(&inner.pool).idle.clear();
        inner.released.notify_waiters();

        let limit = inner.config.shutdown_timeout;
        match timeout(limit, inner.lifecycle.emergency_cleanup()).await {
            Ok(report) => {
                info!(
                    terminated = report.terminated,
                    errors = report.errors.len(),
                    "governor shut down"
                );
                Ok(report)
            }
            Err(_) => {
                let removed = inner.lifecycle.force_remove_all().await;
                warn!(removed, "shutdown timed out; force-killed remaining workers");
                Err(GovernorError::Timeout(format!(
                    "worker termination did not finish within {:?}",
                    limit
                )))
            }
        }
    }

    /// Shut down on Ctrl-C or SIGTERM.
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            let Some(inner) = weak.upgrade() else { return };
            warn!("termination signal received");
            if let Err(err) = (Governor { inner }).shutdown().await {
                warn!(error = %err, "shutdown after signal was incomplete");
            }
        })
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn release_worker(inner: Arc<GovernorInner>, id: WorkerId, worker: Arc<dyn Worker>) {
    let lifecycle = &inner.lifecycle;
    let known = lifecycle.mark_in_use(id, false).await;
    let keep = known
        && worker.is_connected()
        && !inner.shutting_down.load(Ordering::Acquire)
        && lifecycle.worker_count().await <= inner.target.load(Ordering::Acquire);
    if keep {
        lock(&inner.pool).idle.push_back(id);
    }
    inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    inner.released.notify_waiters();
    if known && !keep {
        debug!(%id, "dismissing released worker");
        lifecycle.unregister(id).await;
    }
}

async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
