mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{test_config, DialProbe, FakeProcessTable, TableFactory};
use pagegov_lib::events::drain;
use pagegov_lib::{
    Admission, Governor, GovernorConfig, GovernorError, GovernorEvent, ProcessInspector,
};

struct Rig {
    governor: Governor,
    probe: DialProbe,
    table: Arc<FakeProcessTable>,
    factory: Arc<TableFactory>,
}

fn rig(config: GovernorConfig) -> Rig {
    let probe = DialProbe::new(0.3, 0.2, 0.1);
    let table = Arc::new(FakeProcessTable::default());
    let factory = Arc::new(TableFactory::new(table.clone()));
    let governor = Governor::builder(config)
        .probe(Box::new(probe.clone()))
        .inspector(table.clone())
        .factory(factory.clone())
        .build()
        .expect("build governor");
    Rig {
        governor,
        probe,
        table,
        factory,
    }
}

#[tokio::test]
async fn requests_share_one_worker_when_load_is_low() {
    let rig = rig(test_config());
    rig.governor.tick().await;

    for _ in 0..3 {
        let lease = rig.governor.acquire().await.expect("lease");
        rig.governor.release(lease).await;
    }
    assert_eq!(rig.factory.spawned.load(Ordering::SeqCst), 1);
    assert_eq!(rig.governor.active_requests(), 0);
}

#[tokio::test]
async fn waiting_demand_grows_the_pool() {
    let mut config = test_config();
    config.pool.requests_per_worker = 1;
    let rig = rig(config);

    let first = rig.governor.acquire().await.expect("first lease");
    rig.governor.tick().await;
    assert_eq!(rig.governor.target_pool_size(), 1);

    let waiter = tokio::spawn({
        let governor = rig.governor.clone();
        async move { governor.acquire().await }
    });
    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.governor.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("second caller should be waiting");

    // One leased plus one waiting sizes the pool to two workers.
    rig.governor.tick().await;
    assert_eq!(rig.governor.target_pool_size(), 2);
    let second = waiter.await.expect("join").expect("second lease");
    assert_ne!(second.id(), first.id());
    assert_eq!(rig.factory.spawned.load(Ordering::SeqCst), 2);

    rig.governor.release(first).await;
    rig.governor.release(second).await;
    assert_eq!(rig.governor.active_requests(), 0);
}

#[tokio::test]
async fn sustained_pressure_throttles_admission() {
    let mut config = test_config();
    config.limits.max_concurrent_requests = 4;
    let rig = rig(config);
    let mut rx = rig.governor.subscribe();

    rig.probe.set(0.85, 0.2, 0.1);
    for _ in 0..3 {
        rig.governor.tick().await;
    }
    let state = rig.governor.degradation();
    assert!(state.throttling_enabled);
    assert!(state.non_essential_disabled);
    assert!(!state.quality_reduced);
    assert_eq!(rig.governor.admission_limit(), 2);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, GovernorEvent::PressureChanged { pressure, .. } if pressure.memory)));
    assert!(events.contains(&GovernorEvent::PoolShrinkRequested));

    rig.probe.set(0.3, 0.2, 0.1);
    for _ in 0..3 {
        rig.governor.tick().await;
    }
    assert!(!rig.governor.degradation_controller().is_degraded());
    assert_eq!(rig.governor.admission_limit(), 4);
}

#[tokio::test]
async fn memory_quota_breach_invokes_reclaim_hook() {
    let config = test_config();
    let probe = DialProbe::new(0.3, 0.2, 0.1);
    probe.set_footprint_mb(5000);
    let table = Arc::new(FakeProcessTable::default());
    let reclaims = Arc::new(AtomicUsize::new(0));
    let counter = reclaims.clone();
    let governor = Governor::builder(config)
        .probe(Box::new(probe))
        .inspector(table.clone())
        .factory(Arc::new(TableFactory::new(table)))
        .reclaim_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .expect("build governor");

    // 5000 MB of governed processes is above the default 4096 MB quota.
    governor.tick().await;
    assert_eq!(reclaims.load(Ordering::SeqCst), 1);
    assert!(governor.status().await.quota.memory);
}

#[tokio::test]
async fn busy_host_with_a_small_footprint_is_within_quota() {
    let rig = rig(test_config());
    let mut rx = rig.governor.subscribe();
    rig.probe.set(0.85, 0.2, 0.2);

    let metrics = rig.governor.tick().await;

    assert_eq!(metrics.memory_total_mb, 16 * 1024);
    assert!(!pagegov_lib::quota::violates(&metrics, &test_config().limits));
    let status = rig.governor.status().await;
    assert!(status.pressure.memory);
    assert!(!status.quota.any());
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, GovernorEvent::QuotaViolated(_))));
}

#[tokio::test]
async fn calm_host_recovers_from_degradation() {
    let rig = rig(test_config());
    rig.probe.set(0.85, 0.2, 0.2);
    rig.governor.tick().await;
    assert!(rig.governor.degradation().throttling_enabled);

    rig.probe.set(0.55, 0.2, 0.2);
    for _ in 0..10 {
        rig.governor.tick().await;
    }

    let status = rig.governor.status().await;
    assert!(!status.pressure.overall);
    assert!(!status.quota.any());
    assert!(!status.degradation.throttling_enabled);
    assert!(!rig.governor.degradation_controller().take_pool_shrink_request());
}

#[tokio::test]
async fn concurrency_limit_is_a_capacity_rejection() {
    let mut config = test_config();
    config.limits.max_concurrent_requests = 1;
    let rig = rig(config);

    let lease = rig.governor.acquire().await.expect("lease");
    let err = rig.governor.acquire().await.expect_err("second request rejected");
    assert!(err.is_capacity_rejection());
    rig.governor.release(lease).await;
}

#[tokio::test]
async fn spawn_failures_surface_as_errors() {
    let rig = rig(test_config());
    rig.factory.offline.store(true, Ordering::SeqCst);

    let err = rig.governor.acquire().await.expect_err("spawn should fail");
    assert!(matches!(err, GovernorError::Spawn(_)));
    assert_eq!(rig.governor.active_requests(), 0);
}

#[tokio::test]
async fn dead_worker_is_replaced_on_next_acquire() {
    let rig = rig(test_config());
    let lease = rig.governor.acquire().await.expect("lease");
    let pid = lease.worker().process_id().expect("pid");
    rig.governor.release(lease).await;

    rig.table.kill_externally(pid);
    let next = rig.governor.acquire().await.expect("replacement lease");
    assert_ne!(next.worker().process_id(), Some(pid));
    rig.governor.release(next).await;
}

#[tokio::test]
async fn force_cleanup_retires_dead_workers() {
    let rig = rig(test_config());
    let lease = rig.governor.acquire().await.expect("lease");
    let pid = lease.worker().process_id().expect("pid");
    rig.governor.release(lease).await;
    rig.table.kill_externally(pid);

    let report = rig.governor.force_cleanup().await;
    assert_eq!(report.workers.cleaned, 1);
    assert_eq!(report.workers.remaining, 0);
}

#[tokio::test]
async fn sweep_orphans_leaves_pooled_workers_alone() {
    let rig = rig(test_config());
    let lease = rig.governor.acquire().await.expect("lease");
    let pooled = lease.worker().process_id().expect("pid");
    rig.governor.release(lease).await;
    rig.table.spawn(7, "headless_shell --remote-debugging-pipe");

    let report = rig.governor.sweep_orphans().await;
    assert_eq!(report.found, 1);
    assert!(rig.table.is_alive(pooled));
    assert!(!rig.table.is_alive(7));
}

#[tokio::test]
async fn sweep_orphans_spares_the_process_tree_of_pooled_workers() {
    let rig = rig(test_config());
    let lease = rig.governor.acquire().await.expect("lease");
    let pooled = lease.worker().process_id().expect("pid");
    let profile = format!("--user-data-dir=/tmp/pagegov-profile-{pooled}");
    rig.table
        .spawn_child(pooled + 10_000, Some(pooled), "chrome --type=zygote");
    rig.table.spawn_child(
        pooled + 10_001,
        Some(pooled + 10_000),
        &format!("chrome --type=renderer {profile}"),
    );
    rig.table.spawn_child(
        pooled + 10_002,
        Some(pooled),
        &format!("chrome --type=gpu-process {profile}"),
    );
    rig.table
        .spawn_child(9, Some(1), "chrome --type=renderer --user-data-dir=/tmp/crashed");

    let report = rig.governor.sweep_orphans().await;

    assert_eq!(report.found, 1);
    assert!(!rig.table.is_alive(9));
    for pid in [pooled, pooled + 10_000, pooled + 10_001, pooled + 10_002] {
        assert!(rig.table.is_alive(pid), "pid {pid} was killed");
    }
    assert!(lease.worker().is_connected());
    rig.governor.release(lease).await;
}

#[tokio::test]
async fn shutdown_terminates_every_worker_and_closes_admission() {
    let mut config = test_config();
    config.pool.min_pool_size = 3;
    config.pool.max_pool_size = 3;
    let rig = rig(config);
    rig.governor.start();

    let mut pids = Vec::new();
    let mut leases = Vec::new();
    for _ in 0..3 {
        let lease = rig.governor.acquire().await.expect("lease");
        pids.push(lease.worker().process_id().expect("pid"));
        leases.push(lease);
    }

    let report = rig.governor.shutdown().await.expect("clean shutdown");
    assert_eq!(report.terminated, 3);
    assert!(report.errors.is_empty());
    for pid in pids {
        assert!(!rig.table.is_alive(pid));
    }
    assert!(matches!(
        rig.governor.acquire().await,
        Err(GovernorError::ShuttingDown)
    ));

    for lease in leases {
        rig.governor.release(lease).await;
    }
    let status = rig.governor.status().await;
    assert!(status.shutting_down);
    assert_eq!(status.worker_count, 0);
    assert_eq!(status.active_requests, 0);
}

#[tokio::test]
async fn started_governor_samples_on_its_own() {
    let mut config = test_config();
    config.sampling.interval = Duration::from_millis(20);
    let rig = rig(config);
    rig.governor.start();
    rig.governor.start();

    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.governor.latest_metrics().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sampling loop should produce a sample");
    rig.governor.shutdown().await.expect("shutdown");
}
