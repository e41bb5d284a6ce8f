#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pagegov_lib::metrics::sampler::MemoryReading;
use pagegov_lib::{
    GovernorConfig, GovernorError, ProcessInfo, ProcessInspector, ProcessSignature, Result,
    SystemProbe, Worker, WorkerFactory,
};
use tokio::sync::watch;

/// In-memory process table shared by fake workers and the reaper.
#[derive(Default)]
pub struct FakeProcessTable {
    processes: Mutex<BTreeMap<u32, ProcessInfo>>,
    failing_kills: Mutex<HashSet<u32>>,
}

impl FakeProcessTable {
    pub fn spawn(&self, pid: u32, command_line: &str) {
        self.spawn_child(pid, None, command_line);
    }

    pub fn spawn_child(&self, pid: u32, parent: Option<u32>, command_line: &str) {
        let name = command_line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        self.processes.lock().unwrap().insert(
            pid,
            ProcessInfo {
                pid,
                parent,
                name,
                command_line: command_line.to_string(),
            },
        );
    }

    /// Simulates the process dying outside the governor's control.
    pub fn kill_externally(&self, pid: u32) {
        self.processes.lock().unwrap().remove(&pid);
    }

    pub fn refuse_kill(&self, pid: u32) {
        self.failing_kills.lock().unwrap().insert(pid);
    }
}

impl ProcessInspector for FakeProcessTable {
    fn list_by_signature(&self, signature: &ProcessSignature) -> Result<Vec<ProcessInfo>> {
        Ok(self
            .processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| signature.matches(&p.name, &p.command_line))
            .cloned()
            .collect())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.kill(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        if self.failing_kills.lock().unwrap().contains(&pid) {
            return Err(GovernorError::Process(format!("EPERM for {pid}")));
        }
        self.kill_externally(pid);
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().unwrap().contains_key(&pid)
    }

    fn parent_of(&self, pid: u32) -> Option<u32> {
        self.processes.lock().unwrap().get(&pid).and_then(|p| p.parent)
    }
}

/// Worker whose process lives in a [`FakeProcessTable`].
pub struct TableWorker {
    pid: u32,
    table: Arc<FakeProcessTable>,
    fail_close: bool,
    connected: watch::Sender<bool>,
}

impl TableWorker {
    pub fn new(table: &Arc<FakeProcessTable>, pid: u32) -> Self {
        table.spawn(pid, &format!("chrome --headless --user-data-dir=/tmp/pagegov-profile-{pid}"));
        Self {
            pid,
            table: table.clone(),
            fail_close: false,
            connected: watch::channel(true).0,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait]
impl Worker for TableWorker {
    fn is_connected(&self) -> bool {
        *self.connected.borrow() && self.table.is_alive(self.pid)
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn close(&self) -> Result<()> {
        if self.fail_close {
            return Err(GovernorError::worker("protocol error: target closed"));
        }
        self.table.kill_externally(self.pid);
        self.connected.send_replace(false);
        Ok(())
    }
}

/// Factory handing out [`TableWorker`]s with increasing pids.
pub struct TableFactory {
    table: Arc<FakeProcessTable>,
    next_pid: AtomicUsize,
    pub spawned: AtomicUsize,
    pub offline: AtomicBool,
}

impl TableFactory {
    pub fn new(table: Arc<FakeProcessTable>) -> Self {
        Self {
            table,
            next_pid: AtomicUsize::new(40_000),
            spawned: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl WorkerFactory for TableFactory {
    async fn spawn(&self) -> Result<Arc<dyn Worker>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GovernorError::Spawn("engine unavailable".to_string()));
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(Arc::new(TableWorker::new(&self.table, pid)))
    }
}

/// Probe returning whatever the test last set. Reports a 16 GiB host whose
/// governed processes use `footprint_mb`.
#[derive(Clone)]
pub struct DialProbe {
    values: Arc<Mutex<(f64, f64, f64)>>,
    footprint_mb: Arc<Mutex<u64>>,
}

impl DialProbe {
    pub fn new(memory: f64, cpu: f64, disk: f64) -> Self {
        Self {
            values: Arc::new(Mutex::new((memory, cpu, disk))),
            footprint_mb: Arc::new(Mutex::new(512)),
        }
    }

    pub fn set(&self, memory: f64, cpu: f64, disk: f64) {
        *self.values.lock().unwrap() = (memory, cpu, disk);
    }

    pub fn set_footprint_mb(&self, footprint_mb: u64) {
        *self.footprint_mb.lock().unwrap() = footprint_mb;
    }
}

impl SystemProbe for DialProbe {
    fn memory(&mut self) -> Result<MemoryReading> {
        Ok(MemoryReading {
            used_ratio: self.values.lock().unwrap().0,
            total_mb: 16 * 1024,
        })
    }

    fn begin_cpu_window(&mut self) -> Result<()> {
        Ok(())
    }

    fn cpu_usage(&mut self) -> Result<f64> {
        Ok(self.values.lock().unwrap().1)
    }

    fn disk_usage(&mut self) -> Result<f64> {
        Ok(self.values.lock().unwrap().2)
    }

    fn process_memory_mb(&mut self, _worker_pids: &[u32]) -> Result<u64> {
        Ok(*self.footprint_mb.lock().unwrap())
    }
}

/// Config with short timers and the host-facing parts switched off.
pub fn test_config() -> GovernorConfig {
    let mut config = GovernorConfig::new();
    config.sampling.cpu_window = Duration::ZERO;
    config.lifecycle.kill_verify_delay = Duration::from_millis(20);
    config.lifecycle.close_timeout = Duration::from_secs(1);
    config.reaper.settle_delay = Duration::from_millis(20);
    config.cleanup.enabled = false;
    config.cleanup.directories = vec![std::env::temp_dir().join("pagegov-it-absent")];
    config
}
