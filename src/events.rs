//! Typed governor notifications over a bounded broadcast channel.
//!
//! Slow subscribers lose the oldest events (`RecvError::Lagged`); emitters never block.

use tokio::sync::broadcast;

use crate::cleanup::CleanupReport;
use crate::degradation::DegradationFlag;
use crate::lifecycle::{TerminationOutcome, WorkerId};
use crate::metrics::pressure::PressureVector;
use crate::metrics::ResourceMetrics;
use crate::quota::QuotaViolations;
use crate::reaper::SweepReport;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum GovernorEvent {
    MetricsSampled(ResourceMetrics),
    PressureChanged {
        pressure: PressureVector,
        metrics: ResourceMetrics,
    },
    DegradationRaised(DegradationFlag),
    DegradationReset,
    PoolShrinkRequested,
    PoolResized {
        from: usize,
        to: usize,
    },
    QuotaViolated(QuotaViolations),
    MemoryReclaimRequested,
    WorkerRegistered {
        id: WorkerId,
        pid: Option<u32>,
    },
    WorkerDisconnected(WorkerId),
    WorkerUnregistered {
        id: WorkerId,
        outcome: TerminationOutcome,
    },
    CleanupPerformed {
        cleaned: usize,
        remaining: usize,
    },
    TempFilesCleaned(CleanupReport),
    OrphansSwept(SweepReport),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GovernorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: GovernorEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Drain whatever is buffered for `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<GovernorEvent>) -> Vec<GovernorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
