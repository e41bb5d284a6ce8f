//! Graceful degradation flags.
//!
//! Flags only rise while pressure lasts; clearing is an explicit
//! [`DegradationController::reset_degradation`] decided by the governor.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::{EventBus, GovernorEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradationFlag {
    RequestThrottling,
    QualityReduction,
    NonEssentialDisabled,
}

/// Snapshot read by request admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationState {
    pub throttling_enabled: bool,
    pub quality_reduced: bool,
    pub non_essential_disabled: bool,
}

impl DegradationState {
    /// Number of raised flags: 0 is normal service, 3 is maximal degradation.
    pub fn level(&self) -> u8 {
        self.throttling_enabled as u8 + self.quality_reduced as u8 + self.non_essential_disabled as u8
    }
}

#[derive(Debug)]
pub struct DegradationController {
    throttling: AtomicBool,
    quality_reduced: AtomicBool,
    non_essential_disabled: AtomicBool,
    shrink_requested: AtomicBool,
    events: EventBus,
}

impl DegradationController {
    pub fn new(events: EventBus) -> Self {
        Self {
            throttling: AtomicBool::new(false),
            quality_reduced: AtomicBool::new(false),
            non_essential_disabled: AtomicBool::new(false),
            shrink_requested: AtomicBool::new(false),
            events,
        }
    }

    pub fn state(&self) -> DegradationState {
        DegradationState {
            throttling_enabled: self.throttling.load(Ordering::Acquire),
            quality_reduced: self.quality_reduced.load(Ordering::Acquire),
            non_essential_disabled: self.non_essential_disabled.load(Ordering::Acquire),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.state().level() > 0
    }

    pub fn enable_request_throttling(&self) {
        self.raise(&self.throttling, DegradationFlag::RequestThrottling);
    }

    pub fn is_request_throttling_enabled(&self) -> bool {
        self.throttling.load(Ordering::Acquire)
    }

    pub fn enable_quality_reduction(&self) {
        self.raise(&self.quality_reduced, DegradationFlag::QualityReduction);
    }

    pub fn is_quality_reduced(&self) -> bool {
        self.quality_reduced.load(Ordering::Acquire)
    }

    pub fn disable_non_essential_features(&self) {
        self.raise(
            &self.non_essential_disabled,
            DegradationFlag::NonEssentialDisabled,
        );
    }

    pub fn are_non_essential_features_disabled(&self) -> bool {
        self.non_essential_disabled.load(Ordering::Acquire)
    }

    /// Record the intent to shrink the pool; the lifecycle side performs it.
    pub fn request_pool_shrink(&self) {
        if !self.shrink_requested.swap(true, Ordering::AcqRel) {
            info!("pool shrink requested");
            self.events.emit(GovernorEvent::PoolShrinkRequested);
        }
    }

    /// Consume a pending shrink intent.
    pub fn take_pool_shrink_request(&self) -> bool {
        self.shrink_requested.swap(false, Ordering::AcqRel)
    }

    pub fn reset_degradation(&self) {
        let was_degraded = self.throttling.swap(false, Ordering::AcqRel)
            | self.quality_reduced.swap(false, Ordering::AcqRel)
            | self.non_essential_disabled.swap(false, Ordering::AcqRel);
        self.shrink_requested.store(false, Ordering::Release);
        if was_degraded {
            info!("degradation reset; normal service restored");
            self.events.emit(GovernorEvent::DegradationReset);
        }
    }

    fn raise(&self, flag: &AtomicBool, which: DegradationFlag) {
        if !flag.swap(true, Ordering::AcqRel) {
            warn!(flag = ?which, "degradation raised");
            self.events.emit(GovernorEvent::DegradationRaised(which));
        }
    }
}
