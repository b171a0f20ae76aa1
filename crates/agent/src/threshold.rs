//! Sensor threshold classification and alert-transition detection.

use std::collections::HashMap;

use time::OffsetDateTime;

use crate::normalize::SensorKind;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    Warning,
    Critical,
}

/// Configured bounds for one sensor. A missing bound disables that side's
/// check entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }
}

/// Classify a value against its bounds.
///
/// Sitting exactly on a bound is a warning; strictly outside is critical.
/// A missing or non-finite value is critical — absence of data is a risk
/// signal, not something to ignore.
pub fn classify(value: Option<f64>, bounds: &Bounds) -> Status {
    let Some(v) = value.filter(|v| v.is_finite()) else {
        return Status::Critical;
    };
    if bounds.min == Some(v) || bounds.max == Some(v) {
        return Status::Warning;
    }
    if bounds.min.is_some_and(|min| v < min) {
        return Status::Critical;
    }
    if bounds.max.is_some_and(|max| v > max) {
        return Status::Critical;
    }
    Status::Normal
}

// ---------------------------------------------------------------------------
// Alert events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

/// Emitted once per crossing into critical (and for controller advisories).
/// Ephemeral — consumers render or forward it, the core keeps nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub severity: Severity,
    pub kind: SensorKind,
    pub value: f64,
    pub device_id: String,
    pub timestamp: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Transition detection
// ---------------------------------------------------------------------------

/// Tracks the last classification per sensor so alerts fire exactly once per
/// crossing into critical — not on sustained critical, not on recovery, and
/// not on the very first observation after a device switch (no baseline).
#[derive(Debug, Default)]
pub struct TransitionDetector {
    prev: HashMap<SensorKind, Status>,
}

impl TransitionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all baselines (device switch, reconnect-after-reset).
    pub fn reset(&mut self) {
        self.prev.clear();
    }

    /// Record a new observation; returns `true` when this value crosses
    /// into critical from a known non-critical baseline.
    pub fn observe(&mut self, kind: SensorKind, value: f64, bounds: &Bounds) -> bool {
        let status = classify(Some(value), bounds);
        let prev = self.prev.insert(kind, status);
        status == Status::Critical && matches!(prev, Some(p) if p != Status::Critical)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
