//! Closed-loop auto-irrigation controller.
//!
//! Re-evaluated on every moisture reading. In auto mode it commands the pump
//! toward the desired state with a command cooldown plus hysteresis against
//! the device's reported status; in manual mode it only emits a rate-limited
//! advisory prompting the operator.

use std::time::Duration;

use tokio::time::Instant;

use crate::normalize::PumpStatus;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PumpPolicy {
    /// Minimum time between repeats of the same pump command.
    pub command_cooldown: Duration,
    /// Minimum time between low-moisture advisories in manual mode.
    pub advisory_cooldown: Duration,
}

impl Default for PumpPolicy {
    fn default() -> Self {
        Self {
            command_cooldown: Duration::from_secs(5),
            advisory_cooldown: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// What the controller decided on this evaluation cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PumpAction {
    /// Issue a pump command (fire-and-forget; a failed send is retried
    /// naturally on the next evaluation).
    Command(PumpStatus),
    /// Manual mode: moisture is low, prompt the operator instead.
    Advisory { moisture: f64, min: f64 },
}

#[derive(Debug, Default)]
pub struct AutoPump {
    policy: PumpPolicy,
    last_command: Option<(PumpStatus, Instant)>,
    last_advisory: Option<Instant>,
}

impl AutoPump {
    pub fn new(policy: PumpPolicy) -> Self {
        Self {
            policy,
            last_command: None,
            last_advisory: None,
        }
    }

    /// Forget cooldown history (device switch).
    pub fn reset(&mut self) {
        self.last_command = None;
        self.last_advisory = None;
    }

    /// Evaluate one moisture sample against the configured minimum.
    ///
    /// `reported` is the pump status the device last reported (or the
    /// optimistic local value); commands are suppressed when the device
    /// already claims the desired state.
    pub fn evaluate(
        &mut self,
        moisture: f64,
        auto_mode: bool,
        min: f64,
        reported: PumpStatus,
        now: Instant,
    ) -> Option<PumpAction> {
        if !moisture.is_finite() {
            return None;
        }
        let low = moisture < min;

        if auto_mode {
            let desired = if low { PumpStatus::On } else { PumpStatus::Off };

            // Same command already sent within the cooldown window.
            if let Some((cmd, at)) = self.last_command {
                if cmd == desired && now.duration_since(at) < self.policy.command_cooldown {
                    return None;
                }
            }
            // Hysteresis: the device already reports the desired state.
            if reported == desired {
                return None;
            }

            self.last_command = Some((desired, now));
            return Some(PumpAction::Command(desired));
        }

        // Manual mode: never actuate, only nudge the operator — and not
        // more than once per advisory window.
        if low && reported != PumpStatus::On {
            if let Some(at) = self.last_advisory {
                if now.duration_since(at) < self.policy.advisory_cooldown {
                    return None;
                }
            }
            self.last_advisory = Some(now);
            return Some(PumpAction::Advisory { moisture, min });
        }

        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
