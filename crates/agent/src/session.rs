//! The device session: owns the canonical state of the currently selected
//! device, mediates device switches, and publishes typed events.
//!
//! All inbound updates flow through one task, so state mutation is
//! single-writer by construction. A switch resets state before any new
//! data can land, and updates tagged with a different device id — late
//! messages from a previous subscription — are discarded.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::config::{Config, DeviceEntry};
use crate::normalize::{
    DeviceStateEvent, PumpMode, PumpStatus, SensorKind, SensorReading, StateChange, Update,
};
use crate::pump::{AutoPump, PumpAction, PumpPolicy};
use crate::stream::Inbound;
use crate::threshold::{AlertEvent, Severity, TransitionDetector};

const EVENT_CAPACITY: usize = 256;
const PUMP_QUEUE_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Canonical device state
// ---------------------------------------------------------------------------

/// The single live snapshot of the selected device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<f64>,
    pub battery: Option<f64>,
    pub pump_status: PumpStatus,
    pub pump_mode: PumpMode,
    /// A local command mutated the pump optimistically and no authoritative
    /// state event has arrived for it yet.
    pub pump_pending: bool,
}

impl Default for DeviceState {
    /// The unknown/OFF baseline a device starts from (and is reset to on
    /// every switch).
    fn default() -> Self {
        Self {
            moisture: None,
            temperature: None,
            humidity: None,
            light: None,
            battery: None,
            pump_status: PumpStatus::Off,
            pump_mode: PumpMode::Auto,
            pump_pending: false,
        }
    }
}

impl DeviceState {
    pub fn sensor(&self, kind: SensorKind) -> Option<f64> {
        match kind {
            SensorKind::Moisture => self.moisture,
            SensorKind::Temperature => self.temperature,
            SensorKind::Humidity => self.humidity,
            SensorKind::Light => self.light,
            SensorKind::Battery => self.battery,
        }
    }

    /// Merge a sensor sample. Pump fields are untouchable from here.
    pub fn apply_reading(&mut self, reading: &SensorReading) {
        let slot = match reading.kind {
            SensorKind::Moisture => &mut self.moisture,
            SensorKind::Temperature => &mut self.temperature,
            SensorKind::Humidity => &mut self.humidity,
            SensorKind::Light => &mut self.light,
            SensorKind::Battery => &mut self.battery,
        };
        *slot = Some(reading.value);
    }

    /// Merge an authoritative pump event. Server truth always wins over an
    /// optimistic local value, and it settles the pending marker.
    pub fn apply_state_event(&mut self, event: &DeviceStateEvent) {
        match event.change {
            StateChange::Power(status) => self.pump_status = status,
            StateChange::Mode(mode) => self.pump_mode = mode,
        }
        self.pump_pending = false;
    }

    /// Optimistic local mutation for a command that has not round-tripped
    /// through the broker yet.
    pub fn apply_local_pump_command(&mut self, status: PumpStatus, mode: PumpMode) {
        self.pump_status = status;
        self.pump_mode = mode;
        self.pump_pending = true;
    }
}

// ---------------------------------------------------------------------------
// Events & commands
// ---------------------------------------------------------------------------

/// Everything the core tells the outside world. The consumer (notification
/// UI, log sink) renders these; the core retains nothing.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Broker connection came up or went down.
    Connection { connected: bool },
    /// The canonical state changed (any reading or pump update).
    StateChanged {
        device_id: String,
        state: DeviceState,
    },
    /// A threshold crossing or a manual-mode advisory.
    Alert(AlertEvent),
    /// A pump/mode command was rejected; one-shot, no persistent error state.
    CommandFailed { device_id: String, detail: String },
    /// Credentials are gone for good; the operator must log in again.
    AuthRequired,
}

/// A pump command queued for fire-and-forget HTTP dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpRequest {
    pub device_id: String,
    pub status: PumpStatus,
    pub mode: PumpMode,
    pub moisture: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Switch the selected device (no-op when already selected).
    SelectDevice(String),
    /// Operator-initiated pump override; forces manual mode.
    SetPump(PumpStatus),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct DeviceSession {
    config: Arc<Config>,
    device_id: String,
    device: DeviceEntry,
    state: DeviceState,
    detector: TransitionDetector,
    pump: AutoPump,
    events: broadcast::Sender<AgentEvent>,
    pump_tx: mpsc::Sender<PumpRequest>,
    selection_tx: watch::Sender<String>,
}

pub struct SessionChannels {
    pub events: broadcast::Sender<AgentEvent>,
    pub pump_requests: mpsc::Receiver<PumpRequest>,
    pub selection: watch::Receiver<String>,
}

impl DeviceSession {
    /// Build a session with no device selected yet.
    pub fn new(config: Arc<Config>) -> (Self, SessionChannels) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (pump_tx, pump_rx) = mpsc::channel(PUMP_QUEUE_CAPACITY);
        let (selection_tx, selection_rx) = watch::channel(String::new());
        let session = Self {
            config,
            device_id: String::new(),
            device: DeviceEntry {
                device_id: String::new(),
                name: String::new(),
                auto_mode: false,
                thresholds: Default::default(),
            },
            state: DeviceState::default(),
            detector: TransitionDetector::new(),
            pump: AutoPump::new(PumpPolicy::default()),
            events: events.clone(),
            pump_tx,
            selection_tx,
        };
        let channels = SessionChannels {
            events,
            pump_requests: pump_rx,
            selection: selection_rx,
        };
        (session, channels)
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Switch the selected device. State, alert baselines, and controller
    /// cooldowns are reset synchronously, before any message from the new
    /// subscription can be processed. The caller re-points the stream
    /// subscription; this method owns only the session side.
    pub fn select_device(&mut self, device_id: &str) {
        if device_id == self.device_id {
            return;
        }
        tracing::info!(from = %self.device_id, to = %device_id, "switching device");

        self.device_id = device_id.to_string();
        self.device = self
            .config
            .device(device_id)
            .cloned()
            .unwrap_or_else(|| {
                tracing::warn!(device = %device_id, "no config entry for device, using defaults");
                DeviceEntry {
                    device_id: device_id.to_string(),
                    name: device_id.to_string(),
                    auto_mode: false,
                    thresholds: Default::default(),
                }
            });
        self.state = DeviceState::default();
        self.detector.reset();
        self.pump.reset();

        let _ = self.selection_tx.send(self.device_id.clone());
        self.emit_state();
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SelectDevice(id) => self.select_device(&id),
            SessionCommand::SetPump(status) => {
                self.state
                    .apply_local_pump_command(status, PumpMode::Manual);
                self.emit_state();
                self.dispatch_pump(status, PumpMode::Manual, self.state.moisture);
            }
        }
    }

    /// Apply one normalized update tagged with its source device.
    pub fn handle_update(&mut self, source_device: &str, update: Update) {
        if source_device != self.device_id {
            // Late message from a previous subscription; must never be
            // attributed to the current device.
            tracing::trace!(
                source = %source_device,
                current = %self.device_id,
                "discarding update for non-selected device"
            );
            return;
        }

        match update {
            Update::Reading(reading) => {
                self.state.apply_reading(&reading);
                self.check_thresholds(&reading);
                if reading.kind == SensorKind::Moisture {
                    self.evaluate_pump(reading.value);
                }
                self.emit_state();
            }
            Update::State(event) => {
                self.state.apply_state_event(&event);
                self.emit_state();
            }
        }
    }

    fn check_thresholds(&mut self, reading: &SensorReading) {
        let bounds = self.device.thresholds.bounds(reading.kind);
        if self.detector.observe(reading.kind, reading.value, &bounds) {
            self.emit(AgentEvent::Alert(AlertEvent {
                severity: Severity::Critical,
                kind: reading.kind,
                value: reading.value,
                device_id: self.device_id.clone(),
                timestamp: reading.timestamp,
            }));
        }
    }

    fn evaluate_pump(&mut self, moisture: f64) {
        let min = self.device.thresholds.moisture_min;
        let action = self.pump.evaluate(
            moisture,
            self.device.auto_mode,
            min,
            self.state.pump_status,
            Instant::now(),
        );
        match action {
            Some(PumpAction::Command(status)) => {
                tracing::info!(
                    device = %self.device_id,
                    status = %status,
                    moisture,
                    "auto controller commanding pump"
                );
                self.state
                    .apply_local_pump_command(status, PumpMode::Auto);
                self.dispatch_pump(status, PumpMode::Auto, Some(moisture));
            }
            Some(PumpAction::Advisory { moisture, min }) => {
                tracing::warn!(
                    device = %self.device_id,
                    moisture,
                    min,
                    "moisture low in manual mode, pump action required"
                );
                self.emit(AgentEvent::Alert(AlertEvent {
                    severity: Severity::Warning,
                    kind: SensorKind::Moisture,
                    value: moisture,
                    device_id: self.device_id.clone(),
                    timestamp: OffsetDateTime::now_utc(),
                }));
            }
            None => {}
        }
    }

    fn dispatch_pump(&self, status: PumpStatus, mode: PumpMode, moisture: Option<f64>) {
        let request = PumpRequest {
            device_id: self.device_id.clone(),
            status,
            mode,
            moisture,
        };
        if self.pump_tx.try_send(request).is_err() {
            tracing::warn!(device = %self.device_id, "pump dispatch queue full, dropping command");
        }
    }

    fn emit_state(&self) {
        self.emit(AgentEvent::StateChanged {
            device_id: self.device_id.clone(),
            state: self.state.clone(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.events.send(event);
    }
}

/// Session task: single ordered consumer of commands and inbound updates,
/// so a switch-in-progress fully resets state before any queued message
/// from the old device is applied (and then discarded by the tag check).
pub async fn run(
    mut session: DeviceSession,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut inbound: mpsc::Receiver<Inbound>,
) {
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => session.handle_command(cmd),
                None => break,
            },
            msg = inbound.recv() => match msg {
                Some(msg) => session.handle_update(&msg.device_id, msg.update),
                None => break,
            },
        }
    }
    tracing::debug!("session task exiting");
}

// ===========================================================================
// Tests
// ===========================================================================
