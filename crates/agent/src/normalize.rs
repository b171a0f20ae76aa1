//! Broker message normalization: heterogeneous stream/state payloads into
//! canonical sensor readings and device-state events.
//!
//! Devices and the backend publish in several shapes (consolidated
//! snapshots, single-sensor pushes keyed three different ways, string-encoded
//! sub-payloads). Everything is funnelled through [`normalize`], which emits
//! zero or more typed [`Update`]s and silently drops whatever it cannot
//! recognize — payload shapes are not contractually fixed.

use serde_json::{Map, Value};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Canonical types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Moisture,
    Temperature,
    Humidity,
    Light,
    Battery,
}

impl SensorKind {
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Moisture,
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::Light,
        SensorKind::Battery,
    ];

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Moisture => "moisture",
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Light => "light",
            SensorKind::Battery => "battery",
        }
    }

    /// Abbreviated payload key some firmware uses ("temp" vs "temperature").
    fn short_key(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temp",
            other => other.as_str(),
        }
    }

    /// The per-sensor stream topic, e.g. `pmc/temperature`.
    pub fn stream_topic(self) -> &'static str {
        match self {
            SensorKind::Moisture => "pmc/moisture",
            SensorKind::Temperature => "pmc/temperature",
            SensorKind::Humidity => "pmc/humidity",
            SensorKind::Light => "pmc/light",
            SensorKind::Battery => "pmc/battery",
        }
    }

    fn from_stream_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.stream_topic() == topic)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    On,
    Off,
}

impl PumpStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Some(Self::On),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }

    /// Wire form used on the state topic ("ON"/"OFF").
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    /// Wire form used in command payloads ("on"/"off").
    pub fn command_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for PumpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    Auto,
    Manual,
}

impl PumpMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized sensor sample. Not retained individually — folded into
/// the session's device state.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub value: f64,
    pub timestamp: OffsetDateTime,
}

/// A pump status or mode change. Only ever produced from the state topic;
/// sensor batches can never mutate pump fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStateEvent {
    pub change: StateChange,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Power(PumpStatus),
    Mode(PumpMode),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Reading(SensorReading),
    State(DeviceStateEvent),
}

// ---------------------------------------------------------------------------
// Broker topic layout
// ---------------------------------------------------------------------------

/// Which per-device channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stream,
    State,
}

/// Extract (device_id, channel, remainder) from
/// `protonest/<device>/<stream|state>[/<sub/topic>]`.
pub fn parse_topic(topic: &str) -> Option<(&str, Channel, Option<&str>)> {
    let rest = topic.strip_prefix("protonest/")?;
    let (device_id, rest) = rest.split_once('/')?;
    if device_id.is_empty() {
        return None;
    }
    let (channel, remainder) = match rest.split_once('/') {
        Some((c, r)) => (c, Some(r)),
        None => (rest, None),
    };
    let channel = match channel {
        "stream" => Channel::Stream,
        "state" => Channel::State,
        _ => return None,
    };
    Some((device_id, channel, remainder.filter(|r| !r.is_empty())))
}

/// Wildcard subscription filter for a device's sensor stream.
pub fn stream_filter(device_id: &str) -> String {
    format!("protonest/{device_id}/stream/#")
}

/// Wildcard subscription filter for a device's state channel.
pub fn state_filter(device_id: &str) -> String {
    format!("protonest/{device_id}/state/#")
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize one raw broker message into canonical updates.
///
/// `topic_hint` is the sub-topic remainder from the MQTT topic (e.g.
/// `pmc/moisture`); an explicit `topic` field inside the envelope takes
/// precedence over it. Unrecognized payloads yield an empty vec.
pub fn normalize(channel: Channel, topic_hint: Option<&str>, raw: &[u8]) -> Vec<Update> {
    let envelope: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "dropping non-JSON broker message");
            return Vec::new();
        }
    };
    let Value::Object(top) = envelope else {
        return Vec::new();
    };

    let timestamp = top
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    let topic = top
        .get("topic")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| topic_hint.map(str::to_owned));

    // The message body may nest the actual fields under `payload`, either as
    // an object or as a JSON-encoded string. Absent that, the envelope
    // itself is the payload.
    let nested = match top.get("payload") {
        None | Some(Value::Null) => None,
        Some(Value::Object(inner)) => Some(inner.clone()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(inner)) => Some(inner),
            _ => {
                tracing::debug!("dropping message with undecodable string payload");
                return Vec::new();
            }
        },
        Some(_) => return Vec::new(),
    };
    let payload = nested.unwrap_or(top);

    match channel {
        Channel::Stream => normalize_stream(&payload, topic.as_deref(), timestamp),
        Channel::State => normalize_state(&payload, timestamp),
    }
}

fn normalize_stream(
    payload: &Map<String, Value>,
    topic: Option<&str>,
    timestamp: OffsetDateTime,
) -> Vec<Update> {
    // Keys counted for batch detection. "temp" and "temperature" are
    // distinct keys on the wire even though they map to the same sensor.
    const RECOGNIZED: [(&str, SensorKind); 6] = [
        ("temp", SensorKind::Temperature),
        ("temperature", SensorKind::Temperature),
        ("humidity", SensorKind::Humidity),
        ("moisture", SensorKind::Moisture),
        ("light", SensorKind::Light),
        ("battery", SensorKind::Battery),
    ];

    let found: Vec<(&str, SensorKind)> = RECOGNIZED
        .into_iter()
        .filter(|(key, _)| payload.contains_key(*key))
        .collect();

    let reading = |kind: SensorKind, value: f64| {
        Update::Reading(SensorReading {
            kind,
            value,
            timestamp,
        })
    };

    // Rule 1: a consolidated snapshot carries more than two recognized keys.
    // A two-key payload must NOT be misclassified as a batch — it may be a
    // single-sensor push that happens to echo a second field.
    if found.len() > 2 {
        return found
            .into_iter()
            .filter_map(|(key, kind)| numeric(payload.get(key)?).map(|v| reading(kind, v)))
            .collect();
    }

    // Rule 2: a known per-sensor topic. The value may sit under the sensor's
    // short name, the full topic string, or the topic's trailing segment.
    if let Some(kind) = topic.and_then(SensorKind::from_stream_topic) {
        let t = kind.stream_topic();
        let tail = t.rsplit('/').next().unwrap_or(t);
        let value = payload
            .get(kind.short_key())
            .or_else(|| payload.get(t))
            .or_else(|| payload.get(tail))
            .and_then(numeric);
        return match value {
            Some(v) => vec![reading(kind, v)],
            None => Vec::new(),
        };
    }

    // Rule 2b: the topic string itself names a payload key.
    if let Some(t) = topic {
        if let Some(raw) = payload.get(t) {
            let kind = RECOGNIZED
                .into_iter()
                .find(|(key, _)| *key == t)
                .map(|(_, kind)| kind);
            return match (kind, numeric(raw)) {
                (Some(kind), Some(v)) => vec![reading(kind, v)],
                _ => Vec::new(),
            };
        }
    }

    // Last resort: scan for recognized keys (at most two present here).
    found
        .into_iter()
        .filter_map(|(key, kind)| numeric(payload.get(key)?).map(|v| reading(kind, v)))
        .collect()
}

fn normalize_state(payload: &Map<String, Value>, timestamp: OffsetDateTime) -> Vec<Update> {
    let mut updates = Vec::new();

    let power = ["power", "status", "pumpStatus", "pump"]
        .iter()
        .find_map(|key| payload.get(*key))
        .and_then(Value::as_str)
        .and_then(PumpStatus::parse);
    if let Some(status) = power {
        updates.push(Update::State(DeviceStateEvent {
            change: StateChange::Power(status),
            timestamp,
        }));
    }

    let mode = ["mode", "pumpMode"]
        .iter()
        .find_map(|key| payload.get(*key))
        .and_then(Value::as_str)
        .and_then(PumpMode::parse);
    if let Some(mode) = mode {
        updates.push(Update::State(DeviceStateEvent {
            change: StateChange::Mode(mode),
            timestamp,
        }));
    }

    updates
}

/// Pull an f64 out of a JSON value: numbers directly, numeric strings
/// parsed. Anything else (and non-finite results) is rejected.
pub(crate) fn numeric(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

// ===========================================================================
// Tests
// ===========================================================================
