//! HTTP collaborator client: pump/mode commands and historical stream data.
//!
//! Every request carries the stored bearer token. A 400/401 answer whose
//! body says `"Invalid token"` triggers exactly one refresh-and-replay; a
//! failed refresh clears the credential store and surfaces
//! [`ApiError::SessionExpired`] so the caller can demand re-authentication.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::auth::{AuthClient, TokenStore};
use crate::normalize::{numeric, PumpMode, PumpStatus, SensorKind};

/// Backend topic the pump command is addressed to.
pub const PUMP_TOPIC: &str = "pmc/pump";
/// Backend topic for auto/manual mode changes.
pub const MODE_TOPIC: &str = "pmc/mode";

const OWNERSHIP_ERROR: &str = "Device does not belong to the user";
const INVALID_TOKEN: &str = "Invalid token";
const HISTORY_PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No access token in the store; nothing was sent.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Token was rejected and the refresh attempt failed; credentials have
    /// been cleared and the operator must log in again.
    #[error("session expired, re-authentication required")]
    SessionExpired,

    /// The backend says this device belongs to a different account.
    #[error("device does not belong to this account")]
    DeviceOwnership,

    /// Any other non-2xx answer.
    #[error("api request rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("api transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<TokenStore>,
    auth: AuthClient,
    /// The ownership error repeats on every periodic refresh; warn only once
    /// per process.
    ownership_warned: AtomicBool,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        store: Arc<TokenStore>,
        auth: AuthClient,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build api http client: {e}"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
            auth,
            ownership_warned: AtomicBool::new(false),
        })
    }

    /// POST with bearer auth and the one-shot invalid-token replay.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let mut refreshed = false;
        loop {
            let Some(token) = self.store.access_token() else {
                return Err(ApiError::NotAuthenticated);
            };
            let response = self
                .http
                .post(format!("{}{path}", self.base_url))
                .bearer_auth(&token)
                .json(body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response.json().await?);
            }

            let error_body = response.json::<Value>().await.unwrap_or(Value::Null);
            let detail = error_body
                .get("data")
                .and_then(Value::as_str)
                .or_else(|| error_body.get("message").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();

            if status.as_u16() == 400 && detail == OWNERSHIP_ERROR {
                if !self.ownership_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!("backend reports the device is not registered to this account");
                }
                return Err(ApiError::DeviceOwnership);
            }

            let token_error = matches!(status.as_u16(), 400 | 401) && detail == INVALID_TOKEN;
            if token_error && !refreshed {
                refreshed = true;
                match self.auth.refresh().await {
                    Ok(()) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "token refresh failed, clearing credentials");
                        self.store.clear();
                        return Err(ApiError::SessionExpired);
                    }
                }
            }

            return Err(ApiError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }
    }

    // -- commands -----------------------------------------------------------

    /// `POST /update-state-details` for an arbitrary device topic.
    pub async fn update_device_state(
        &self,
        device_id: &str,
        topic: &str,
        payload: Value,
    ) -> Result<(), ApiError> {
        let body = json!({ "deviceId": device_id, "topic": topic, "payload": payload });
        self.post("/update-state-details", &body).await.map(|_| ())
    }

    /// Send a pump ON/OFF command, optionally with the moisture value that
    /// motivated it.
    pub async fn update_pump_status(
        &self,
        device_id: &str,
        status: PumpStatus,
        moisture: Option<f64>,
    ) -> Result<(), ApiError> {
        let mut payload = json!({ "pump": status.command_str() });
        if let Some(m) = moisture {
            payload["moisture"] = json!(m);
        }
        self.update_device_state(device_id, PUMP_TOPIC, payload).await
    }

    /// Switch the device between auto and manual pump control.
    pub async fn update_device_mode(
        &self,
        device_id: &str,
        mode: PumpMode,
    ) -> Result<(), ApiError> {
        self.update_device_state(device_id, MODE_TOPIC, json!({ "mode": mode.as_str() }))
            .await
    }

    // -- historical data ----------------------------------------------------

    /// Fetch raw history records for one sensor topic. A non-`Success`
    /// envelope degrades to an empty slice, matching the dashboard.
    pub async fn stream_data_by_topic(
        &self,
        device_id: &str,
        topic: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
        pagination: u32,
        page_size: u32,
    ) -> Result<Vec<Value>, ApiError> {
        let body = json!({
            "deviceId": device_id,
            "topic": topic,
            "startTime": format_range_bound(start),
            "endTime": format_range_bound(end),
            "pagination": pagination.to_string(),
            "pageSize": page_size.to_string(),
        });
        let value = self.post("/get-stream-data/device/topic", &body).await?;
        if value.get("status").and_then(Value::as_str) == Some("Success") {
            Ok(value
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default())
        } else {
            Ok(Vec::new())
        }
    }

    /// Fetch history for every sensor topic and merge into chart-ready
    /// points: grouped by timestamp, sorted, gaps filled with the last
    /// known value.
    ///
    /// Per-topic failures degrade to missing columns; only a lost session
    /// aborts the whole fetch.
    pub async fn all_stream_data(
        &self,
        device_id: &str,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Vec<HistoryPoint>, ApiError> {
        let end = end.unwrap_or_else(OffsetDateTime::now_utc);
        let start = start.unwrap_or(end - time::Duration::hours(24));

        let mut by_ts: BTreeMap<OffsetDateTime, HistoryPoint> = BTreeMap::new();

        for kind in SensorKind::ALL {
            let records = match self
                .stream_data_by_topic(device_id, kind.stream_topic(), start, end, 0, HISTORY_PAGE_SIZE)
                .await
            {
                Ok(records) => records,
                Err(e @ (ApiError::SessionExpired | ApiError::NotAuthenticated)) => return Err(e),
                Err(e) => {
                    tracing::warn!(sensor = %kind, error = %e, "history fetch failed for topic");
                    continue;
                }
            };

            for record in &records {
                let Some(ts) = record_timestamp(record) else {
                    continue;
                };
                let Some(value) = record_value(record, kind) else {
                    continue;
                };
                *by_ts
                    .entry(ts)
                    .or_insert_with(|| HistoryPoint::empty(ts))
                    .field_mut(kind) = Some(value);
            }
        }

        let mut points: Vec<HistoryPoint> = by_ts.into_values().collect();
        forward_fill(&mut points);
        Ok(points)
    }
}

// ---------------------------------------------------------------------------
// History records
// ---------------------------------------------------------------------------

/// One merged chart point: every sensor column for a single timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub timestamp: OffsetDateTime,
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<f64>,
    pub battery: Option<f64>,
}

impl HistoryPoint {
    fn empty(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            moisture: None,
            temperature: None,
            humidity: None,
            light: None,
            battery: None,
        }
    }

    fn field_mut(&mut self, kind: SensorKind) -> &mut Option<f64> {
        match kind {
            SensorKind::Moisture => &mut self.moisture,
            SensorKind::Temperature => &mut self.temperature,
            SensorKind::Humidity => &mut self.humidity,
            SensorKind::Light => &mut self.light,
            SensorKind::Battery => &mut self.battery,
        }
    }

    fn field(&self, kind: SensorKind) -> Option<f64> {
        match kind {
            SensorKind::Moisture => self.moisture,
            SensorKind::Temperature => self.temperature,
            SensorKind::Humidity => self.humidity,
            SensorKind::Light => self.light,
            SensorKind::Battery => self.battery,
        }
    }
}

/// The backend formats range bounds as whole-second UTC instants.
fn format_range_bound(ts: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    ts.format(&fmt)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

fn record_timestamp(record: &Value) -> Option<OffsetDateTime> {
    record
        .get("timestamp")
        .or_else(|| record.get("time"))
        .and_then(Value::as_str)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

/// Records may carry the value nested in a payload (object or JSON string),
/// under the sensor name or an abbreviation, or as a flat `value` field.
fn record_value(record: &Value, kind: SensorKind) -> Option<f64> {
    let parsed: Value = match record.get("payload") {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| record.clone()),
        Some(obj @ Value::Object(_)) => obj.clone(),
        _ => record.clone(),
    };
    let direct = match kind {
        SensorKind::Temperature => parsed.get("temp").or_else(|| parsed.get("temperature")),
        other => parsed.get(other.as_str()),
    };
    direct
        .and_then(numeric)
        .or_else(|| record.get("value").and_then(numeric))
}

/// Fill gaps with the last known value per column. An exact 0 counts as a
/// gap — the devices emit zero as sentinel noise on these channels.
fn forward_fill(points: &mut [HistoryPoint]) {
    let mut last: [Option<f64>; 5] = [None; 5];
    for point in points {
        for (slot, kind) in last.iter_mut().zip(SensorKind::ALL) {
            match point.field(kind) {
                Some(v) if v != 0.0 => *slot = Some(v),
                _ => {
                    if slot.is_some() {
                        *point.field_mut(kind) = *slot;
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> (ApiClient, Arc<TokenStore>) {
        let store = Arc::new(TokenStore::in_memory());
        store.set(Credentials {
            access_token: "jwt-1".into(),
            refresh_token: Some("ref-1".into()),
        });
        let auth = AuthClient::new(&server.uri(), Arc::clone(&store), Duration::from_secs(5)).unwrap();
        let api = ApiClient::new(&server.uri(), Arc::clone(&store), auth, Duration::from_secs(5))
            .unwrap();
        (api, store)
    }

    fn success_body() -> Value {
        json!({"status": "Success", "data": "Updated"})
    }

    // -- commands -----------------------------------------------------------

    #[tokio::test]
    async fn pump_command_posts_expected_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update-state-details"))
            .and(header("authorization", "Bearer jwt-1"))
            .and(body_partial_json(json!({
                "deviceId": "GH-A1",
                "topic": "pmc/pump",
                "payload": { "pump": "on", "moisture": 12.5 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _) = client(&server).await;
        api.update_pump_status("GH-A1", PumpStatus::On, Some(12.5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mode_change_posts_lowercase_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update-state-details"))
            .and(body_partial_json(json!({
                "topic": "pmc/mode",
                "payload": { "mode": "manual" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _) = client(&server).await;
        api.update_device_mode("GH-A1", PumpMode::Manual).await.unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_client_sends_nothing() {
        let server = MockServer::start().await;
        let (api, store) = client(&server).await;
        store.clear();
        let err = api
            .update_pump_status("GH-A1", PumpStatus::Off, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotAuthenticated));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    // -- invalid-token replay ------------------------------------------------

    #[tokio::test]
    async fn invalid_token_refreshes_and_replays_once() {
        let server = MockServer::start().await;
        // First attempt with the stale token is rejected...
        Mock::given(method("POST"))
            .and(path("/update-state-details"))
            .and(header("authorization", "Bearer jwt-1"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"data": "Invalid token"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        // ...the refresh hands out a new one...
        Mock::given(method("GET"))
            .and(path("/get-new-token"))
            .and(header("authorization", "Bearer ref-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "jwtToken": "jwt-2" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        // ...and the replay with it succeeds.
        Mock::given(method("POST"))
            .and(path("/update-state-details"))
            .and(header("authorization", "Bearer jwt-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(1)
            .mount(&server)
            .await;

        let (api, store) = client(&server).await;
        api.update_pump_status("GH-A1", PumpStatus::On, None)
            .await
            .unwrap();
        assert_eq!(store.access_token().as_deref(), Some("jwt-2"));
    }

    #[tokio::test]
    async fn failed_refresh_clears_store_and_reports_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update-state-details"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"data": "Invalid token"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/get-new-token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"data": "Invalid refresh token"})),
            )
            .mount(&server)
            .await;

        let (api, store) = client(&server).await;
        let err = api
            .update_pump_status("GH-A1", PumpStatus::On, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn invalid_token_replays_at_most_once() {
        let server = MockServer::start().await;
        // Token endpoint always succeeds, state endpoint always rejects:
        // the client must give up after one replay.
        Mock::given(method("POST"))
            .and(path("/update-state-details"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"data": "Invalid token"})),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/get-new-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "jwtToken": "jwt-2" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _) = client(&server).await;
        let err = api
            .update_pump_status("GH-A1", PumpStatus::On, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Rejected { status: 400, .. }));
    }

    // -- ownership error -----------------------------------------------------

    #[tokio::test]
    async fn ownership_error_is_typed_and_not_replayed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update-state-details"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "data": "Device does not belong to the user"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let (api, store) = client(&server).await;
        for _ in 0..2 {
            let err = api
                .update_pump_status("GH-A1", PumpStatus::On, None)
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::DeviceOwnership));
        }
        // Ownership problems are not auth problems: tokens stay.
        assert!(store.is_authenticated());
    }

    // -- historical data -----------------------------------------------------

    #[tokio::test]
    async fn non_success_envelope_degrades_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get-stream-data/device/topic"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Fail", "data": "No records"
            })))
            .mount(&server)
            .await;

        let (api, _) = client(&server).await;
        let now = OffsetDateTime::now_utc();
        let records = api
            .stream_data_by_topic("GH-A1", "pmc/moisture", now - time::Duration::hours(1), now, 0, 100)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn all_stream_data_merges_topics_by_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get-stream-data/device/topic"))
            .and(body_partial_json(json!({"topic": "pmc/moisture"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Success",
                "data": [
                    {"timestamp": "2026-03-01T10:00:00Z", "payload": {"moisture": 40.0}},
                    {"timestamp": "2026-03-01T10:15:00Z", "payload": {"moisture": 38.0}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get-stream-data/device/topic"))
            .and(body_partial_json(json!({"topic": "pmc/temperature"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Success",
                "data": [
                    // String-encoded payload with the abbreviated key.
                    {"timestamp": "2026-03-01T10:00:00Z", "payload": "{\"temp\": 22.5}"}
                ]
            })))
            .mount(&server)
            .await;
        // Remaining topics: nothing recorded.
        Mock::given(method("POST"))
            .and(path("/get-stream-data/device/topic"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Success", "data": []
            })))
            .mount(&server)
            .await;

        let (api, _) = client(&server).await;
        let points = api.all_stream_data("GH-A1", None, None).await.unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].moisture, Some(40.0));
        assert_eq!(points[0].temperature, Some(22.5));
        assert_eq!(points[1].moisture, Some(38.0));
        // Temperature gap at 10:15 forward-filled from 10:00.
        assert_eq!(points[1].temperature, Some(22.5));
        // Points come back sorted.
        assert!(points[0].timestamp < points[1].timestamp);
    }

    // -- merge helpers -------------------------------------------------------

    #[test]
    fn record_value_prefers_payload_over_flat_value() {
        let record = json!({"payload": {"moisture": 41.0}, "value": 9.0});
        assert_eq!(record_value(&record, SensorKind::Moisture), Some(41.0));
    }

    #[test]
    fn record_value_falls_back_to_flat_value() {
        let record = json!({"payload": {"other": 1}, "value": "9.5"});
        assert_eq!(record_value(&record, SensorKind::Moisture), Some(9.5));
    }

    #[test]
    fn record_without_timestamp_is_skipped() {
        assert_eq!(record_timestamp(&json!({"payload": {}})), None);
    }

    #[test]
    fn forward_fill_treats_zero_as_gap() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut points = vec![
            HistoryPoint {
                moisture: Some(40.0),
                ..HistoryPoint::empty(ts)
            },
            HistoryPoint {
                moisture: Some(0.0),
                ..HistoryPoint::empty(ts + time::Duration::minutes(15))
            },
            HistoryPoint::empty(ts + time::Duration::minutes(30)),
        ];
        forward_fill(&mut points);
        assert_eq!(points[1].moisture, Some(40.0));
        assert_eq!(points[2].moisture, Some(40.0));
    }

    #[test]
    fn forward_fill_leaves_leading_gaps_alone() {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut points = vec![
            HistoryPoint::empty(ts),
            HistoryPoint {
                light: Some(640.0),
                ..HistoryPoint::empty(ts + time::Duration::minutes(15))
            },
        ];
        forward_fill(&mut points);
        assert_eq!(points[0].light, None);
        assert_eq!(points[1].light, Some(640.0));
    }

    #[test]
    fn range_bounds_are_whole_second_utc() {
        let ts = OffsetDateTime::from_unix_timestamp(1_767_225_600).unwrap();
        assert_eq!(format_range_bound(ts), "2026-01-01T00:00:00Z");
    }
}
