//! Broker connection management: one logical MQTT connection with automatic
//! recovery, credential refresh, circuit breaking, and per-device
//! subscriptions.
//!
//! The retry policy lives in plain data ([`RetryState`] + the policy
//! structs) so the backoff/refresh/circuit rules are testable without a
//! broker. The async task wraps rumqttc: a fresh client is built for every
//! connection attempt so the current access token is always re-read —
//! reconnects commonly follow a token rotation.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::auth::{AuthClient, TokenStore};
use crate::normalize::{self, Update};
use crate::session::AgentEvent;

const COMMAND_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 256;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Reconnect behaviour after abnormal closes.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Multiplicative growth per consecutive failure.
    pub growth: f64,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Consecutive failures before a one-time credential refresh.
    pub refresh_after: u32,
    /// Consecutive failures before the circuit opens and automatic retry
    /// stops until an explicit connect().
    pub max_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            growth: 1.5,
            max_delay: Duration::from_secs(60),
            refresh_after: 3,
            max_failures: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before the next attempt, given `failures` consecutive
    /// abnormal closes (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = self.growth.powi(failures.saturating_sub(1).min(64) as i32);
        let delay = self.base_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry behaviour for subscriptions requested while the connection is not
/// ready yet.
#[derive(Debug, Clone)]
pub struct SubscribePolicy {
    pub base_delay: Duration,
    pub growth: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for SubscribePolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            growth: 1.5,
            max_delay: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

impl SubscribePolicy {
    /// Backoff before retry `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.growth.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Schedule the retry after `attempt`, or `None` once the bounded
    /// attempt count is exhausted.
    fn next_attempt(&self, attempt: u32) -> Option<(u32, Duration)> {
        let next = attempt + 1;
        (next < self.max_attempts).then(|| (next, self.backoff(next)))
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect: ReconnectPolicy,
    pub subscribe: SubscribePolicy,
}

// ---------------------------------------------------------------------------
// Retry state machine
// ---------------------------------------------------------------------------

/// What to do after an abnormal close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Wait, optionally refresh credentials, then rebuild the connection.
    Backoff { delay: Duration, refresh: bool },
    /// Too many consecutive failures; suspend automatic retry.
    CircuitOpen,
}

/// Consecutive-failure bookkeeping, kept as data rather than scattered
/// flags so the retry policy is independently testable.
#[derive(Debug, Default)]
pub struct RetryState {
    failures: u32,
    refresh_attempted: bool,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Successful CONNACK: counters are forgiven.
    pub fn on_connected(&mut self) {
        self.failures = 0;
        self.refresh_attempted = false;
    }

    /// Explicit connect() re-arms a tripped circuit.
    pub fn reset(&mut self) {
        self.on_connected();
    }

    /// Claim the single credential-refresh slot for this failure streak.
    pub fn try_claim_refresh(&mut self) -> bool {
        !std::mem::replace(&mut self.refresh_attempted, true)
    }

    /// Record an abnormal close and decide the next step.
    pub fn on_abnormal_close(&mut self, policy: &ReconnectPolicy) -> FailureAction {
        self.failures += 1;
        if self.failures >= policy.max_failures {
            return FailureAction::CircuitOpen;
        }
        let refresh = self.failures >= policy.refresh_after && self.try_claim_refresh();
        FailureAction::Backoff {
            delay: policy.backoff(self.failures),
            refresh,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle & channels
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Command {
    Connect,
    Subscribe(String),
    Disconnect,
}

/// A normalized update tagged with the device that produced it, as parsed
/// from the MQTT topic. The session re-checks the tag against the current
/// selection before applying.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub device_id: String,
    pub update: Update,
}

/// Cheap cloneable handle to the connection task.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<Command>,
}

impl StreamHandle {
    /// Start (or resume after a circuit-open) the connection. Idempotent
    /// while already connecting or connected.
    pub async fn connect(&self) {
        let _ = self.tx.send(Command::Connect).await;
    }

    /// Replace the active device subscription.
    pub async fn subscribe(&self, device_id: &str) {
        let _ = self.tx.send(Command::Subscribe(device_id.to_string())).await;
    }

    /// Unsubscribe and tear the connection down. Idempotent.
    pub async fn disconnect(&self) {
        let _ = self.tx.send(Command::Disconnect).await;
    }
}

/// Spawn the connection task. Updates land on `inbound`; connection status
/// and auth signals go out on the event bus.
pub fn spawn(
    config: StreamConfig,
    store: Arc<TokenStore>,
    auth: AuthClient,
    inbound: mpsc::Sender<Inbound>,
    events: broadcast::Sender<AgentEvent>,
) -> StreamHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    tokio::spawn(run(config, store, auth, rx, inbound, events));
    StreamHandle { tx }
}

pub const fn inbound_queue_capacity() -> usize {
    INBOUND_QUEUE
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Why a connection cycle ended.
enum CycleEnd {
    /// Abnormal close, backoff already served: rebuild and reconnect.
    Reconnect,
    /// Explicit disconnect(): back to idle.
    Disconnected,
    /// Failure cap reached: back to idle until an explicit connect().
    CircuitOpen,
    /// Broker rejected the credentials and refresh did not help.
    AuthFailed,
    /// Command channel closed: the process is going down.
    Shutdown,
}

struct PendingSubscribe {
    device_id: String,
    attempt: u32,
    at: Instant,
}

struct StreamTask {
    config: StreamConfig,
    store: Arc<TokenStore>,
    auth: AuthClient,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Inbound>,
    events: broadcast::Sender<AgentEvent>,
    current_device: Option<String>,
    retry: RetryState,
}

async fn run(
    config: StreamConfig,
    store: Arc<TokenStore>,
    auth: AuthClient,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Inbound>,
    events: broadcast::Sender<AgentEvent>,
) {
    let mut task = StreamTask {
        config,
        store,
        auth,
        commands,
        inbound,
        events,
        current_device: None,
        retry: RetryState::new(),
    };

    // Idle until an explicit connect(); re-entered after disconnect(),
    // circuit-open, and definitive auth failure.
    'idle: loop {
        match task.commands.recv().await {
            None => return,
            Some(Command::Connect) => {}
            Some(Command::Subscribe(device)) => {
                // Remembered; subscribed once connected.
                task.current_device = Some(device);
                continue;
            }
            Some(Command::Disconnect) => continue,
        }

        task.retry.reset();
        loop {
            match task.run_connection().await {
                CycleEnd::Reconnect => {}
                CycleEnd::Disconnected => {
                    tracing::info!("broker connection closed by request");
                    continue 'idle;
                }
                CycleEnd::CircuitOpen => {
                    tracing::error!(
                        failures = task.retry.failures(),
                        "giving up on automatic reconnect, call connect() to resume"
                    );
                    continue 'idle;
                }
                CycleEnd::AuthFailed => continue 'idle,
                CycleEnd::Shutdown => return,
            }
        }
    }
}

impl StreamTask {
    /// One connection attempt: build a client with a freshly read token,
    /// poll until the connection dies or is told to stop.
    async fn run_connection(&mut self) -> CycleEnd {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);
        if let Some(token) = self.store.access_token() {
            options.set_credentials("jwt", token);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let mut connected = false;
        let mut pending: Option<PendingSubscribe> = None;

        loop {
            let retry_at = pending.as_ref().map(|p| p.at);
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None => return CycleEnd::Shutdown,
                    // connect() while connecting/connected is a no-op.
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => {
                        if connected {
                            self.unsubscribe_current(&client).await;
                            self.emit_connection(false);
                        }
                        let _ = client.disconnect().await;
                        return CycleEnd::Disconnected;
                    }
                    Some(Command::Subscribe(device)) => {
                        self.switch_device(&client, connected, device, &mut pending).await;
                    }
                },
                () = async { tokio::time::sleep_until(retry_at.expect("guarded")).await },
                        if retry_at.is_some() => {
                    let p = pending.take().expect("guarded");
                    self.retry_subscribe(&client, connected, p, &mut pending).await;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected = true;
                        self.retry.on_connected();
                        tracing::info!(
                            host = %self.config.host,
                            port = self.config.port,
                            "broker connected"
                        );
                        self.emit_connection(true);
                        // Server-side subscriptions do not survive a
                        // reconnect; re-issue for the current device.
                        pending = None;
                        if let Some(device) = self.current_device.clone() {
                            self.subscribe_device(&client, &device).await;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatch(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::warn!("broker sent disconnect");
                        if connected {
                            self.emit_connection(false);
                        }
                        return self.handle_failure().await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected {
                            self.emit_connection(false);
                        }
                        if is_auth_rejection(&e) {
                            tracing::error!(error = %e, "broker rejected credentials");
                            return self.handle_auth_rejection().await;
                        }
                        tracing::warn!(
                            error = %e,
                            failures = self.retry.failures() + 1,
                            "broker connection error"
                        );
                        return self.handle_failure().await;
                    }
                }
            }
        }
    }

    /// Abnormal close: consult the retry state, serve the backoff (staying
    /// responsive to disconnect), optionally refresh credentials.
    async fn handle_failure(&mut self) -> CycleEnd {
        match self.retry.on_abnormal_close(&self.config.reconnect) {
            FailureAction::CircuitOpen => CycleEnd::CircuitOpen,
            FailureAction::Backoff { delay, refresh } => {
                if refresh {
                    match self.auth.refresh().await {
                        Ok(()) => tracing::info!("credentials refreshed before reconnect"),
                        Err(e) => {
                            tracing::warn!(error = %e, "credential refresh during reconnect failed");
                        }
                    }
                }
                tracing::info!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                let deadline = Instant::now() + delay;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return CycleEnd::Reconnect,
                        cmd = self.commands.recv() => match cmd {
                            None => return CycleEnd::Shutdown,
                            Some(Command::Disconnect) => return CycleEnd::Disconnected,
                            // Explicit connect() skips the remaining backoff.
                            Some(Command::Connect) => return CycleEnd::Reconnect,
                            Some(Command::Subscribe(device)) => {
                                self.current_device = Some(device);
                            }
                        }
                    }
                }
            }
        }
    }

    /// The broker said NotAuthorized: credentials are presumed invalid, not
    /// merely expired. One refresh attempt, then logout.
    async fn handle_auth_rejection(&mut self) -> CycleEnd {
        if self.retry.try_claim_refresh() {
            match self.auth.refresh().await {
                Ok(()) => {
                    tracing::info!("credentials refreshed after broker rejection, reconnecting");
                    return CycleEnd::Reconnect;
                }
                Err(e) => tracing::error!(error = %e, "credential refresh failed"),
            }
        }
        self.store.clear();
        self.emit(AgentEvent::AuthRequired);
        CycleEnd::AuthFailed
    }

    /// Replace the active device subscription. When the connection is not
    /// ready the request is parked and retried with backoff until it is —
    /// or until the selection changes again.
    async fn switch_device(
        &mut self,
        client: &AsyncClient,
        connected: bool,
        device_id: String,
        pending: &mut Option<PendingSubscribe>,
    ) {
        if self.current_device.as_deref() == Some(device_id.as_str()) {
            return;
        }
        // A stale retry must never subscribe to the wrong device.
        *pending = None;

        let previous = self.current_device.replace(device_id.clone());
        if connected {
            if let Some(old) = previous {
                self.unsubscribe_topics(client, &old).await;
            }
            self.subscribe_device(client, &device_id).await;
        } else {
            *pending = Some(PendingSubscribe {
                device_id,
                attempt: 0,
                at: Instant::now() + self.config.subscribe.backoff(0),
            });
        }
    }

    async fn retry_subscribe(
        &mut self,
        client: &AsyncClient,
        connected: bool,
        expired: PendingSubscribe,
        pending: &mut Option<PendingSubscribe>,
    ) {
        // Selection moved on while this retry was sleeping.
        if self.current_device.as_deref() != Some(expired.device_id.as_str()) {
            return;
        }
        if connected {
            self.subscribe_device(client, &expired.device_id).await;
            return;
        }
        match self.config.subscribe.next_attempt(expired.attempt) {
            Some((attempt, delay)) => {
                *pending = Some(PendingSubscribe {
                    device_id: expired.device_id,
                    attempt,
                    at: Instant::now() + delay,
                });
            }
            None => {
                tracing::warn!(
                    device = %expired.device_id,
                    attempts = self.config.subscribe.max_attempts,
                    "subscription retries exhausted, will subscribe on next connect"
                );
            }
        }
    }

    async fn subscribe_device(&self, client: &AsyncClient, device_id: &str) {
        for filter in [
            normalize::stream_filter(device_id),
            normalize::state_filter(device_id),
        ] {
            match client.subscribe(&filter, QoS::AtLeastOnce).await {
                Ok(()) => tracing::info!(topic = %filter, "subscribed"),
                Err(e) => tracing::warn!(topic = %filter, error = %e, "subscribe failed"),
            }
        }
    }

    async fn unsubscribe_current(&self, client: &AsyncClient) {
        if let Some(device) = self.current_device.clone() {
            self.unsubscribe_topics(client, &device).await;
        }
    }

    async fn unsubscribe_topics(&self, client: &AsyncClient, device_id: &str) {
        for filter in [
            normalize::stream_filter(device_id),
            normalize::state_filter(device_id),
        ] {
            if let Err(e) = client.unsubscribe(&filter).await {
                tracing::debug!(topic = %filter, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Parse, guard, normalize, forward. Runs on the single ordered
    /// dispatch path — never concurrently for one device.
    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let Some((device_id, channel, remainder)) = normalize::parse_topic(topic) else {
            tracing::debug!(topic, "unhandled broker topic");
            return;
        };
        if self.current_device.as_deref() != Some(device_id) {
            tracing::trace!(topic, "late message for unselected device");
            return;
        }
        for update in normalize::normalize(channel, remainder, payload) {
            let inbound = Inbound {
                device_id: device_id.to_string(),
                update,
            };
            if self.inbound.try_send(inbound).is_err() {
                tracing::warn!("inbound queue full, dropping update");
            }
        }
    }

    fn emit_connection(&self, connected: bool) {
        self.emit(AgentEvent::Connection { connected });
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

fn is_auth_rejection(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword
        )
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- reconnect backoff ---------------------------------------------------

    #[test]
    fn backoff_grows_with_consecutive_failures() {
        let policy = ReconnectPolicy::default();
        assert!(policy.backoff(3) > policy.backoff(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        let policy = ReconnectPolicy::default();
        for failures in 1..100 {
            assert!(policy.backoff(failures) <= policy.max_delay);
        }
        assert_eq!(policy.backoff(99), policy.max_delay);
    }

    #[test]
    fn backoff_is_multiplicative() {
        let policy = ReconnectPolicy::default();
        // base * growth^(n-1): 5s, 7.5s, 11.25s
        assert_eq!(policy.backoff(2), Duration::from_secs_f64(7.5));
        assert_eq!(policy.backoff(3), Duration::from_secs_f64(11.25));
    }

    // -- retry state ---------------------------------------------------------

    #[test]
    fn refresh_requested_once_after_threshold() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::new();

        let refreshes: Vec<bool> = (0..5)
            .map(|_| match retry.on_abnormal_close(&policy) {
                FailureAction::Backoff { refresh, .. } => refresh,
                FailureAction::CircuitOpen => panic!("circuit should not open yet"),
            })
            .collect();
        // Only the third consecutive failure claims the refresh slot.
        assert_eq!(refreshes, vec![false, false, true, false, false]);
    }

    #[test]
    fn successful_connect_rearms_refresh() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::new();
        for _ in 0..3 {
            retry.on_abnormal_close(&policy);
        }
        retry.on_connected();
        assert_eq!(retry.failures(), 0);

        let third_again = (0..3)
            .map(|_| retry.on_abnormal_close(&policy))
            .last()
            .unwrap();
        assert_eq!(
            third_again,
            FailureAction::Backoff {
                delay: policy.backoff(3),
                refresh: true
            }
        );
    }

    #[test]
    fn circuit_opens_at_failure_cap() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::new();
        for _ in 0..policy.max_failures - 1 {
            assert!(matches!(
                retry.on_abnormal_close(&policy),
                FailureAction::Backoff { .. }
            ));
        }
        assert_eq!(
            retry.on_abnormal_close(&policy),
            FailureAction::CircuitOpen
        );
    }

    #[test]
    fn explicit_reset_rearms_a_tripped_circuit() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::new();
        for _ in 0..policy.max_failures {
            retry.on_abnormal_close(&policy);
        }
        retry.reset();
        assert!(matches!(
            retry.on_abnormal_close(&policy),
            FailureAction::Backoff { .. }
        ));
    }

    #[test]
    fn refresh_slot_is_claimed_exactly_once() {
        let mut retry = RetryState::new();
        assert!(retry.try_claim_refresh());
        assert!(!retry.try_claim_refresh());
        retry.on_connected();
        assert!(retry.try_claim_refresh());
    }

    // -- subscription retry ---------------------------------------------------

    #[test]
    fn subscribe_backoff_grows_and_caps() {
        let policy = SubscribePolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert!(policy.backoff(3) > policy.backoff(1));
        for attempt in 0..50 {
            assert!(policy.backoff(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn subscribe_retries_are_bounded() {
        let policy = SubscribePolicy::default();
        let mut attempt = 0;
        let mut scheduled = 1; // the initial attempt
        while let Some((next, _delay)) = policy.next_attempt(attempt) {
            attempt = next;
            scheduled += 1;
        }
        assert_eq!(scheduled, policy.max_attempts);
    }
}
