mod api;
mod auth;
mod config;
mod normalize;
mod pump;
mod session;
mod stream;
mod threshold;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, ApiError};
use auth::{AuthClient, TokenStore};
use session::{AgentEvent, DeviceSession, PumpRequest, SessionCommand};
use stream::{ReconnectPolicy, StreamConfig, SubscribePolicy};
use threshold::Severity;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = Arc::new(config::load(&config_path)?);
    if cfg.devices.is_empty() {
        warn!("no devices configured, agent will idle until one is selected");
    }

    // ── Credentials ─────────────────────────────────────────────────
    let store = Arc::new(TokenStore::with_cache(&cfg.auth.token_cache));
    let api_timeout = Duration::from_secs(cfg.api.timeout_secs);
    let auth = AuthClient::new(&cfg.api.base_url, Arc::clone(&store), api_timeout)?;
    match auth.login_from_env().await {
        Ok(true) => {}
        Ok(false) => warn!(
            "no {}/{} in environment, relying on cached tokens",
            auth::EMAIL_ENV,
            auth::SECRET_ENV
        ),
        Err(e) => warn!(error = %e, "auto-login failed, continuing with cached tokens"),
    }

    let api = Arc::new(ApiClient::new(
        &cfg.api.base_url,
        Arc::clone(&store),
        auth.clone(),
        api_timeout,
    )?);

    // ── Session task ────────────────────────────────────────────────
    let (session, channels) = DeviceSession::new(Arc::clone(&cfg));
    let events = channels.events.clone();
    let (session_tx, session_rx) = mpsc::channel::<SessionCommand>(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(stream::inbound_queue_capacity());
    tokio::spawn(session::run(session, session_rx, inbound_rx));

    // ── Stream connection ───────────────────────────────────────────
    let stream_cfg = StreamConfig {
        host: cfg.broker.host.clone(),
        port: cfg.broker.port,
        client_id: "greenhouse-agent".to_string(),
        keep_alive: Duration::from_secs(cfg.broker.keep_alive_secs),
        reconnect: ReconnectPolicy::default(),
        subscribe: SubscribePolicy::default(),
    };
    let stream = stream::spawn(
        stream_cfg,
        Arc::clone(&store),
        auth.clone(),
        inbound_tx,
        events.clone(),
    );

    // ── Pump command dispatcher ─────────────────────────────────────
    tokio::spawn(dispatch_pump_commands(
        channels.pump_requests,
        Arc::clone(&api),
        events.clone(),
    ));

    // ── Periodic history refresh ────────────────────────────────────
    tokio::spawn(refresh_history(
        channels.selection.clone(),
        Arc::clone(&api),
        Duration::from_secs(cfg.api.history_refresh_secs),
    ));

    // ── Connect and select the initial device ───────────────────────
    stream.connect().await;
    if let Some(device) = cfg.initial_device() {
        info!(device = %device.device_id, name = %device.name, "selecting device");
        let _ = session_tx
            .send(SessionCommand::SelectDevice(device.device_id.clone()))
            .await;
        stream.subscribe(&device.device_id).await;
    }

    // ── Event bus consumer (the process's alert sink) ───────────────
    let mut bus = events.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                stream.disconnect().await;
                break;
            }
            event = bus.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event bus lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

fn log_event(event: &AgentEvent) {
    match event {
        AgentEvent::Connection { connected: true } => info!("stream connected"),
        AgentEvent::Connection { connected: false } => warn!("stream disconnected"),
        AgentEvent::Alert(alert) => match alert.severity {
            Severity::Critical => error!(
                device = %alert.device_id,
                sensor = %alert.kind,
                value = alert.value,
                "critical sensor alert"
            ),
            Severity::Warning => warn!(
                device = %alert.device_id,
                sensor = %alert.kind,
                value = alert.value,
                "sensor warning"
            ),
        },
        AgentEvent::StateChanged { device_id, state } => {
            debug!(device = %device_id, ?state, "device state updated");
        }
        AgentEvent::CommandFailed { device_id, detail } => {
            warn!(device = %device_id, detail = %detail, "command failed");
        }
        AgentEvent::AuthRequired => error!(
            "re-authentication required, set {}/{} and restart",
            auth::EMAIL_ENV,
            auth::SECRET_ENV
        ),
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Deliver queued pump commands over HTTP. Fire-and-forget: a failure is
/// logged and surfaced once; the controller's next evaluation naturally
/// re-attempts while the desired state still differs.
async fn dispatch_pump_commands(
    mut requests: mpsc::Receiver<PumpRequest>,
    api: Arc<ApiClient>,
    events: broadcast::Sender<AgentEvent>,
) {
    while let Some(request) = requests.recv().await {
        match api
            .update_pump_status(&request.device_id, request.status, request.moisture)
            .await
        {
            Ok(()) => info!(
                device = %request.device_id,
                status = %request.status,
                mode = %request.mode,
                "pump command delivered"
            ),
            Err(ApiError::SessionExpired) => {
                let _ = events.send(AgentEvent::AuthRequired);
            }
            Err(e) => {
                warn!(device = %request.device_id, error = %e, "pump command failed");
                let _ = events.send(AgentEvent::CommandFailed {
                    device_id: request.device_id.clone(),
                    detail: e.to_string(),
                });
            }
        }
    }
}

/// Re-fetch historical stream data for the selected device on a fixed
/// interval. The selection is re-read on every tick and re-checked after
/// the fetch — the world may have changed while the timer slept.
async fn refresh_history(
    mut selection: watch::Receiver<String>,
    api: Arc<ApiClient>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let device = selection.borrow_and_update().clone();
        if device.is_empty() {
            continue;
        }
        match api.all_stream_data(&device, None, None).await {
            Ok(points) => {
                if *selection.borrow() != device {
                    continue; // selection moved while the fetch was in flight
                }
                debug!(device = %device, points = points.len(), "historical data refreshed");
            }
            Err(ApiError::NotAuthenticated | ApiError::SessionExpired) => {
                debug!("history refresh skipped, not authenticated");
            }
            Err(e) => warn!(device = %device, error = %e, "history refresh failed"),
        }
    }
}
