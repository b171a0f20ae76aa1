mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::{env, time::Duration};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{GreenhouseSim, Profile};

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Parse a pump command payload `{"power": "on"|"off", "mode"?: "..."}`.
fn parse_pump_command(payload: &[u8]) -> Result<(bool, Option<String>), String> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| format!("bad command json: {e}"))?;
    let power = value
        .get("power")
        .and_then(Value::as_str)
        .ok_or_else(|| "command missing 'power'".to_string())?;
    let on = match power.trim().to_ascii_lowercase().as_str() {
        "on" => true,
        "off" => false,
        other => return Err(format!("unknown power value '{other}'")),
    };
    let mode = value
        .get("mode")
        .and_then(Value::as_str)
        .map(|m| m.trim().to_ascii_lowercase());
    Ok((on, mode))
}

async fn publish(client: &AsyncClient, topic: &str, body: &Value) {
    if let Err(e) = client
        .publish(topic, QoS::AtLeastOnce, false, body.to_string())
        .await
    {
        warn!(topic, error = %e, "publish failed");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "GH-A1".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);
    let profile = Profile::from_str_lossy(&env::var("SIM_PROFILE").unwrap_or_default());

    let client_id = format!("greenhouse-node-{device_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let command_topic = format!("protonest/{device_id}/state/pmc/pump");
    let stream_topic = format!("protonest/{device_id}/stream");
    let state_topic = format!("protonest/{device_id}/state");

    info!(device = %device_id, %profile, sample_every_s, "greenhouse node starting");

    let mut sim = GreenhouseSim::new(profile);
    let mut mode = "auto".to_string();
    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s));
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = sim.tick();
                ticks += 1;

                // Consolidated snapshot every tick.
                let batch = json!({
                    "payload": {
                        "moisture": round1(snap.moisture),
                        "temperature": round1(snap.temperature),
                        "humidity": round1(snap.humidity),
                        "light": round1(snap.light),
                        "battery": round1(snap.battery),
                    },
                    "timestamp": now_rfc3339(),
                });
                publish(&client, &stream_topic, &batch).await;

                // Every fourth tick, also a single-sensor push the way
                // older firmware reports it: string-encoded value under a
                // per-sensor topic.
                if ticks % 4 == 0 {
                    let single = json!({
                        "topic": "pmc/moisture",
                        "payload": { "moisture": format!("{:.1}", snap.moisture) },
                        "timestamp": now_rfc3339(),
                    });
                    publish(&client, &format!("{stream_topic}/pmc/moisture"), &single).await;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to broker");
                    // Subscriptions do not survive reconnects.
                    if let Err(e) = client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                        warn!(error = %e, "command subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match parse_pump_command(&p.payload) {
                        Ok((on, new_mode)) => {
                            sim.set_pump(on);
                            if let Some(m) = new_mode {
                                mode = m;
                            }
                            info!(pump = on, mode = %mode, "pump command received");
                            // Echo the authoritative state back.
                            let state = json!({
                                "payload": {
                                    "pump": if on { "on" } else { "off" },
                                    "mode": mode,
                                },
                                "timestamp": now_rfc3339(),
                            });
                            publish(&client, &state_topic, &state).await;
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed pump command"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
