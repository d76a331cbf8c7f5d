mod config;
mod db;
mod error;
mod evaluator;
mod farm;
mod models;
mod mqtt;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use db::Db;
use farm::Farm;
use models::Caller;
use mqtt::{extract_plant_id, parse_telemetry, TELEMETRY_TOPIC};
use state::{HubState, SharedState};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("smartfarm_hub=info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:smartfarm.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env_or("WEB_PORT", 8080);
    let mqtt_host = env::var("MQTT_HOST").ok().filter(|h| !h.is_empty());
    let mqtt_port: u16 = env_or("MQTT_PORT", 1883);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed plants) ───────────────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    let farm = Farm::new(db, cfg.claim_ttl());
    let plants = farm.list_plants().await?;
    if plants.is_empty() {
        tracing::warn!("no plants registered yet");
    }
    tracing::info!(
        plants = plants.len(),
        claim_ttl_sec = farm.claim_ttl().whole_seconds(),
        "db ready"
    );

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = HubState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        farm: farm.clone(),
        shared: shared.clone(),
    };
    let web_task = tokio::spawn(web::serve(app, web_port));

    // ── MQTT ────────────────────────────────────────────────────────
    let Some(broker) = mqtt_host else {
        tracing::info!("MQTT_HOST not set, telemetry ingest over MQTT disabled");
        return web_task.await?;
    };

    run_mqtt(&broker, mqtt_port, &farm, &shared).await
}

async fn run_mqtt(broker: &str, port: u16, farm: &Farm, shared: &SharedState) -> Result<()> {
    let mut mqttoptions = MqttOptions::new("smartfarm-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client.subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce).await?;
    tracing::info!(broker, port, topic = TELEMETRY_TOPIC, "hub subscribed");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(plant_id) = extract_plant_id(&p.topic) else {
                    tracing::debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };

                let reading = match parse_telemetry(&p.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(topic = %p.topic, "{e}");
                        shared.write().await.record_error(e);
                        continue;
                    }
                };

                match farm
                    .record_telemetry(&Caller::device(plant_id), plant_id, &reading)
                    .await
                {
                    Ok(recorded) => {
                        shared
                            .write()
                            .await
                            .record_reading(&recorded.log, &recorded.alerts);
                    }
                    Err(e) => {
                        tracing::warn!(plant_id, "telemetry rejected: {e}");
                        shared
                            .write()
                            .await
                            .record_error(format!("plant {plant_id}: telemetry rejected: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
