use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::models::{Alert, PumpCommand, StatusLog, WateringLog};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral hub status for operators. Nothing here is authoritative; the
/// database is.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub plants: HashMap<i64, PlantActivity>,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantActivity {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_alert: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_watering: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Alert,
    Command,
    Watering,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub plants: HashMap<i64, PlantActivity>,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            plants: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a stored reading and any alerts it raised.
    pub fn record_reading(&mut self, log: &StatusLog, alerts: &[Alert]) {
        let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v}"));
        let detail = format!(
            "plant {}: temp={} humidity={} soil={}",
            log.plant_id,
            fmt(log.temperature),
            fmt(log.humidity),
            fmt(log.soil_moisture)
        );

        let activity = self.plants.entry(log.plant_id).or_default();
        activity.last_reading = Some(log.timestamp);
        self.push_event(EventKind::Reading, detail);

        for a in alerts {
            self.plants.entry(a.plant_id).or_default().last_alert = Some(a.timestamp);
            self.push_event(
                EventKind::Alert,
                format!(
                    "plant {}: {} {} breached ({})",
                    a.plant_id, a.sensor_type, a.threshold_type, a.value
                ),
            );
        }
    }

    /// Record a pump command lifecycle step ("queued", "claimed", ...).
    pub fn record_command(&mut self, cmd: &PumpCommand, action: &str) {
        self.push_event(
            EventKind::Command,
            format!(
                "command {} for plant {} {action} ({} ml, {})",
                cmd.id, cmd.plant_id, cmd.amount_ml, cmd.method
            ),
        );
    }

    pub fn record_watering(&mut self, log: &WateringLog) {
        self.plants.entry(log.plant_id).or_default().last_watering = Some(log.timestamp);
        self.push_event(
            EventKind::Watering,
            format!("plant {} watered {} ml ({})", log.plant_id, log.amount_ml, log.method),
        );
    }

    /// Drop the activity entry of a deleted plant.
    pub fn forget_plant(&mut self, plant_id: i64) {
        if self.plants.remove(&plant_id).is_some() {
            self.push_event(EventKind::System, format!("plant {plant_id} removed"));
        }
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            plants: self.plants.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
