use serde::Deserialize;
use time::OffsetDateTime;

use crate::models::Reading;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Telemetry payload published by a field sensor agent. Every measurement
/// is optional; `ts` is unix seconds on the device clock.
#[derive(Debug, Deserialize)]
pub(crate) struct TelemetryMsg {
    #[serde(default)]
    pub(crate) ts: Option<i64>,
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) humidity: Option<f64>,
    #[serde(default)]
    pub(crate) soil_moisture: Option<f64>,
}

impl TelemetryMsg {
    pub(crate) fn into_reading(self) -> Result<Reading, String> {
        let timestamp = self
            .ts
            .map(|ts| {
                OffsetDateTime::from_unix_timestamp(ts)
                    .map_err(|e| format!("bad telemetry ts {ts}: {e}"))
            })
            .transpose()?;

        Ok(Reading {
            temperature: self.temperature,
            humidity: self.humidity,
            soil_moisture: self.soil_moisture,
            timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub(crate) const TELEMETRY_TOPIC: &str = "tele/+/reading";

/// Extract the plant id from "tele/<plant_id>/reading".
pub(crate) fn extract_plant_id(topic: &str) -> Option<i64> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" {
        parts[1].parse().ok()
    } else {
        None
    }
}

pub(crate) fn parse_telemetry(payload: &[u8]) -> Result<Reading, String> {
    let msg: TelemetryMsg =
        serde_json::from_slice(payload).map_err(|e| format!("bad telemetry json: {e}"))?;
    msg.into_reading()
}

// ===========================================================================
// Tests
// ===========================================================================
