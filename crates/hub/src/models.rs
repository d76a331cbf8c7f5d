//! Domain records shared by the database layer, the core service and the
//! HTTP transport.
//!
//! Child records (status logs, alerts, pump commands, watering logs) carry a
//! plain `plant_id` foreign key. Resolving the owning plant is always an
//! explicit lookup through the registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::FarmError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Measured dimension of a reading (and of an alert).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temp,
    Humidity,
    SoilMoisture,
}

impl SensorType {
    /// Evaluation order for a reading.
    pub const ALL: [SensorType; 3] = [SensorType::Temp, SensorType::Humidity, SensorType::SoilMoisture];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::Temp => "temp",
            SensorType::Humidity => "humidity",
            SensorType::SoilMoisture => "soil_moisture",
        }
    }
}

/// Which side of the tolerance envelope was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdType {
    Min,
    Max,
}

impl ThresholdType {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdType::Min => "min",
            ThresholdType::Max => "max",
        }
    }
}

/// How a watering was requested or performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Auto,
    Manual,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Auto => "auto",
            Method::Manual => "manual",
        }
    }
}

/// Pump command lifecycle.
///
/// ```text
/// PENDING ──[poll]──▶ CLAIMED ──[ack]──▶ EXECUTED
///    │                   │
///    │                   └──[lease expired, next poll]──▶ CLAIMED
///    └──────────────────[ack]──────────────────────────▶ EXECUTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Claimed,
    Executed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Claimed => "CLAIMED",
            CommandStatus::Executed => "EXECUTED",
        }
    }
}

macro_rules! impl_enum_text {
    ($ty:ty, $what:literal, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = FarmError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| FarmError::InvalidInput(format!("unknown {} '{s}'", $what)))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_enum_text!(SensorType, "sensor type", [SensorType::Temp, SensorType::Humidity, SensorType::SoilMoisture]);
impl_enum_text!(ThresholdType, "threshold type", [ThresholdType::Min, ThresholdType::Max]);
impl_enum_text!(Method, "method", [Method::Auto, Method::Manual]);
impl_enum_text!(
    CommandStatus,
    "command status",
    [CommandStatus::Pending, CommandStatus::Claimed, CommandStatus::Executed]
);

// ---------------------------------------------------------------------------
// Plant registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plant {
    pub id: i64,
    pub name: String,
    pub plant_type: String,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub min_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
    pub min_soil_moisture: Option<f64>,
    pub max_soil_moisture: Option<f64>,
}

impl Plant {
    /// `(min, max)` tolerance bounds for one dimension.
    pub fn bounds(&self, sensor: SensorType) -> (Option<f64>, Option<f64>) {
        match sensor {
            SensorType::Temp => (self.min_temp, self.max_temp),
            SensorType::Humidity => (self.min_humidity, self.max_humidity),
            SensorType::SoilMoisture => (self.min_soil_moisture, self.max_soil_moisture),
        }
    }
}

/// Identity and tolerance envelope for a plant that has no id yet (create),
/// or the full replacement for an existing one (update).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlant {
    pub name: String,
    pub plant_type: String,
    #[serde(default)]
    pub min_temp: Option<f64>,
    #[serde(default)]
    pub max_temp: Option<f64>,
    #[serde(default)]
    pub min_humidity: Option<f64>,
    #[serde(default)]
    pub max_humidity: Option<f64>,
    #[serde(default)]
    pub min_soil_moisture: Option<f64>,
    #[serde(default)]
    pub max_soil_moisture: Option<f64>,
}

impl NewPlant {
    pub fn bounds(&self, sensor: SensorType) -> (Option<f64>, Option<f64>) {
        match sensor {
            SensorType::Temp => (self.min_temp, self.max_temp),
            SensorType::Humidity => (self.min_humidity, self.max_humidity),
            SensorType::SoilMoisture => (self.min_soil_moisture, self.max_soil_moisture),
        }
    }

    /// Every violation found, empty when the plant is well-formed.
    ///
    /// An inverted envelope (`min > max`) is rejected: under the evaluator's
    /// min-then-max rule it would silently hide every max breach.
    pub fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name is empty".to_string());
        }
        if self.plant_type.trim().is_empty() {
            errors.push("plant_type is empty".to_string());
        }

        for sensor in SensorType::ALL {
            let (min, max) = self.bounds(sensor);
            for (side, bound) in [("min", min), ("max", max)] {
                if let Some(v) = bound {
                    if !v.is_finite() {
                        errors.push(format!("{side} {sensor} bound is not a finite number"));
                    }
                }
            }
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    errors.push(format!("{sensor}: min ({lo}) is greater than max ({hi})"));
                }
            }
        }

        errors
    }

    pub fn validate(&self) -> Result<(), FarmError> {
        let errors = self.violations();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FarmError::InvalidInput(errors.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// One incoming sensor payload. Any subset of the measurements may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub soil_moisture: Option<f64>,
    /// Device-side measurement time; server time is used when absent.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

impl Reading {
    pub fn value(&self, sensor: SensorType) -> Option<f64> {
        match sensor {
            SensorType::Temp => self.temperature,
            SensorType::Humidity => self.humidity,
            SensorType::SoilMoisture => self.soil_moisture,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLog {
    pub id: i64,
    pub plant_id: i64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: i64,
    pub plant_id: i64,
    pub sensor_type: SensorType,
    pub value: f64,
    pub threshold_type: ThresholdType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A stored reading together with the alerts it raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedReading {
    pub log: StatusLog,
    pub alerts: Vec<Alert>,
}

// ---------------------------------------------------------------------------
// Irrigation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpCommand {
    pub id: i64,
    pub plant_id: i64,
    pub amount_ml: i64,
    pub method: Method,
    pub status: CommandStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub executed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WateringLog {
    pub id: i64,
    pub plant_id: i64,
    pub amount_ml: i64,
    pub method: Method,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Caller identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Who is invoking a mutating operation. Resolved once at the transport
/// boundary and passed explicitly into the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", Role::User)
    }

    /// Identity used for telemetry arriving from a field device.
    pub fn device(plant_id: i64) -> Self {
        Self::new(format!("mqtt:{plant_id}"), Role::User)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::User => "user",
            Role::Admin => "admin",
        };
        write!(f, "{}({role})", self.id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
