//! Threshold evaluation: compares a reading against the owning plant's
//! tolerance envelope.
//!
//! Pure decision logic. Persisting the resulting breaches is the caller's
//! job (see `farm::Farm::record_telemetry`).

use crate::models::{Plant, Reading, SensorType, ThresholdType};

/// One dimension of a reading outside the plant's configured bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    pub sensor_type: SensorType,
    pub value: f64,
    pub threshold_type: ThresholdType,
}

/// Returns at most one breach per dimension, in temp, humidity,
/// soil-moisture order.
///
/// For each dimension: a value strictly below a defined min is a `Min`
/// breach; otherwise a value strictly above a defined max is a `Max` breach.
/// Missing values and undefined bounds never produce a breach.
pub fn evaluate(plant: &Plant, reading: &Reading) -> Vec<Breach> {
    SensorType::ALL
        .into_iter()
        .filter_map(|sensor| check(sensor, reading.value(sensor), plant.bounds(sensor)))
        .collect()
}

fn check(
    sensor_type: SensorType,
    value: Option<f64>,
    (min, max): (Option<f64>, Option<f64>),
) -> Option<Breach> {
    let value = value?;

    let threshold_type = match (min, max) {
        (Some(lo), _) if value < lo => ThresholdType::Min,
        (_, Some(hi)) if value > hi => ThresholdType::Max,
        _ => return None,
    };

    Some(Breach {
        sensor_type,
        value,
        threshold_type,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
