//! TOML config file loading, validation, and database seeding for plants.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::db::{self, Db};
use crate::models::NewPlant;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub commands: CommandSettings,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CommandSettings {
    /// How long a polled pump command stays claimed before another poll may
    /// hand it out again.
    #[serde(default = "default_claim_ttl_sec")]
    pub claim_ttl_sec: i64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            claim_ttl_sec: default_claim_ttl_sec(),
        }
    }
}

/// Upper bound on the claim lease.
const MAX_CLAIM_TTL_SEC: i64 = 7 * 24 * 60 * 60;

fn default_claim_ttl_sec() -> i64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub name: String,
    pub plant_type: String,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub min_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
    pub min_soil_moisture: Option<f64>,
    pub max_soil_moisture: Option<f64>,
}

impl From<&PlantEntry> for NewPlant {
    fn from(p: &PlantEntry) -> Self {
        NewPlant {
            name: p.name.clone(),
            plant_type: p.plant_type.clone(),
            min_temp: p.min_temp,
            max_temp: p.max_temp,
            min_humidity: p.min_humidity,
            max_humidity: p.max_humidity,
            min_soil_moisture: p.min_soil_moisture,
            max_soil_moisture: p.max_soil_moisture,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let ttl = self.commands.claim_ttl_sec;
        if ttl <= 0 {
            errors.push(format!("commands: claim_ttl_sec must be positive, got {ttl}"));
        } else if ttl > MAX_CLAIM_TTL_SEC {
            errors.push(format!(
                "commands: claim_ttl_sec must be at most {MAX_CLAIM_TTL_SEC} (7 days), got {ttl}"
            ));
        }

        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = if p.name.trim().is_empty() {
                format!("plants[{i}]")
            } else {
                format!("plant '{}'", p.name)
            };

            if !p.name.trim().is_empty() && !seen_names.insert(p.name.as_str()) {
                errors.push(format!("{ctx}: duplicate plant name"));
            }

            for violation in NewPlant::from(p).violations() {
                errors.push(format!("{ctx}: {violation}"));
            }
        }
    }

    pub fn claim_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.commands.claim_ttl_sec)
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults (no seed plants).
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Insert every configured plant whose name is not yet in the database.
/// Existing plants are left alone; the registry API owns them after the
/// first start. Returns the number of plants inserted.
pub async fn apply(config: &Config, db: &Db) -> Result<usize> {
    let mut inserted = 0;

    for p in &config.plants {
        if db::find_plant_by_name(db.pool(), &p.name)
            .await
            .with_context(|| format!("failed to look up plant '{}'", p.name))?
            .is_some()
        {
            continue;
        }

        db::insert_plant(db.pool(), &NewPlant::from(p))
            .await
            .with_context(|| format!("failed to seed plant '{}'", p.name))?;
        inserted += 1;
    }

    tracing::info!(
        plants = config.plants.len(),
        inserted,
        claim_ttl_sec = config.commands.claim_ttl_sec,
        "config applied"
    );

    Ok(inserted)
}

// ===========================================================================
// Tests
// ===========================================================================
