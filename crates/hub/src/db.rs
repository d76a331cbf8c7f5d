use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteExecutor, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{FromRow, Pool, Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::evaluator::Breach;
use crate::models::{
    Alert, CommandStatus, Method, NewPlant, Plant, PumpCommand, Reading, SensorType, StatusLog,
    WateringLog,
};

/// How long a writer waits for the SQLite write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/smartfarm/smartfarm.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn begin(&self) -> sqlx::Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await
    }
}

/// Timestamps are stored as unix microseconds. Anything finer is floored,
/// so a stored instant is never later than the one it came from.
pub fn micros(ts: OffsetDateTime) -> i64 {
    // Always in range: OffsetDateTime spans +-9999 years.
    ts.unix_timestamp_nanos().div_euclid(1_000) as i64
}

fn from_micros(us: i64) -> Result<OffsetDateTime, time::error::ComponentRange> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(us) * 1_000)
}

// ----------------------------
// Row mapping
// ----------------------------

/// True when `err` is SQLite refusing a row whose parent does not exist.
pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_foreign_key_violation())
}

fn decode_err(col: &str, source: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: Box::new(source),
    }
}

fn ts_col(row: &SqliteRow, col: &str) -> sqlx::Result<OffsetDateTime> {
    let us: i64 = row.try_get(col)?;
    from_micros(us).map_err(|e| decode_err(col, e))
}

fn opt_ts_col(row: &SqliteRow, col: &str) -> sqlx::Result<Option<OffsetDateTime>> {
    let us: Option<i64> = row.try_get(col)?;
    us.map(|us| from_micros(us).map_err(|e| decode_err(col, e)))
        .transpose()
}

fn enum_col<T: FromStr>(row: &SqliteRow, col: &str) -> sqlx::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.try_get(col)?;
    s.parse().map_err(|e| decode_err(col, e))
}

impl FromRow<'_, SqliteRow> for Plant {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Plant {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            plant_type: row.try_get("plant_type")?,
            min_temp: row.try_get("min_temp")?,
            max_temp: row.try_get("max_temp")?,
            min_humidity: row.try_get("min_humidity")?,
            max_humidity: row.try_get("max_humidity")?,
            min_soil_moisture: row.try_get("min_soil_moisture")?,
            max_soil_moisture: row.try_get("max_soil_moisture")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for StatusLog {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(StatusLog {
            id: row.try_get("id")?,
            plant_id: row.try_get("plant_id")?,
            temperature: row.try_get("temperature")?,
            humidity: row.try_get("humidity")?,
            soil_moisture: row.try_get("soil_moisture")?,
            timestamp: ts_col(row, "ts")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for Alert {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Alert {
            id: row.try_get("id")?,
            plant_id: row.try_get("plant_id")?,
            sensor_type: enum_col(row, "sensor_type")?,
            value: row.try_get("value")?,
            threshold_type: enum_col(row, "threshold_type")?,
            timestamp: ts_col(row, "ts")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for PumpCommand {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(PumpCommand {
            id: row.try_get("id")?,
            plant_id: row.try_get("plant_id")?,
            amount_ml: row.try_get("amount_ml")?,
            method: enum_col(row, "method")?,
            status: enum_col(row, "status")?,
            created_at: ts_col(row, "created_at")?,
            scheduled_time: opt_ts_col(row, "scheduled_time")?,
            claimed_at: opt_ts_col(row, "claimed_at")?,
            executed_at: opt_ts_col(row, "executed_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for WateringLog {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(WateringLog {
            id: row.try_get("id")?,
            plant_id: row.try_get("plant_id")?,
            amount_ml: row.try_get("amount_ml")?,
            method: enum_col(row, "method")?,
            timestamp: ts_col(row, "ts")?,
        })
    }
}

// ----------------------------
// Plants
// ----------------------------

const PLANT_COLUMNS: &str = "id, name, plant_type, min_temp, max_temp, min_humidity, max_humidity, \
                             min_soil_moisture, max_soil_moisture";

pub async fn find_plant<'e, E: SqliteExecutor<'e>>(exec: E, id: i64) -> sqlx::Result<Option<Plant>> {
    sqlx::query_as::<_, Plant>(&format!("SELECT {PLANT_COLUMNS} FROM plants WHERE id = ?"))
        .bind(id)
        .fetch_optional(exec)
        .await
}

pub async fn find_plant_by_name<'e, E: SqliteExecutor<'e>>(
    exec: E,
    name: &str,
) -> sqlx::Result<Option<Plant>> {
    sqlx::query_as::<_, Plant>(&format!(
        "SELECT {PLANT_COLUMNS} FROM plants WHERE name = ? ORDER BY id LIMIT 1"
    ))
    .bind(name)
    .fetch_optional(exec)
    .await
}

pub async fn plant_exists<'e, E: SqliteExecutor<'e>>(exec: E, id: i64) -> sqlx::Result<bool> {
    let row: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM plants WHERE id = ?)")
        .bind(id)
        .fetch_one(exec)
        .await?;
    Ok(row.0 != 0)
}

pub async fn list_plants<'e, E: SqliteExecutor<'e>>(exec: E) -> sqlx::Result<Vec<Plant>> {
    sqlx::query_as::<_, Plant>(&format!("SELECT {PLANT_COLUMNS} FROM plants ORDER BY id"))
        .fetch_all(exec)
        .await
}

pub async fn insert_plant<'e, E: SqliteExecutor<'e>>(exec: E, p: &NewPlant) -> sqlx::Result<Plant> {
    sqlx::query_as::<_, Plant>(&format!(
        r#"
        INSERT INTO plants (
          name, plant_type,
          min_temp, max_temp,
          min_humidity, max_humidity,
          min_soil_moisture, max_soil_moisture
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {PLANT_COLUMNS}
        "#
    ))
    .bind(&p.name)
    .bind(&p.plant_type)
    .bind(p.min_temp)
    .bind(p.max_temp)
    .bind(p.min_humidity)
    .bind(p.max_humidity)
    .bind(p.min_soil_moisture)
    .bind(p.max_soil_moisture)
    .fetch_one(exec)
    .await
}

/// Replaces every field of an existing plant. `None` when the id is unknown.
pub async fn update_plant<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: i64,
    p: &NewPlant,
) -> sqlx::Result<Option<Plant>> {
    sqlx::query_as::<_, Plant>(&format!(
        r#"
        UPDATE plants SET
          name = ?, plant_type = ?,
          min_temp = ?, max_temp = ?,
          min_humidity = ?, max_humidity = ?,
          min_soil_moisture = ?, max_soil_moisture = ?
        WHERE id = ?
        RETURNING {PLANT_COLUMNS}
        "#
    ))
    .bind(&p.name)
    .bind(&p.plant_type)
    .bind(p.min_temp)
    .bind(p.max_temp)
    .bind(p.min_humidity)
    .bind(p.max_humidity)
    .bind(p.min_soil_moisture)
    .bind(p.max_soil_moisture)
    .bind(id)
    .fetch_optional(exec)
    .await
}

/// Hard delete; child rows go with it (ON DELETE CASCADE). Only removes the
/// plant while it has no command awaiting execution, in one statement so no
/// command can be queued between the check and the delete.
pub async fn delete_plant_if_idle<'e, E: SqliteExecutor<'e>>(exec: E, id: i64) -> sqlx::Result<bool> {
    let res = sqlx::query(
        r#"
        DELETE FROM plants
        WHERE id = ?1
          AND NOT EXISTS (
            SELECT 1 FROM pump_commands WHERE plant_id = ?1 AND status <> 'EXECUTED'
          )
        "#,
    )
    .bind(id)
    .execute(exec)
    .await?;
    Ok(res.rows_affected() > 0)
}

// ----------------------------
// Status logs
// ----------------------------

const STATUS_LOG_COLUMNS: &str = "id, plant_id, temperature, humidity, soil_moisture, ts";

pub async fn insert_status_log<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
    reading: &Reading,
    ts: OffsetDateTime,
) -> sqlx::Result<StatusLog> {
    sqlx::query_as::<_, StatusLog>(&format!(
        r#"
        INSERT INTO status_logs (plant_id, temperature, humidity, soil_moisture, ts)
        VALUES (?, ?, ?, ?, ?)
        RETURNING {STATUS_LOG_COLUMNS}
        "#
    ))
    .bind(plant_id)
    .bind(reading.temperature)
    .bind(reading.humidity)
    .bind(reading.soil_moisture)
    .bind(micros(ts))
    .fetch_one(exec)
    .await
}

/// Newest first.
pub async fn status_logs_for_plant<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
) -> sqlx::Result<Vec<StatusLog>> {
    sqlx::query_as::<_, StatusLog>(&format!(
        "SELECT {STATUS_LOG_COLUMNS} FROM status_logs WHERE plant_id = ? ORDER BY ts DESC, id DESC"
    ))
    .bind(plant_id)
    .fetch_all(exec)
    .await
}

/// Oldest first, both ends inclusive.
pub async fn status_logs_in_range<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> sqlx::Result<Vec<StatusLog>> {
    sqlx::query_as::<_, StatusLog>(&format!(
        r#"
        SELECT {STATUS_LOG_COLUMNS} FROM status_logs
        WHERE plant_id = ? AND ts BETWEEN ? AND ?
        ORDER BY ts ASC, id ASC
        "#
    ))
    .bind(plant_id)
    .bind(micros(start))
    .bind(micros(end))
    .fetch_all(exec)
    .await
}

// ----------------------------
// Alerts
// ----------------------------

const ALERT_COLUMNS: &str = "id, plant_id, sensor_type, value, threshold_type, ts";

pub async fn insert_alert<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
    breach: &Breach,
    ts: OffsetDateTime,
) -> sqlx::Result<Alert> {
    sqlx::query_as::<_, Alert>(&format!(
        r#"
        INSERT INTO alerts (plant_id, sensor_type, value, threshold_type, ts)
        VALUES (?, ?, ?, ?, ?)
        RETURNING {ALERT_COLUMNS}
        "#
    ))
    .bind(plant_id)
    .bind(breach.sensor_type.as_str())
    .bind(breach.value)
    .bind(breach.threshold_type.as_str())
    .bind(micros(ts))
    .fetch_one(exec)
    .await
}

/// Newest first.
pub async fn alerts_for_plant<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
) -> sqlx::Result<Vec<Alert>> {
    sqlx::query_as::<_, Alert>(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts WHERE plant_id = ? ORDER BY ts DESC, id DESC"
    ))
    .bind(plant_id)
    .fetch_all(exec)
    .await
}

/// Newest first.
pub async fn alerts_for_plant_and_sensor<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
    sensor_type: SensorType,
) -> sqlx::Result<Vec<Alert>> {
    sqlx::query_as::<_, Alert>(&format!(
        r#"
        SELECT {ALERT_COLUMNS} FROM alerts
        WHERE plant_id = ? AND sensor_type = ?
        ORDER BY ts DESC, id DESC
        "#
    ))
    .bind(plant_id)
    .bind(sensor_type.as_str())
    .fetch_all(exec)
    .await
}

// ----------------------------
// Pump commands
// ----------------------------

const COMMAND_COLUMNS: &str =
    "id, plant_id, amount_ml, method, status, created_at, scheduled_time, claimed_at, executed_at";

pub async fn insert_command<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
    amount_ml: i64,
    method: Method,
    created_at: OffsetDateTime,
    scheduled_time: Option<OffsetDateTime>,
) -> sqlx::Result<PumpCommand> {
    sqlx::query_as::<_, PumpCommand>(&format!(
        r#"
        INSERT INTO pump_commands (plant_id, amount_ml, method, status, created_at, scheduled_time)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING {COMMAND_COLUMNS}
        "#
    ))
    .bind(plant_id)
    .bind(amount_ml)
    .bind(method.as_str())
    .bind(CommandStatus::Pending.as_str())
    .bind(micros(created_at))
    .bind(scheduled_time.map(micros))
    .fetch_one(exec)
    .await
}

pub async fn find_command<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: i64,
) -> sqlx::Result<Option<PumpCommand>> {
    sqlx::query_as::<_, PumpCommand>(&format!(
        "SELECT {COMMAND_COLUMNS} FROM pump_commands WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(exec)
    .await
}

/// Oldest first.
pub async fn list_commands<'e, E: SqliteExecutor<'e>>(exec: E) -> sqlx::Result<Vec<PumpCommand>> {
    sqlx::query_as::<_, PumpCommand>(&format!(
        "SELECT {COMMAND_COLUMNS} FROM pump_commands ORDER BY created_at ASC, id ASC"
    ))
    .fetch_all(exec)
    .await
}

/// Oldest first.
pub async fn commands_for_plant<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
) -> sqlx::Result<Vec<PumpCommand>> {
    sqlx::query_as::<_, PumpCommand>(&format!(
        r#"
        SELECT {COMMAND_COLUMNS} FROM pump_commands
        WHERE plant_id = ?
        ORDER BY created_at ASC, id ASC
        "#
    ))
    .bind(plant_id)
    .fetch_all(exec)
    .await
}

/// Number of commands for a plant that have not been executed yet.
pub async fn open_command_count<'e, E: SqliteExecutor<'e>>(exec: E, plant_id: i64) -> sqlx::Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM pump_commands WHERE plant_id = ? AND status <> 'EXECUTED'",
    )
    .bind(plant_id)
    .fetch_one(exec)
    .await?;
    Ok(row.0)
}

const DUE_CONDITION: &str = "(scheduled_time IS NULL OR scheduled_time <= ?1) \
     AND (status = 'PENDING' OR (status = 'CLAIMED' AND claimed_at <= ?2))";

/// Read-only view of what [`claim_due_commands`] would hand out right now.
/// Oldest first.
pub async fn due_commands<'e, E: SqliteExecutor<'e>>(
    exec: E,
    now: OffsetDateTime,
    lease_expired_before: OffsetDateTime,
) -> sqlx::Result<Vec<PumpCommand>> {
    sqlx::query_as::<_, PumpCommand>(&format!(
        "SELECT {COMMAND_COLUMNS} FROM pump_commands WHERE {DUE_CONDITION} ORDER BY created_at ASC, id ASC"
    ))
    .bind(micros(now))
    .bind(micros(lease_expired_before))
    .fetch_all(exec)
    .await
}

/// Atomically claims every due command: PENDING ones, plus CLAIMED ones
/// whose lease started at or before `lease_expired_before`. A single
/// UPDATE statement, so two concurrent pollers never receive the same row.
///
/// The returned rows are in no particular order.
pub async fn claim_due_commands<'e, E: SqliteExecutor<'e>>(
    exec: E,
    now: OffsetDateTime,
    lease_expired_before: OffsetDateTime,
) -> sqlx::Result<Vec<PumpCommand>> {
    sqlx::query_as::<_, PumpCommand>(&format!(
        r#"
        UPDATE pump_commands
        SET status = 'CLAIMED', claimed_at = ?1
        WHERE {DUE_CONDITION}
        RETURNING {COMMAND_COLUMNS}
        "#
    ))
    .bind(micros(now))
    .bind(micros(lease_expired_before))
    .fetch_all(exec)
    .await
}

/// PENDING/CLAIMED → EXECUTED. `None` when the id is unknown or the command
/// was already executed.
pub async fn mark_command_executed<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: i64,
    executed_at: OffsetDateTime,
) -> sqlx::Result<Option<PumpCommand>> {
    sqlx::query_as::<_, PumpCommand>(&format!(
        r#"
        UPDATE pump_commands
        SET status = 'EXECUTED', executed_at = ?
        WHERE id = ? AND status <> 'EXECUTED'
        RETURNING {COMMAND_COLUMNS}
        "#
    ))
    .bind(micros(executed_at))
    .bind(id)
    .fetch_optional(exec)
    .await
}

// ----------------------------
// Watering logs
// ----------------------------

const WATERING_COLUMNS: &str = "id, plant_id, amount_ml, method, ts";

pub async fn insert_watering_log<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
    amount_ml: i64,
    method: Method,
    ts: OffsetDateTime,
) -> sqlx::Result<WateringLog> {
    sqlx::query_as::<_, WateringLog>(&format!(
        r#"
        INSERT INTO watering_logs (plant_id, amount_ml, method, ts)
        VALUES (?, ?, ?, ?)
        RETURNING {WATERING_COLUMNS}
        "#
    ))
    .bind(plant_id)
    .bind(amount_ml)
    .bind(method.as_str())
    .bind(micros(ts))
    .fetch_one(exec)
    .await
}

/// Newest first.
pub async fn watering_logs_for_plant<'e, E: SqliteExecutor<'e>>(
    exec: E,
    plant_id: i64,
) -> sqlx::Result<Vec<WateringLog>> {
    sqlx::query_as::<_, WateringLog>(&format!(
        "SELECT {WATERING_COLUMNS} FROM watering_logs WHERE plant_id = ? ORDER BY ts DESC, id DESC"
    ))
    .bind(plant_id)
    .fetch_all(exec)
    .await
}

// ===========================================================================
// Tests
// ===========================================================================
