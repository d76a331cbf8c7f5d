//! Core farm operations: plant registry access, telemetry recording with
//! threshold alerts, the pump-command ledger and watering history.
//!
//! Every operation that dereferences a plant or command id fails with
//! [`FarmError::NotFound`] when the id is unknown, so callers can always
//! tell "no records" apart from "no such plant".
//!
//! ## Pump command ledger
//!
//! Commands are pulled, never pushed. An actuator agent polls
//! [`Farm::poll_due_commands`], which claims every due command for the
//! configured lease so a concurrent poller cannot pick it up too. The agent
//! then confirms with [`Farm::acknowledge_command`]. A claim that is not
//! acknowledged before its lease runs out is handed out again on a later
//! poll.

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::db::{self, Db};
use crate::error::{FarmError, FarmResult};
use crate::evaluator;
use crate::models::{
    Alert, Caller, Method, NewPlant, Plant, PumpCommand, Reading, RecordedReading, SensorType,
    StatusLog, WateringLog,
};

/// Default lease length for claimed pump commands.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::minutes(5);

#[derive(Clone)]
pub struct Farm {
    db: Db,
    claim_ttl: Duration,
}

impl Farm {
    pub fn new(db: Db, claim_ttl: Duration) -> Self {
        Self { db, claim_ttl }
    }

    pub fn claim_ttl(&self) -> Duration {
        self.claim_ttl
    }

    async fn ensure_plant(&self, plant_id: i64) -> FarmResult<()> {
        if db::plant_exists(self.db.pool(), plant_id).await? {
            Ok(())
        } else {
            Err(FarmError::plant_not_found(plant_id))
        }
    }

    // ----------------------------
    // Plant registry
    // ----------------------------

    pub async fn list_plants(&self) -> FarmResult<Vec<Plant>> {
        Ok(db::list_plants(self.db.pool()).await?)
    }

    pub async fn get_plant(&self, id: i64) -> FarmResult<Plant> {
        db::find_plant(self.db.pool(), id)
            .await?
            .ok_or_else(|| FarmError::plant_not_found(id))
    }

    pub async fn create_plant(&self, caller: &Caller, plant: &NewPlant) -> FarmResult<Plant> {
        plant.validate()?;
        let created = db::insert_plant(self.db.pool(), plant).await?;
        info!(caller = %caller, plant_id = created.id, name = %created.name, "plant created");
        Ok(created)
    }

    pub async fn update_plant(&self, caller: &Caller, id: i64, plant: &NewPlant) -> FarmResult<Plant> {
        plant.validate()?;
        let updated = db::update_plant(self.db.pool(), id, plant)
            .await?
            .ok_or_else(|| FarmError::plant_not_found(id))?;
        info!(caller = %caller, plant_id = id, "plant updated");
        Ok(updated)
    }

    /// Hard delete, including the plant's telemetry, alerts and history.
    /// Refused while the plant still has commands awaiting execution.
    pub async fn delete_plant(&self, caller: &Caller, id: i64) -> FarmResult<()> {
        if db::delete_plant_if_idle(self.db.pool(), id).await? {
            info!(caller = %caller, plant_id = id, "plant deleted");
            return Ok(());
        }

        if !db::plant_exists(self.db.pool(), id).await? {
            return Err(FarmError::plant_not_found(id));
        }
        let open = db::open_command_count(self.db.pool(), id).await?;
        Err(FarmError::Conflict(format!(
            "plant {id} has {open} pump command(s) awaiting execution"
        )))
    }

    // ----------------------------
    // Telemetry recorder + threshold evaluation
    // ----------------------------

    /// Stores a reading and the alerts it raises in one transaction.
    ///
    /// Each alert is written inside its own savepoint: a failed alert insert
    /// is logged and skipped without losing the reading or the other alerts.
    pub async fn record_telemetry(
        &self,
        caller: &Caller,
        plant_id: i64,
        reading: &Reading,
    ) -> FarmResult<RecordedReading> {
        for sensor in SensorType::ALL {
            if let Some(v) = reading.value(sensor) {
                if !v.is_finite() {
                    return Err(FarmError::InvalidInput(format!(
                        "{sensor} value is not a finite number"
                    )));
                }
            }
        }

        let now = OffsetDateTime::now_utc();
        let ts = reading.timestamp.unwrap_or(now);

        let mut tx = self.db.begin().await?;

        // First statement must be the write. A transaction that reads first
        // cannot upgrade to the write lock while another ingest holds it.
        let log = match db::insert_status_log(&mut *tx, plant_id, reading, ts).await {
            Ok(log) => log,
            Err(e) => {
                tx.rollback().await?;
                return Err(plant_fk_error(e, plant_id));
            }
        };
        let Some(plant) = db::find_plant(&mut *tx, plant_id).await? else {
            tx.rollback().await?;
            return Err(FarmError::plant_not_found(plant_id));
        };

        let mut alerts = Vec::new();
        for breach in evaluator::evaluate(&plant, reading) {
            let mut savepoint = sqlx::Connection::begin(&mut *tx).await?;
            match db::insert_alert(&mut *savepoint, plant_id, &breach, now).await {
                Ok(alert) => {
                    savepoint.commit().await?;
                    alerts.push(alert);
                }
                Err(e) => {
                    warn!(
                        plant_id,
                        sensor = %breach.sensor_type,
                        value = breach.value,
                        "failed to persist alert: {e}"
                    );
                    savepoint.rollback().await?;
                }
            }
        }

        tx.commit().await?;

        debug!(caller = %caller, plant_id, log_id = log.id, alerts = alerts.len(), "telemetry recorded");
        for a in &alerts {
            info!(
                plant_id,
                sensor = %a.sensor_type,
                value = a.value,
                threshold = %a.threshold_type,
                "threshold breached"
            );
        }

        Ok(RecordedReading { log, alerts })
    }

    /// Newest first.
    pub async fn list_telemetry(&self, plant_id: i64) -> FarmResult<Vec<StatusLog>> {
        self.ensure_plant(plant_id).await?;
        Ok(db::status_logs_for_plant(self.db.pool(), plant_id).await?)
    }

    /// Oldest first, `start` and `end` inclusive.
    pub async fn list_telemetry_in_range(
        &self,
        plant_id: i64,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> FarmResult<Vec<StatusLog>> {
        if start > end {
            return Err(FarmError::InvalidInput(format!(
                "range start {start} is after end {end}"
            )));
        }
        self.ensure_plant(plant_id).await?;
        Ok(db::status_logs_in_range(self.db.pool(), plant_id, start, end).await?)
    }

    // ----------------------------
    // Alert log
    // ----------------------------

    /// Newest first.
    pub async fn list_alerts(&self, plant_id: i64) -> FarmResult<Vec<Alert>> {
        self.ensure_plant(plant_id).await?;
        Ok(db::alerts_for_plant(self.db.pool(), plant_id).await?)
    }

    /// Newest first.
    pub async fn list_alerts_by_sensor(
        &self,
        plant_id: i64,
        sensor_type: SensorType,
    ) -> FarmResult<Vec<Alert>> {
        self.ensure_plant(plant_id).await?;
        Ok(db::alerts_for_plant_and_sensor(self.db.pool(), plant_id, sensor_type).await?)
    }

    // ----------------------------
    // Pump command ledger
    // ----------------------------

    /// Queues a command as PENDING. Without `scheduled_time` it is due
    /// immediately.
    pub async fn create_command(
        &self,
        caller: &Caller,
        plant_id: i64,
        amount_ml: i64,
        method: Method,
        scheduled_time: Option<OffsetDateTime>,
    ) -> FarmResult<PumpCommand> {
        if amount_ml <= 0 {
            return Err(FarmError::InvalidInput(format!(
                "amount_ml must be positive, got {amount_ml}"
            )));
        }
        self.ensure_plant(plant_id).await?;

        let now = OffsetDateTime::now_utc();
        let cmd = db::insert_command(self.db.pool(), plant_id, amount_ml, method, now, scheduled_time)
            .await
            .map_err(|e| plant_fk_error(e, plant_id))?;

        info!(
            caller = %caller,
            command_id = cmd.id,
            plant_id,
            amount_ml,
            %method,
            scheduled = scheduled_time.is_some(),
            "pump command queued"
        );
        Ok(cmd)
    }

    /// Claims and returns every command due at `now`, oldest `created_at`
    /// first. Commands scheduled after `now`, executed ones, and ones under
    /// an unexpired claim are left out. An empty result is not an error.
    pub async fn poll_due_commands(
        &self,
        caller: &Caller,
        now: OffsetDateTime,
    ) -> FarmResult<Vec<PumpCommand>> {
        let lease_expired_before = self.lease_expired_before(now)?;
        let mut due = db::claim_due_commands(self.db.pool(), now, lease_expired_before).await?;
        due.sort_by_key(|c| (c.created_at, c.id));

        if !due.is_empty() {
            info!(
                caller = %caller,
                claimed = due.len(),
                ids = ?due.iter().map(|c| c.id).collect::<Vec<_>>(),
                "pump commands claimed"
            );
        }
        Ok(due)
    }

    /// What [`Farm::poll_due_commands`] would claim at `now`, without
    /// claiming anything.
    pub async fn list_due_commands(&self, now: OffsetDateTime) -> FarmResult<Vec<PumpCommand>> {
        let lease_expired_before = self.lease_expired_before(now)?;
        Ok(db::due_commands(self.db.pool(), now, lease_expired_before).await?)
    }

    fn lease_expired_before(&self, now: OffsetDateTime) -> FarmResult<OffsetDateTime> {
        now.checked_sub(self.claim_ttl).ok_or_else(|| {
            FarmError::InvalidInput(format!(
                "claim lease of {} is out of range at {now}",
                self.claim_ttl
            ))
        })
    }

    /// Marks a command EXECUTED. Acknowledging an already executed command
    /// is a no-op that returns the stored record unchanged.
    pub async fn acknowledge_command(&self, caller: &Caller, command_id: i64) -> FarmResult<PumpCommand> {
        let now = OffsetDateTime::now_utc();

        if let Some(cmd) = db::mark_command_executed(self.db.pool(), command_id, now).await? {
            info!(caller = %caller, command_id, plant_id = cmd.plant_id, "pump command executed");
            return Ok(cmd);
        }

        match db::find_command(self.db.pool(), command_id).await? {
            Some(cmd) => {
                debug!(caller = %caller, command_id, "pump command already executed");
                Ok(cmd)
            }
            None => Err(FarmError::command_not_found(command_id)),
        }
    }

    /// Oldest first.
    pub async fn list_commands(&self) -> FarmResult<Vec<PumpCommand>> {
        Ok(db::list_commands(self.db.pool()).await?)
    }

    /// Oldest first.
    pub async fn list_commands_for_plant(&self, plant_id: i64) -> FarmResult<Vec<PumpCommand>> {
        self.ensure_plant(plant_id).await?;
        Ok(db::commands_for_plant(self.db.pool(), plant_id).await?)
    }

    // ----------------------------
    // Watering history
    // ----------------------------

    pub async fn log_watering(
        &self,
        caller: &Caller,
        plant_id: i64,
        amount_ml: i64,
        method: Method,
    ) -> FarmResult<WateringLog> {
        if amount_ml <= 0 {
            return Err(FarmError::InvalidInput(format!(
                "amount_ml must be positive, got {amount_ml}"
            )));
        }
        self.ensure_plant(plant_id).await?;

        let log = db::insert_watering_log(
            self.db.pool(),
            plant_id,
            amount_ml,
            method,
            OffsetDateTime::now_utc(),
        )
        .await
        .map_err(|e| plant_fk_error(e, plant_id))?;

        info!(caller = %caller, plant_id, amount_ml, %method, "watering logged");
        Ok(log)
    }

    /// Newest first.
    pub async fn list_watering(&self, plant_id: i64) -> FarmResult<Vec<WateringLog>> {
        self.ensure_plant(plant_id).await?;
        Ok(db::watering_logs_for_plant(self.db.pool(), plant_id).await?)
    }
}

/// A child insert rejected by the `plants` foreign key means the plant is
/// gone, which callers see as `NotFound`.
fn plant_fk_error(err: sqlx::Error, plant_id: i64) -> FarmError {
    if db::is_foreign_key_violation(&err) {
        FarmError::plant_not_found(plant_id)
    } else {
        err.into()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandStatus, ThresholdType};

    async fn test_farm() -> Farm {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        Farm::new(db, DEFAULT_CLAIM_TTL)
    }

    /// File-backed database, so the pool's connections really contend for
    /// the SQLite write lock.
    async fn file_farm() -> (Farm, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("farm.db").display());
        let db = Db::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        (Farm::new(db, DEFAULT_CLAIM_TTL), dir)
    }

    async fn row_count(farm: &Farm, table: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(farm.db.pool())
            .await
            .unwrap();
        row.0
    }

    fn admin() -> Caller {
        Caller::new("ops", crate::models::Role::Admin)
    }

    fn agent() -> Caller {
        Caller::new("pump-agent", crate::models::Role::User)
    }

    fn tomato() -> NewPlant {
        NewPlant {
            name: "Tomato".into(),
            plant_type: "vegetable".into(),
            min_temp: Some(18.0),
            max_temp: Some(30.0),
            min_soil_moisture: Some(30.0),
            max_soil_moisture: Some(70.0),
            ..Default::default()
        }
    }

    async fn seeded() -> (Farm, Plant) {
        let farm = test_farm().await;
        let plant = farm.create_plant(&admin(), &tomato()).await.unwrap();
        (farm, plant)
    }

    fn soil(v: f64) -> Reading {
        Reading {
            soil_moisture: Some(v),
            ..Default::default()
        }
    }

    fn assert_not_found<T: std::fmt::Debug>(res: FarmResult<T>) {
        match res {
            Err(FarmError::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    // -- Plant registry ---------------------------------------------------

    #[tokio::test]
    async fn create_and_get_plant() {
        let (farm, plant) = seeded().await;
        assert_eq!(farm.get_plant(plant.id).await.unwrap(), plant);
        assert_eq!(farm.list_plants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_plant_with_inverted_bounds_rejected() {
        let farm = test_farm().await;
        let bad = NewPlant {
            min_temp: Some(30.0),
            max_temp: Some(10.0),
            ..tomato()
        };
        let err = farm.create_plant(&admin(), &bad).await.unwrap_err();
        assert!(matches!(err, FarmError::InvalidInput(_)));
        assert!(farm.list_plants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_unknown_plant_is_not_found() {
        let farm = test_farm().await;
        assert_not_found(farm.update_plant(&admin(), 5, &tomato()).await);
    }

    #[tokio::test]
    async fn update_replaces_envelope() {
        let (farm, plant) = seeded().await;
        let updated = farm
            .update_plant(
                &admin(),
                plant.id,
                &NewPlant {
                    min_soil_moisture: None,
                    ..tomato()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.min_soil_moisture, None);

        // The new envelope is used for the next reading.
        let rec = farm.record_telemetry(&agent(), plant.id, &soil(5.0)).await.unwrap();
        assert!(rec.alerts.is_empty());
    }

    #[tokio::test]
    async fn delete_plant_with_open_command_conflicts() {
        let (farm, plant) = seeded().await;
        let cmd = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();

        let err = farm.delete_plant(&admin(), plant.id).await.unwrap_err();
        assert!(matches!(err, FarmError::Conflict(_)), "{err:?}");

        farm.acknowledge_command(&agent(), cmd.id).await.unwrap();
        farm.delete_plant(&admin(), plant.id).await.unwrap();
        assert_not_found(farm.get_plant(plant.id).await);
        assert_not_found(farm.delete_plant(&admin(), plant.id).await);
    }

    // -- Telemetry + alerts -----------------------------------------------

    #[tokio::test]
    async fn soil_moisture_scenario() {
        let (farm, plant) = seeded().await;

        let low = farm.record_telemetry(&agent(), plant.id, &soil(25.0)).await.unwrap();
        assert_eq!(low.alerts.len(), 1);
        assert_eq!(low.alerts[0].sensor_type, SensorType::SoilMoisture);
        assert_eq!(low.alerts[0].value, 25.0);
        assert_eq!(low.alerts[0].threshold_type, ThresholdType::Min);

        let high = farm.record_telemetry(&agent(), plant.id, &soil(75.0)).await.unwrap();
        assert_eq!(high.alerts.len(), 1);
        assert_eq!(high.alerts[0].value, 75.0);
        assert_eq!(high.alerts[0].threshold_type, ThresholdType::Max);

        let ok = farm.record_telemetry(&agent(), plant.id, &soil(50.0)).await.unwrap();
        assert!(ok.alerts.is_empty());

        let alerts = farm.list_alerts(plant.id).await.unwrap();
        assert_eq!(alerts.len(), 2);
        // Newest first.
        assert_eq!(alerts[0].threshold_type, ThresholdType::Max);
        assert_eq!(alerts[1].threshold_type, ThresholdType::Min);

        assert_eq!(farm.list_telemetry(plant.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_reading_is_recorded_without_alerts() {
        let (farm, plant) = seeded().await;
        let rec = farm
            .record_telemetry(&agent(), plant.id, &Reading::default())
            .await
            .unwrap();
        assert!(rec.alerts.is_empty());
        assert_eq!(rec.log.temperature, None);
        assert_eq!(farm.list_telemetry(plant.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_for_unknown_plant_stores_nothing() {
        let farm = test_farm().await;
        assert_not_found(farm.record_telemetry(&agent(), 9, &soil(10.0)).await);
    }

    #[tokio::test]
    async fn non_finite_value_rejected() {
        let (farm, plant) = seeded().await;
        let r = Reading {
            temperature: Some(f64::INFINITY),
            ..Default::default()
        };
        let err = farm.record_telemetry(&agent(), plant.id, &r).await.unwrap_err();
        assert!(matches!(err, FarmError::InvalidInput(_)));
        assert!(farm.list_telemetry(plant.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_timestamp_is_kept() {
        let (farm, plant) = seeded().await;
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let r = Reading {
            humidity: Some(55.0),
            timestamp: Some(ts),
            ..Default::default()
        };
        let rec = farm.record_telemetry(&agent(), plant.id, &r).await.unwrap();
        assert_eq!(rec.log.timestamp, ts);
    }

    #[tokio::test]
    async fn alerts_filtered_by_sensor_type() {
        let (farm, plant) = seeded().await;
        let r = Reading {
            temperature: Some(5.0),
            soil_moisture: Some(90.0),
            ..Default::default()
        };
        let rec = farm.record_telemetry(&agent(), plant.id, &r).await.unwrap();
        assert_eq!(rec.alerts.len(), 2);

        let temp = farm
            .list_alerts_by_sensor(plant.id, SensorType::Temp)
            .await
            .unwrap();
        assert_eq!(temp.len(), 1);
        assert_eq!(temp[0].threshold_type, ThresholdType::Min);

        let humidity = farm
            .list_alerts_by_sensor(plant.id, SensorType::Humidity)
            .await
            .unwrap();
        assert!(humidity.is_empty());
    }

    #[tokio::test]
    async fn telemetry_range_is_inclusive_and_ascending() {
        let (farm, plant) = seeded().await;
        let base = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        for i in [2, 0, 1, 5] {
            let r = Reading {
                temperature: Some(20.0 + i as f64),
                timestamp: Some(base + Duration::minutes(i)),
                ..Default::default()
            };
            farm.record_telemetry(&agent(), plant.id, &r).await.unwrap();
        }

        let logs = farm
            .list_telemetry_in_range(plant.id, base, base + Duration::minutes(2))
            .await
            .unwrap();
        let temps: Vec<_> = logs.iter().map(|l| l.temperature.unwrap()).collect();
        assert_eq!(temps, vec![20.0, 21.0, 22.0]);
    }

    #[tokio::test]
    async fn inverted_range_is_invalid() {
        let (farm, plant) = seeded().await;
        let now = OffsetDateTime::now_utc();
        let err = farm
            .list_telemetry_in_range(plant.id, now, now - Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FarmError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn listings_for_unknown_plant_are_not_found() {
        let farm = test_farm().await;
        let now = OffsetDateTime::now_utc();
        assert_not_found(farm.list_telemetry(77).await);
        assert_not_found(farm.list_telemetry_in_range(77, now - Duration::hours(1), now).await);
        assert_not_found(farm.list_alerts(77).await);
        assert_not_found(farm.list_alerts_by_sensor(77, SensorType::Temp).await);
        assert_not_found(farm.list_commands_for_plant(77).await);
        assert_not_found(farm.list_watering(77).await);
    }

    #[tokio::test]
    async fn known_plant_without_records_lists_empty() {
        let (farm, plant) = seeded().await;
        assert!(farm.list_alerts(plant.id).await.unwrap().is_empty());
        assert!(farm.list_commands_for_plant(plant.id).await.unwrap().is_empty());
        assert!(farm.list_watering(plant.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_plant_ingest_leaves_no_rows() {
        let (farm, _plant) = seeded().await;
        assert_not_found(farm.record_telemetry(&agent(), 999, &soil(10.0)).await);
        assert_eq!(row_count(&farm, "status_logs").await, 0);
        assert_eq!(row_count(&farm, "alerts").await, 0);
    }

    #[tokio::test]
    async fn failed_reading_insert_leaves_no_alerts() {
        let (farm, plant) = seeded().await;
        sqlx::query(
            "CREATE TRIGGER reject_logs BEFORE INSERT ON status_logs \
             BEGIN SELECT RAISE(ABORT, 'status log rejected'); END",
        )
        .execute(farm.db.pool())
        .await
        .unwrap();

        let err = farm
            .record_telemetry(&agent(), plant.id, &soil(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, FarmError::Database(_)), "{err:?}");
        assert_eq!(row_count(&farm, "status_logs").await, 0);
        assert_eq!(row_count(&farm, "alerts").await, 0);
    }

    #[tokio::test]
    async fn failed_alert_insert_keeps_reading() {
        let (farm, plant) = seeded().await;
        sqlx::query(
            "CREATE TRIGGER reject_alerts BEFORE INSERT ON alerts \
             BEGIN SELECT RAISE(ABORT, 'alert rejected'); END",
        )
        .execute(farm.db.pool())
        .await
        .unwrap();

        let rec = farm
            .record_telemetry(&agent(), plant.id, &soil(10.0))
            .await
            .unwrap();
        assert!(rec.alerts.is_empty());
        assert_eq!(row_count(&farm, "status_logs").await, 1);
        assert_eq!(row_count(&farm, "alerts").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingest_all_succeeds() {
        let (farm, _dir) = file_farm().await;
        let plant_id = farm.create_plant(&admin(), &tomato()).await.unwrap().id;

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let farm = farm.clone();
                tokio::spawn(async move { farm.record_telemetry(&agent(), plant_id, &soil(25.0)).await })
            })
            .collect();

        for task in tasks {
            let rec = task.await.unwrap().unwrap();
            assert_eq!(rec.alerts.len(), 1);
        }
        assert_eq!(farm.list_telemetry(plant_id).await.unwrap().len(), 40);
        assert_eq!(farm.list_alerts(plant_id).await.unwrap().len(), 40);
    }

    // -- Pump command ledger ----------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pollers_never_share_a_command() {
        let (farm, _dir) = file_farm().await;
        let plant = farm.create_plant(&admin(), &tomato()).await.unwrap();
        for _ in 0..30 {
            farm.create_command(&admin(), plant.id, 100, Method::Auto, None)
                .await
                .unwrap();
        }

        let now = OffsetDateTime::now_utc();
        let pollers: Vec<_> = (0..8)
            .map(|_| {
                let farm = farm.clone();
                tokio::spawn(async move { farm.poll_due_commands(&agent(), now).await })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for poller in pollers {
            for cmd in poller.await.unwrap().unwrap() {
                assert!(seen.insert(cmd.id), "command {} handed out twice", cmd.id);
            }
        }
        assert_eq!(seen.len(), 30);
    }

    #[tokio::test]
    async fn sub_second_schedule_is_not_due_early() {
        let (farm, plant) = seeded().await;
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let scheduled = now + Duration::milliseconds(900);
        let cmd = farm
            .create_command(&admin(), plant.id, 100, Method::Auto, Some(scheduled))
            .await
            .unwrap();
        assert_eq!(cmd.scheduled_time, Some(scheduled));

        assert!(farm.poll_due_commands(&agent(), now).await.unwrap().is_empty());

        let due = farm.poll_due_commands(&agent(), scheduled).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due.iter().all(|c| c.scheduled_time.unwrap() <= scheduled));
    }

    #[tokio::test]
    async fn list_due_does_not_claim() {
        let (farm, plant) = seeded().await;
        let cmd = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();

        let preview = farm.list_due_commands(now).await.unwrap();
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].status, CommandStatus::Pending);
        assert_eq!(farm.list_due_commands(now).await.unwrap(), preview);

        let claimed = farm.poll_due_commands(&agent(), now).await.unwrap();
        assert_eq!(claimed[0].id, cmd.id);
        assert!(farm.list_due_commands(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_lease_is_invalid_not_a_panic() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let farm = Farm::new(db, Duration::seconds(i64::MAX));

        let err = farm
            .poll_due_commands(&agent(), OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, FarmError::InvalidInput(_)), "{err:?}");
        assert!(farm.list_due_commands(OffsetDateTime::now_utc()).await.is_err());
    }


    #[tokio::test]
    async fn create_command_starts_pending() {
        let (farm, plant) = seeded().await;
        let cmd = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.amount_ml, 150);
        assert!(cmd.executed_at.is_none());
        assert!(cmd.claimed_at.is_none());
    }

    #[tokio::test]
    async fn create_command_validates_plant_and_amount() {
        let (farm, plant) = seeded().await;
        assert_not_found(farm.create_command(&admin(), 404, 150, Method::Auto, None).await);
        let err = farm
            .create_command(&admin(), plant.id, 0, Method::Auto, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FarmError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn immediate_and_scheduled_round_trip() {
        let (farm, plant) = seeded().await;
        let now = OffsetDateTime::now_utc();

        let immediate = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();
        let scheduled = farm
            .create_command(&admin(), plant.id, 150, Method::Auto, Some(now + Duration::hours(1)))
            .await
            .unwrap();

        let due = farm.poll_due_commands(&agent(), now).await.unwrap();
        let ids: Vec<_> = due.iter().map(|c| c.id).collect();
        assert!(ids.contains(&immediate.id));
        assert!(!ids.contains(&scheduled.id));

        let later = now + Duration::hours(1) + Duration::seconds(1);
        let due = farm.poll_due_commands(&agent(), later).await.unwrap();
        assert!(due.iter().any(|c| c.id == scheduled.id));
    }

    #[tokio::test]
    async fn poll_orders_by_creation_across_plants() {
        let (farm, a) = seeded().await;
        let b = farm
            .create_plant(
                &admin(),
                &NewPlant {
                    name: "Pepper".into(),
                    ..tomato()
                },
            )
            .await
            .unwrap();

        let first = farm.create_command(&admin(), b.id, 100, Method::Auto, None).await.unwrap();
        let second = farm.create_command(&admin(), a.id, 200, Method::Auto, None).await.unwrap();
        let third = farm.create_command(&admin(), b.id, 300, Method::Manual, None).await.unwrap();

        let due = farm
            .poll_due_commands(&agent(), OffsetDateTime::now_utc())
            .await
            .unwrap();
        let ids: Vec<_> = due.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
        assert!(due.iter().all(|c| c.status == CommandStatus::Claimed));
    }

    #[tokio::test]
    async fn poll_never_returns_future_commands() {
        let (farm, plant) = seeded().await;
        let now = OffsetDateTime::now_utc();
        for mins in [10, 60, 600] {
            farm.create_command(
                &admin(),
                plant.id,
                100,
                Method::Auto,
                Some(now + Duration::minutes(mins)),
            )
            .await
            .unwrap();
        }

        let due = farm.poll_due_commands(&agent(), now).await.unwrap();
        assert!(due.is_empty());

        let due = farm
            .poll_due_commands(&agent(), now + Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert!(due
            .iter()
            .all(|c| c.scheduled_time.unwrap() <= now + Duration::minutes(61)));
    }

    #[tokio::test]
    async fn claimed_command_hidden_until_lease_expires() {
        let (farm, plant) = seeded().await;
        let cmd = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();

        assert_eq!(farm.poll_due_commands(&agent(), now).await.unwrap().len(), 1);
        // Second poller inside the lease sees nothing.
        assert!(farm
            .poll_due_commands(&agent(), now + Duration::seconds(30))
            .await
            .unwrap()
            .is_empty());

        // After the lease the unacknowledged command is handed out again.
        let after = now + farm.claim_ttl() + Duration::seconds(1);
        let due = farm.poll_due_commands(&agent(), after).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, cmd.id);
    }

    #[tokio::test]
    async fn acknowledged_command_never_reappears() {
        let (farm, plant) = seeded().await;
        let cmd = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();
        farm.poll_due_commands(&agent(), now).await.unwrap();

        let done = farm.acknowledge_command(&agent(), cmd.id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Executed);
        assert!(done.executed_at.is_some());

        let far = now + Duration::days(1);
        assert!(farm.poll_due_commands(&agent(), far).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_without_poll_executes_pending() {
        let (farm, plant) = seeded().await;
        let cmd = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();
        let done = farm.acknowledge_command(&agent(), cmd.id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Executed);
    }

    #[tokio::test]
    async fn double_acknowledge_is_noop() {
        let (farm, plant) = seeded().await;
        let cmd = farm
            .create_command(&admin(), plant.id, 150, Method::Manual, None)
            .await
            .unwrap();
        let first = farm.acknowledge_command(&agent(), cmd.id).await.unwrap();
        let second = farm.acknowledge_command(&agent(), cmd.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn acknowledge_unknown_is_not_found() {
        let farm = test_farm().await;
        assert_not_found(farm.acknowledge_command(&agent(), 12345).await);
    }

    #[tokio::test]
    async fn command_history_oldest_first() {
        let (farm, plant) = seeded().await;
        let a = farm.create_command(&admin(), plant.id, 100, Method::Auto, None).await.unwrap();
        let b = farm.create_command(&admin(), plant.id, 200, Method::Auto, None).await.unwrap();

        let ids: Vec<_> = farm
            .list_commands_for_plant(plant.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(farm.list_commands().await.unwrap().len(), 2);
    }

    // -- Watering history -------------------------------------------------

    #[tokio::test]
    async fn watering_logged_independently_of_commands() {
        let (farm, plant) = seeded().await;
        farm.log_watering(&agent(), plant.id, 200, Method::Manual).await.unwrap();
        farm.log_watering(&agent(), plant.id, 300, Method::Auto).await.unwrap();

        let logs = farm.list_watering(plant.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        // Newest first.
        assert_eq!(logs[0].amount_ml, 300);
        assert_eq!(logs[1].method, Method::Manual);
        assert!(farm.list_commands().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watering_for_unknown_plant_is_not_found() {
        let farm = test_farm().await;
        assert_not_found(farm.log_watering(&agent(), 3, 100, Method::Manual).await);
    }
}
