use anyhow::{anyhow, Context, Result};
use garden_bus::{PlantRecord, SensorKind, SensorRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sensor_id: i64,
    pub timestamp: OffsetDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WateringEvent {
    pub plant_id: i64,
    pub timestamp: OffsetDateTime,
    pub duration: f64,
}

/// Timestamps are persisted as unix milliseconds so ordering is numeric.
fn to_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .with_context(|| format!("timestamp out of range: {ms}"))
}

fn sensor_from_row(r: &SqliteRow) -> Result<SensorRecord> {
    let kind: String = r.try_get("type")?;
    Ok(SensorRecord {
        id: r.try_get("id")?,
        kind: SensorKind::parse(&kind).ok_or_else(|| anyhow!("unknown sensor type '{kind}'"))?,
        name: r.try_get("name")?,
        unit: r.try_get("unit")?,
        sample_gap: r.try_get("sample_gap")?,
    })
}

fn plant_from_row(r: &SqliteRow) -> Result<PlantRecord> {
    Ok(PlantRecord {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        humidity_sensor_id: r.try_get("humidity_sensor_id")?,
        pump_id: r.try_get("pump_id")?,
        target: r.try_get("target")?,
        watering_cooldown: r.try_get("watering_cooldown")?,
        watering_duration: r.try_get("watering_duration")?,
        humidity_tolerance: r.try_get("humidity_tolerance")?,
    })
}

const PLANT_COLUMNS: &str = "id, name, humidity_sensor_id, pump_id, target, \
     watering_cooldown, watering_duration, humidity_tolerance";

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/garden/garden.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    pub async fn upsert_sensor(&self, s: &SensorRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor (id, type, name, unit, sample_gap)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              type=excluded.type,
              name=excluded.name,
              unit=excluded.unit,
              sample_gap=excluded.sample_gap
            "#,
        )
        .bind(s.id)
        .bind(s.kind.as_str())
        .bind(&s.name)
        .bind(&s.unit)
        .bind(s.sample_gap)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn get_sensor(&self, id: i64) -> Result<Option<SensorRecord>> {
        let row = sqlx::query("SELECT id, type, name, unit, sample_gap FROM sensor WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_sensor failed")?;
        row.as_ref().map(sensor_from_row).transpose()
    }

    pub async fn load_sensors(&self) -> Result<Vec<SensorRecord>> {
        let rows = sqlx::query("SELECT id, type, name, unit, sample_gap FROM sensor ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load_sensors failed")?;
        rows.iter().map(sensor_from_row).collect()
    }

    // ----------------------------
    // Plants
    // ----------------------------

    /// Insert or update by id. Binding a sensor that another plant already
    /// owns violates `UNIQUE(humidity_sensor_id)` and is returned as an error.
    pub async fn upsert_plant(&self, p: &PlantRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plant (
              id, name, humidity_sensor_id, pump_id, target,
              watering_cooldown, watering_duration, humidity_tolerance
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              humidity_sensor_id=excluded.humidity_sensor_id,
              pump_id=excluded.pump_id,
              target=excluded.target,
              watering_cooldown=excluded.watering_cooldown,
              watering_duration=excluded.watering_duration,
              humidity_tolerance=excluded.humidity_tolerance
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(p.humidity_sensor_id)
        .bind(p.pump_id)
        .bind(p.target)
        .bind(p.watering_cooldown)
        .bind(p.watering_duration)
        .bind(p.humidity_tolerance)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_plant failed for plant {}", p.id))?;
        Ok(())
    }

    /// Insert unless the id or the humidity sensor is already taken.
    /// Returns whether a row was committed.
    pub async fn insert_plant_if_absent(&self, p: &PlantRecord) -> Result<bool> {
        let done = sqlx::query(
            r#"
            INSERT INTO plant (
              id, name, humidity_sensor_id, pump_id, target,
              watering_cooldown, watering_duration, humidity_tolerance
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(p.humidity_sensor_id)
        .bind(p.pump_id)
        .bind(p.target)
        .bind(p.watering_cooldown)
        .bind(p.watering_duration)
        .bind(p.humidity_tolerance)
        .execute(&self.pool)
        .await
        .context("insert_plant_if_absent failed")?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn get_plant(&self, id: i64) -> Result<Option<PlantRecord>> {
        let row = sqlx::query(&format!("SELECT {PLANT_COLUMNS} FROM plant WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_plant failed")?;
        row.as_ref().map(plant_from_row).transpose()
    }

    pub async fn load_plants(&self) -> Result<Vec<PlantRecord>> {
        let rows = sqlx::query(&format!("SELECT {PLANT_COLUMNS} FROM plant ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .context("load_plants failed")?;
        rows.iter().map(plant_from_row).collect()
    }

    pub async fn plants_for_sensor(&self, sensor_id: i64) -> Result<Vec<PlantRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PLANT_COLUMNS} FROM plant WHERE humidity_sensor_id = ? ORDER BY id"
        ))
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await
        .context("plants_for_sensor failed")?;
        rows.iter().map(plant_from_row).collect()
    }

    pub async fn plants_for_pump(&self, pump_id: i64) -> Result<Vec<PlantRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PLANT_COLUMNS} FROM plant WHERE pump_id = ? ORDER BY id"
        ))
        .bind(pump_id)
        .fetch_all(&self.pool)
        .await
        .context("plants_for_pump failed")?;
        rows.iter().map(plant_from_row).collect()
    }

    // ----------------------------
    // Samples
    // ----------------------------

    pub async fn insert_sample(&self, s: &Sample) -> Result<()> {
        sqlx::query("INSERT INTO sample (sensor_id, ts, value) VALUES (?, ?, ?)")
            .bind(s.sensor_id)
            .bind(to_millis(s.timestamp))
            .bind(s.value)
            .execute(&self.pool)
            .await
            .context("insert_sample failed")?;
        Ok(())
    }

    /// Newest first.
    #[cfg(test)]
    pub async fn recent_samples(&self, sensor_id: i64, limit: i64) -> Result<Vec<Sample>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, ts, value
            FROM sample
            WHERE sensor_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(sensor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_samples failed")?;

        rows.iter()
            .map(|r| -> Result<Sample> {
                Ok(Sample {
                    sensor_id: r.try_get("sensor_id")?,
                    timestamp: from_millis(r.try_get("ts")?)?,
                    value: r.try_get("value")?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn insert_watering_event(&self, e: &WateringEvent) -> Result<()> {
        sqlx::query("INSERT INTO watering_event (plant_id, ts, duration) VALUES (?, ?, ?)")
            .bind(e.plant_id)
            .bind(to_millis(e.timestamp))
            .bind(e.duration)
            .execute(&self.pool)
            .await
            .context("insert_watering_event failed")?;
        Ok(())
    }

    pub async fn last_watering_event(&self, plant_id: i64) -> Result<Option<WateringEvent>> {
        let row = sqlx::query(
            r#"
            SELECT plant_id, ts, duration
            FROM watering_event
            WHERE plant_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("last_watering_event failed")?;

        row.map(|r| -> Result<WateringEvent> {
            Ok(WateringEvent {
                plant_id: r.try_get("plant_id")?,
                timestamp: from_millis(r.try_get("ts")?)?,
                duration: r.try_get("duration")?,
            })
        })
        .transpose()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    pub(crate) async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    pub(crate) fn soil_sensor(id: i64) -> SensorRecord {
        SensorRecord {
            id,
            kind: SensorKind::SoilHumidity,
            name: format!("soil_{id}"),
            unit: "%".into(),
            sample_gap: 60,
        }
    }

    pub(crate) fn plant(id: i64, sensor_id: i64, pump_id: i64) -> PlantRecord {
        PlantRecord {
            id,
            name: format!("plant_{id}"),
            humidity_sensor_id: sensor_id,
            pump_id,
            target: 50,
            watering_cooldown: 300,
            watering_duration: 2,
            humidity_tolerance: 5,
        }
    }

    // -- Sensors ------------------------------------------------------------

    #[tokio::test]
    async fn upsert_sensor_overwrites_by_id() {
        let db = memory_db().await;
        db.upsert_sensor(&soil_sensor(1)).await.unwrap();

        let mut renamed = soil_sensor(1);
        renamed.name = "basil".into();
        renamed.sample_gap = 30;
        db.upsert_sensor(&renamed).await.unwrap();

        let all = db.load_sensors().await.unwrap();
        assert_eq!(all, vec![renamed.clone()]);
        assert_eq!(db.get_sensor(1).await.unwrap(), Some(renamed));
        assert_eq!(db.get_sensor(2).await.unwrap(), None);
    }

    // -- Plants -------------------------------------------------------------

    #[tokio::test]
    async fn upsert_plant_rejects_second_plant_on_same_sensor() {
        let db = memory_db().await;
        db.upsert_sensor(&soil_sensor(1)).await.unwrap();
        db.upsert_plant(&plant(1, 1, 1)).await.unwrap();

        assert!(db.upsert_plant(&plant(2, 1, 2)).await.is_err());
        assert_eq!(db.load_plants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_plant_requires_known_sensor() {
        let db = memory_db().await;
        assert!(db.upsert_plant(&plant(1, 99, 1)).await.is_err());
    }

    #[tokio::test]
    async fn insert_plant_if_absent_reports_conflict() {
        let db = memory_db().await;
        db.upsert_sensor(&soil_sensor(1)).await.unwrap();

        assert!(db.insert_plant_if_absent(&plant(1, 1, 1)).await.unwrap());
        // Same sensor under a new id: rejected, not duplicated.
        assert!(!db.insert_plant_if_absent(&plant(2, 1, 2)).await.unwrap());
        assert_eq!(db.plants_for_sensor(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plants_for_pump_filters() {
        let db = memory_db().await;
        for id in 1..=3 {
            db.upsert_sensor(&soil_sensor(id)).await.unwrap();
        }
        db.upsert_plant(&plant(1, 1, 1)).await.unwrap();
        db.upsert_plant(&plant(2, 2, 1)).await.unwrap();
        db.upsert_plant(&plant(3, 3, 2)).await.unwrap();

        let ids: Vec<i64> = db
            .plants_for_pump(1)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(db.get_plant(3).await.unwrap().unwrap().pump_id, 2);
    }

    // -- Samples ------------------------------------------------------------

    #[tokio::test]
    async fn recent_samples_newest_first() {
        let db = memory_db().await;
        db.upsert_sensor(&soil_sensor(1)).await.unwrap();
        let t0 = datetime!(2024-05-01 12:00:00.250 UTC);

        // Inserted out of order on purpose.
        for (offset, value) in [(10, 2.0), (0, 1.0), (20, 3.0)] {
            db.insert_sample(&Sample {
                sensor_id: 1,
                timestamp: t0 + Duration::seconds(offset),
                value,
            })
            .await
            .unwrap();
        }

        let recent = db.recent_samples(1, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].value, 3.0);
        assert_eq!(recent[0].timestamp, t0 + Duration::seconds(20));
        assert_eq!(recent[1].value, 2.0);
    }

    #[tokio::test]
    async fn sample_for_unknown_sensor_fails() {
        let db = memory_db().await;
        let err = db
            .insert_sample(&Sample {
                sensor_id: 42,
                timestamp: OffsetDateTime::now_utc(),
                value: 1.0,
            })
            .await;
        assert!(err.is_err());
    }

    // -- Watering events ----------------------------------------------------

    #[tokio::test]
    async fn last_watering_event_is_latest() {
        let db = memory_db().await;
        db.upsert_sensor(&soil_sensor(1)).await.unwrap();
        db.upsert_plant(&plant(1, 1, 1)).await.unwrap();
        assert_eq!(db.last_watering_event(1).await.unwrap(), None);

        let t0 = datetime!(2024-05-01 12:00:00 UTC);
        for offset in [0, 600, 300] {
            db.insert_watering_event(&WateringEvent {
                plant_id: 1,
                timestamp: t0 + Duration::seconds(offset),
                duration: 1.0,
            })
            .await
            .unwrap();
        }

        let last = db.last_watering_event(1).await.unwrap().unwrap();
        assert_eq!(last.timestamp, t0 + Duration::seconds(600));
    }
}
