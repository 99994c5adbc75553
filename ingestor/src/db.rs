use crate::errors::{Error, Result};
use crate::model::{
    effective_source, DeviceStatus, InsertedReading, NewReading, Reading, ReadingFilter,
    Statistics, SystemEvent,
};
use chrono::{DateTime, NaiveDate, SubsecRound, TimeDelta, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_QUERY_LIMIT: u32 = 1000;
pub const MAX_QUERY_LIMIT: u32 = 10_000;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Fixed-width UTC format so that text order matches time order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const DATE_FORMAT: &str = "%Y-%m-%d";

const READING_COLUMNS: &str = "id, voltage, current, power_factor, load_kw, kwh, frequency, \
     datetime_str, retry_count, source, received_at, created_at";

/// SQLite-backed store for meter readings and device status.
///
/// Writes go through one async mutex and run inside transactions; reads
/// use the pool directly and only ever see committed data.
pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    default_limit: u32,
    max_limit: u32,
}

impl Store {
    /// Opens (creating if needed) the database file at `path` and applies migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        Self::init(pool).await
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds exactly one connection that never expires, since
    /// every new connection would otherwise see an empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            default_limit: DEFAULT_QUERY_LIMIT,
            max_limit: MAX_QUERY_LIMIT,
        })
    }

    /// Overrides the default and maximum row counts for [`Store::query_readings`].
    pub fn with_query_limits(mut self, default_limit: u32, max_limit: u32) -> Self {
        self.max_limit = max_limit;
        self.default_limit = default_limit.min(max_limit);
        self
    }

    pub async fn insert_reading(&self, reading: &NewReading) -> Result<InsertedReading> {
        self.insert_reading_at(reading, Utc::now()).await
    }

    /// Stores a reading received at `now` and marks its source online.
    ///
    /// The insert and the device-status upsert commit together.
    pub async fn insert_reading_at(
        &self,
        reading: &NewReading,
        now: DateTime<Utc>,
    ) -> Result<InsertedReading> {
        let received_at = now.trunc_subsecs(6);

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r#"
            INSERT INTO meter_readings
                (voltage, current, power_factor, load_kw, kwh, frequency,
                 datetime_str, retry_count, source, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading.voltage)
        .bind(reading.current)
        .bind(reading.power_factor)
        .bind(reading.load_kw)
        .bind(reading.kwh)
        .bind(reading.frequency)
        .bind(reading.device_timestamp.as_deref())
        .bind(reading.retry_count)
        .bind(&reading.source)
        .bind(format_timestamp(received_at))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        upsert_device_status(&mut tx, &reading.source, "online", received_at, false, false)
            .await?;

        tx.commit().await?;

        Ok(InsertedReading { id, received_at })
    }

    /// Newest-first listing with conjunctive filters, capped at the effective limit.
    pub async fn query_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>> {
        let limit = filter.limit.unwrap_or(self.default_limit).min(self.max_limit);

        let mut conditions = Vec::new();
        let mut bind_values: Vec<String> = Vec::new();

        if let Some(source) = filter.effective_source() {
            conditions.push("source = ?");
            bind_values.push(source.to_string());
        }
        if let Some(start) = filter.start_date {
            conditions.push("substr(received_at, 1, 10) >= ?");
            bind_values.push(format_date(start));
        }
        if let Some(end) = filter.end_date {
            conditions.push("substr(received_at, 1, 10) <= ?");
            bind_values.push(format_date(end));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {} FROM meter_readings {} ORDER BY received_at DESC, id DESC LIMIT ?",
            READING_COLUMNS, where_clause
        );

        let mut query_builder = sqlx::query_as::<_, Reading>(&query);
        for value in &bind_values {
            query_builder = query_builder.bind(value);
        }

        let readings = query_builder
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(readings)
    }

    pub async fn latest_reading(&self, source: Option<&str>) -> Result<Option<Reading>> {
        let filter = ReadingFilter {
            source: source.map(str::to_string),
            limit: Some(1),
            ..ReadingFilter::default()
        };
        Ok(self.query_readings(&filter).await?.into_iter().next())
    }

    /// Oldest-first readings whose receive date lies in `[start, end]`, without a row cap.
    pub async fn query_readings_by_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        source: Option<&str>,
    ) -> Result<Vec<Reading>> {
        let source = effective_source(source);
        let source_clause = if source.is_some() { "AND source = ?" } else { "" };

        let query = format!(
            "SELECT {} FROM meter_readings \
             WHERE substr(received_at, 1, 10) BETWEEN ? AND ? {} \
             ORDER BY received_at ASC, id ASC",
            READING_COLUMNS, source_clause
        );

        let mut query_builder = sqlx::query_as::<_, Reading>(&query)
            .bind(format_date(start))
            .bind(format_date(end));
        if let Some(source) = source {
            query_builder = query_builder.bind(source);
        }

        Ok(query_builder.fetch_all(&self.pool).await?)
    }

    pub async fn get_statistics(&self) -> Result<Statistics> {
        self.get_statistics_at(Utc::now()).await
    }

    /// Aggregates computed from one read snapshot, with `now` anchoring the 24 h window.
    pub async fn get_statistics_at(&self, now: DateTime<Utc>) -> Result<Statistics> {
        let mut tx = self.pool.begin().await?;

        let total_readings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meter_readings")
            .fetch_one(&mut *tx)
            .await?;

        let sources: BTreeMap<String, i64> = sqlx::query_as::<_, (String, i64)>(
            "SELECT source, COUNT(*) FROM meter_readings GROUP BY source",
        )
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

        let since = format_timestamp(now - TimeDelta::hours(24));
        let last_24h_readings: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM meter_readings WHERE received_at >= ?")
                .bind(since)
                .fetch_one(&mut *tx)
                .await?;

        let latest_timestamp: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(received_at) FROM meter_readings")
                .fetch_one(&mut *tx)
                .await?;

        let device_statuses = fetch_device_statuses(&mut tx).await?;

        let database_size_bytes: i64 = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let avg_readings_per_hour = if last_24h_readings > 0 {
            round2(last_24h_readings as f64 / 24.0)
        } else {
            0.0
        };

        Ok(Statistics {
            total_readings,
            sources,
            last_24h_readings,
            latest_timestamp,
            avg_readings_per_hour,
            device_statuses,
            database_size_bytes,
            database_size_mb: round2(database_size_bytes as f64 / BYTES_PER_MIB),
        })
    }

    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<u64> {
        self.cleanup_old_data_at(days_to_keep, Utc::now()).await
    }

    /// Deletes every reading received before `now - days_to_keep` days.
    ///
    /// A window reaching past the earliest representable date keeps everything.
    pub async fn cleanup_old_data_at(
        &self,
        days_to_keep: u32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let Some(cutoff) = TimeDelta::try_days(i64::from(days_to_keep))
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(0);
        };

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM meter_readings WHERE received_at < ?")
            .bind(format_timestamp(cutoff))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(deleted)
    }

    pub async fn update_device_status(
        &self,
        source: &str,
        status: &str,
        increment_boot: bool,
        increment_error: bool,
    ) -> Result<DeviceStatus> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let updated = upsert_device_status(
            &mut tx,
            source,
            status,
            Utc::now().trunc_subsecs(6),
            increment_boot,
            increment_error,
        )
        .await?;

        tx.commit().await?;

        Ok(updated)
    }

    pub async fn device_status(&self, source: &str) -> Result<Option<DeviceStatus>> {
        let status = sqlx::query_as::<_, DeviceStatus>(
            "SELECT source, last_seen, status, boot_count, error_count \
             FROM device_status WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    pub async fn device_statuses(&self) -> Result<Vec<DeviceStatus>> {
        let mut conn = self.pool.acquire().await?;
        fetch_device_statuses(&mut conn).await
    }

    pub async fn log_system_event(
        &self,
        level: &str,
        message: &str,
        module: Option<&str>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query("INSERT INTO system_logs (level, message, module) VALUES (?, ?, ?)")
            .bind(level)
            .bind(message)
            .bind(module)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Newest system events first.
    pub async fn recent_system_events(&self, limit: u32) -> Result<Vec<SystemEvent>> {
        let events = sqlx::query_as::<_, SystemEvent>(
            "SELECT id, level, message, module, timestamp \
             FROM system_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Round-trips `SELECT 1`; any failure or a timeout yields `false`.
    pub async fn health_check(&self) -> bool {
        let probe = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.pool);
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe).await,
            Ok(Ok(1))
        )
    }

    /// Writes a consistent copy of the database to `destination`, replacing any file there.
    pub async fn backup(&self, destination: impl AsRef<Path>) -> Result<()> {
        let destination = destination.as_ref();
        let target = destination.to_str().ok_or_else(|| {
            Error::Storage(format!(
                "backup path is not valid UTF-8: {}",
                destination.display()
            ))
        })?;

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let _guard = self.write_lock.lock().await;

        match tokio::fs::remove_file(destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        sqlx::query("VACUUM INTO ?")
            .bind(target)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Closes every pooled connection; later calls fail and `health_check` reports `false`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Read-modify-write of one device row inside the caller's transaction.
async fn upsert_device_status(
    conn: &mut SqliteConnection,
    source: &str,
    status: &str,
    last_seen: DateTime<Utc>,
    increment_boot: bool,
    increment_error: bool,
) -> Result<DeviceStatus> {
    let (boot_count, error_count) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT boot_count, error_count FROM device_status WHERE source = ?",
    )
    .bind(source)
    .fetch_optional(&mut *conn)
    .await?
    .unwrap_or((0, 0));

    let updated = DeviceStatus {
        source: source.to_string(),
        last_seen,
        status: status.to_string(),
        boot_count: boot_count + i64::from(increment_boot),
        error_count: error_count + i64::from(increment_error),
    };

    sqlx::query(
        r#"
        INSERT INTO device_status (source, last_seen, status, boot_count, error_count)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (source) DO UPDATE SET
            last_seen = excluded.last_seen,
            status = excluded.status,
            boot_count = excluded.boot_count,
            error_count = excluded.error_count
        "#,
    )
    .bind(&updated.source)
    .bind(format_timestamp(updated.last_seen))
    .bind(&updated.status)
    .bind(updated.boot_count)
    .bind(updated.error_count)
    .execute(&mut *conn)
    .await?;

    Ok(updated)
}

async fn fetch_device_statuses(conn: &mut SqliteConnection) -> Result<Vec<DeviceStatus>> {
    let statuses = sqlx::query_as::<_, DeviceStatus>(
        "SELECT source, last_seen, status, boot_count, error_count \
         FROM device_status ORDER BY source",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(statuses)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
