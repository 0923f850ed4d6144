//! SQLite-backed event table and batch commit
//!
//! `earthquake_events` holds one row per event id. Every write goes through
//! [`EventStore::apply_batch`], which reduces the batch, upserts each record
//! with a `_load_ts` guard and records the batch's ledger rows, all in one
//! transaction. Timestamps are stored as integers (`_load_ts` in microseconds,
//! `time` in seconds since the epoch) so the guard compares numerically.

use chrono::{DateTime, Utc};
use quake_common::types::{from_epoch_micros, from_epoch_seconds, to_epoch_micros};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::ledger::FileLedger;
use crate::merge::{reduce_latest, MergeStats};
use crate::models::{FlatEventRecord, LedgerEntry};

/// Target table name
pub const EVENTS_TABLE: &str = "earthquake_events";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Column order shared by the upsert statement and [`bind_record`]
const COLUMNS: [&str; 29] = [
    "id", "_load_ts", "time", "mag", "nst", "sig", "tsunami", "felt", "longitude", "latitude",
    "depth", "place", "status", "type", "url", "detail", "cdi", "mmi", "alert", "net", "code",
    "ids", "sources", "types", "dmin", "rms", "gap", "magType", "title",
];

static UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    let columns: Vec<String> = COLUMNS.iter().map(|c| format!("\"{}\"", c)).collect();
    let placeholders: Vec<String> = (1..=COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    let assignments: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    format!(
        "INSERT INTO {table} ({columns}) VALUES ({values}) \
         ON CONFLICT(\"id\") DO UPDATE SET {assignments} \
         WHERE excluded.\"_load_ts\" > {table}.\"_load_ts\"",
        table = EVENTS_TABLE,
        columns = columns.join(", "),
        values = placeholders.join(", "),
        assignments = assignments.join(", "),
    )
});

static SELECT_SQL: LazyLock<String> = LazyLock::new(|| {
    let columns: Vec<String> = COLUMNS.iter().map(|c| format!("\"{}\"", c)).collect();
    format!("SELECT {} FROM {} WHERE \"id\" = ?1", columns.join(", "), EVENTS_TABLE)
});

/// Create tables if absent
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS earthquake_events (
            "id"        TEXT PRIMARY KEY NOT NULL,
            "_load_ts"  INTEGER NOT NULL,   -- microseconds since epoch

            "time"      INTEGER,            -- seconds since epoch
            "mag"       REAL,
            "nst"       REAL,
            "sig"       REAL,
            "tsunami"   REAL,
            "felt"      REAL,

            "longitude" REAL,
            "latitude"  REAL,
            "depth"     REAL,

            "place"     TEXT,
            "status"    TEXT,
            "type"      TEXT,
            "url"       TEXT,
            "detail"    TEXT,
            "cdi"       TEXT,
            "mmi"       TEXT,
            "alert"     TEXT,
            "net"       TEXT,
            "code"      TEXT,
            "ids"       TEXT,
            "sources"   TEXT,
            "types"     TEXT,
            "dmin"      TEXT,
            "rms"       TEXT,
            "gap"       TEXT,
            "magType"   TEXT,
            "title"     TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_files (
            path            TEXT PRIMARY KEY NOT NULL,
            sha256          TEXT NOT NULL,
            size_bytes      INTEGER NOT NULL,
            records_emitted INTEGER NOT NULL,
            records_skipped INTEGER NOT NULL,
            outcome         TEXT NOT NULL,
            processed_at    TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_files_at ON processed_files(processed_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Handle to the event table and its ledger
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
    /// Serializes batch commits issued through this handle
    write_gate: Arc<Mutex<()>>,
}

impl EventStore {
    /// Open (creating if missing) the database at `url` and ensure the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!(url = %url, "Opened event store");
        Self::from_pool(pool).await
    }

    /// Private in-memory database; one connection so all queries share it
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        init_schema(&pool).await?;
        Ok(Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The processed-file ledger stored alongside the table
    pub fn ledger(&self) -> FileLedger {
        FileLedger::new(self.pool.clone())
    }

    /// Merge `records` into the table and record `files` in the ledger, atomically
    ///
    /// Per id, the stored row is replaced in full only when the incoming
    /// `_load_ts` is strictly greater; otherwise the record is counted as
    /// stale. On any error the transaction rolls back and neither the table
    /// nor the ledger changes, so the caller can retry the whole batch.
    pub async fn apply_batch(
        &self,
        records: Vec<FlatEventRecord>,
        files: &[LedgerEntry],
    ) -> Result<MergeStats> {
        let received = records.len();
        let reduced = reduce_latest(records);
        let mut stats = MergeStats {
            received,
            superseded: reduced.superseded,
            ..MergeStats::default()
        };

        let _gate = self.write_gate.lock().await;
        // Take SQLite's write lock before the first read: a deferred transaction
        // that later upgrades fails with SQLITE_BUSY without waiting on
        // busy_timeout when another handle writes concurrently
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        for record in &reduced.records {
            let stored: Option<i64> = sqlx::query_scalar(
                "SELECT \"_load_ts\" FROM earthquake_events WHERE \"id\" = ?1",
            )
            .bind(&record.id)
            .fetch_optional(&mut *tx)
            .await?;

            let incoming = to_epoch_micros(record.load_ts);
            match stored {
                None => stats.inserted += 1,
                Some(current) if current < incoming => stats.updated += 1,
                Some(_) => {
                    stats.stale += 1;
                    debug!(id = %record.id, "Ignoring record not newer than stored version");
                    continue;
                },
            }

            bind_record(sqlx::query(UPSERT_SQL.as_str()), record)
                .execute(&mut *tx)
                .await?;
        }

        FileLedger::record_in(&mut tx, files).await?;

        tx.commit().await?;

        debug!(
            received = stats.received,
            inserted = stats.inserted,
            updated = stats.updated,
            stale = stats.stale,
            files = files.len(),
            "Batch committed"
        );

        Ok(stats)
    }

    /// Stored record for `id`
    pub async fn get(&self, id: &str) -> Result<Option<FlatEventRecord>> {
        let row = sqlx::query(SELECT_SQL.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode_record(&row)).transpose()
    }

    /// Number of rows in the table
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM earthquake_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Greatest `_load_ts` ever committed
    pub async fn latest_load_ts(&self) -> Result<Option<DateTime<Utc>>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(\"_load_ts\") FROM earthquake_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(max.map(from_epoch_micros).transpose()?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_record<'q>(query: SqliteQuery<'q>, r: &'q FlatEventRecord) -> SqliteQuery<'q> {
    query
        .bind(&r.id)
        .bind(to_epoch_micros(r.load_ts))
        .bind(r.time.map(|t| t.timestamp()))
        .bind(r.mag)
        .bind(r.nst)
        .bind(r.sig)
        .bind(r.tsunami)
        .bind(r.felt)
        .bind(r.longitude)
        .bind(r.latitude)
        .bind(r.depth)
        .bind(&r.place)
        .bind(&r.status)
        .bind(&r.event_type)
        .bind(&r.url)
        .bind(&r.detail)
        .bind(&r.cdi)
        .bind(&r.mmi)
        .bind(&r.alert)
        .bind(&r.net)
        .bind(&r.code)
        .bind(&r.ids)
        .bind(&r.sources)
        .bind(&r.types)
        .bind(&r.dmin)
        .bind(&r.rms)
        .bind(&r.gap)
        .bind(&r.mag_type)
        .bind(&r.title)
}

fn decode_record(row: &sqlx::sqlite::SqliteRow) -> Result<FlatEventRecord> {
    let load_ts: i64 = row.try_get("_load_ts")?;
    let time: Option<i64> = row.try_get("time")?;

    Ok(FlatEventRecord {
        id: row.try_get("id")?,
        load_ts: from_epoch_micros(load_ts)?,
        time: time.map(from_epoch_seconds).transpose()?,
        mag: row.try_get("mag")?,
        nst: row.try_get("nst")?,
        sig: row.try_get("sig")?,
        tsunami: row.try_get("tsunami")?,
        felt: row.try_get("felt")?,
        longitude: row.try_get("longitude")?,
        latitude: row.try_get("latitude")?,
        depth: row.try_get("depth")?,
        place: row.try_get("place")?,
        status: row.try_get("status")?,
        event_type: row.try_get("type")?,
        url: row.try_get("url")?,
        detail: row.try_get("detail")?,
        cdi: row.try_get("cdi")?,
        mmi: row.try_get("mmi")?,
        alert: row.try_get("alert")?,
        net: row.try_get("net")?,
        code: row.try_get("code")?,
        ids: row.try_get("ids")?,
        sources: row.try_get("sources")?,
        types: row.try_get("types")?,
        dmin: row.try_get("dmin")?,
        rms: row.try_get("rms")?,
        gap: row.try_get("gap")?,
        mag_type: row.try_get("magType")?,
        title: row.try_get("title")?,
    })
}
