//! Processed-file ledger
//!
//! Remembers every input path the pipeline has consumed so discovery never
//! hands the same file to the merge twice, across restarts included. Rows for
//! a batch are written by [`FileLedger::record_in`] inside the batch's own
//! transaction; a crash before commit loses both the rows and the merge, and
//! the files are simply picked up again.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::HashSet;

use crate::error::Result;
use crate::models::{FileOutcome, LedgerEntry};

/// Paths looked up per statement, below SQLite's bound-parameter limit
const LOOKUP_CHUNK: usize = 500;

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    path: String,
    sha256: String,
    size_bytes: i64,
    records_emitted: i64,
    records_skipped: i64,
    outcome: String,
    processed_at: String,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = crate::error::IngestError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        let processed_at = DateTime::parse_from_rfc3339(&row.processed_at)
            .map_err(|e| {
                crate::error::IngestError::parse("processed_at", format!("{}: {}", row.path, e))
            })?
            .with_timezone(&Utc);

        Ok(LedgerEntry {
            path: row.path,
            sha256: row.sha256,
            size_bytes: row.size_bytes,
            records_emitted: row.records_emitted,
            records_skipped: row.records_skipped,
            outcome: FileOutcome::from(row.outcome),
            processed_at,
        })
    }
}

/// Ledger handle sharing the event store's pool
#[derive(Clone)]
pub struct FileLedger {
    pool: SqlitePool,
}

impl FileLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether `path` has already been consumed
    pub async fn is_seen(&self, path: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_files WHERE path = ?1")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    /// Record a single path outside of any batch; repeated calls are no-ops
    pub async fn mark_seen(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_files (
                path, sha256, size_bytes, records_emitted, records_skipped, outcome, processed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(path) DO NOTHING
            "#,
        )
        .bind(&entry.path)
        .bind(&entry.sha256)
        .bind(entry.size_bytes)
        .bind(entry.records_emitted)
        .bind(entry.records_skipped)
        .bind(entry.outcome.as_str())
        .bind(entry.processed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a batch's paths inside its transaction
    ///
    /// A path that is already present fails the statement, and with it the
    /// whole batch: two writers raced on the same file and this one must not
    /// apply it a second time.
    pub async fn record_in(tx: &mut Transaction<'_, Sqlite>, entries: &[LedgerEntry]) -> Result<()> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO processed_files (
                    path, sha256, size_bytes, records_emitted, records_skipped, outcome, processed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&entry.path)
            .bind(&entry.sha256)
            .bind(entry.size_bytes)
            .bind(entry.records_emitted)
            .bind(entry.records_skipped)
            .bind(entry.outcome.as_str())
            .bind(entry.processed_at.to_rfc3339())
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Keep only the paths not yet consumed, preserving order
    pub async fn unseen(&self, paths: Vec<String>) -> Result<Vec<String>> {
        if paths.is_empty() {
            return Ok(paths);
        }

        let mut seen: HashSet<String> = HashSet::new();
        for chunk in paths.chunks(LOOKUP_CHUNK) {
            let mut query =
                QueryBuilder::<Sqlite>::new("SELECT path FROM processed_files WHERE path IN (");
            let mut binds = query.separated(", ");
            for path in chunk {
                binds.push_bind(path);
            }
            binds.push_unseparated(")");

            let found: Vec<String> = query.build_query_scalar().fetch_all(&self.pool).await?;
            seen.extend(found);
        }

        Ok(paths.into_iter().filter(|p| !seen.contains(p)).collect())
    }

    /// Number of consumed paths
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Number of consumed paths that were rejected as malformed
    pub async fn count_rejected(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processed_files WHERE outcome = ?1")
                .bind(FileOutcome::Rejected.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Most recently processed entries first
    pub async fn list(&self, limit: i64) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT path, sha256, size_bytes, records_emitted, records_skipped, outcome, processed_at
            FROM processed_files
            ORDER BY processed_at DESC, path DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::RawDocument;
    use crate::storage::EventStore;
    use chrono::TimeZone;

    fn entry(path: &str, secs: i64) -> LedgerEntry {
        let doc = RawDocument::new(path, b"{\"features\":[]}".to_vec(), Utc.timestamp_opt(secs, 0).unwrap());
        LedgerEntry::applied(&doc, 0, 0)
    }

    #[tokio::test]
    async fn test_mark_and_check() {
        let store = EventStore::in_memory().await.unwrap();
        let ledger = store.ledger();

        assert!(!ledger.is_seen("a.json").await.unwrap());
        ledger.mark_seen(&entry("a.json", 1)).await.unwrap();
        assert!(ledger.is_seen("a.json").await.unwrap());

        // idempotent
        ledger.mark_seen(&entry("a.json", 2)).await.unwrap();
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unseen_preserves_order() {
        let store = EventStore::in_memory().await.unwrap();
        let ledger = store.ledger();
        ledger.mark_seen(&entry("b.json", 1)).await.unwrap();

        let remaining = ledger
            .unseen(vec!["c.json".into(), "b.json".into(), "a.json".into()])
            .await
            .unwrap();
        assert_eq!(remaining, vec!["c.json".to_string(), "a.json".to_string()]);
    }

    #[tokio::test]
    async fn test_unseen_spans_several_lookups() {
        let store = EventStore::in_memory().await.unwrap();
        let ledger = store.ledger();

        let paths: Vec<String> = (0..LOOKUP_CHUNK * 2 + 7).map(|i| format!("{:05}.json", i)).collect();
        for path in paths.iter().step_by(3) {
            ledger.mark_seen(&entry(path, 1)).await.unwrap();
        }
        // consumed but not in this listing
        ledger.mark_seen(&entry("elsewhere.json", 1)).await.unwrap();

        let remaining = ledger.unseen(paths.clone()).await.unwrap();
        let expected: Vec<String> = paths
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(remaining, expected);
    }

    #[tokio::test]
    async fn test_list_round_trips_entries() {
        let store = EventStore::in_memory().await.unwrap();
        let ledger = store.ledger();

        let first = entry("2024/01/a.json", 10);
        let mut second = entry("2024/01/b.json", 20);
        second.outcome = FileOutcome::Rejected;
        ledger.mark_seen(&first).await.unwrap();
        ledger.mark_seen(&second).await.unwrap();

        let recent = ledger.list(10).await.unwrap();
        assert_eq!(recent, vec![second, first]);
        assert_eq!(ledger.count_rejected().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_in_rolls_back_with_transaction() {
        let store = EventStore::in_memory().await.unwrap();
        let ledger = store.ledger();

        let mut tx = store.pool().begin().await.unwrap();
        FileLedger::record_in(&mut tx, &[entry("x.json", 1)]).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(!ledger.is_seen("x.json").await.unwrap());
    }
}
