//! Discovery cycles and the continuous ingestion loop
//!
//! A cycle lists the landing directory, drops paths the ledger has already
//! seen, parses and flattens the rest on a bounded worker pool, and hands the
//! whole batch to [`EventStore::apply_batch`]. Every record of a cycle shares
//! one `_load_ts` taken from a [`LoadClock`].
//!
//! The loop only checks for shutdown between cycles, so a batch that has
//! started always ends in a commit or a rollback.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use quake_common::types::{from_epoch_micros, now_micros, to_epoch_micros};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::document::parse_document;
use crate::error::{IngestError, Result};
use crate::flatten::{flatten_document, Flattened};
use crate::merge::MergeStats;
use crate::models::{LedgerEntry, RawDocument};
use crate::source::DocumentSource;
use crate::storage::EventStore;

/// Strictly increasing source of `_load_ts` values with microsecond precision
///
/// Seeded from the greatest value already committed, so a clock that stepped
/// backwards across a restart still sequences new data after old data.
#[derive(Debug)]
pub struct LoadClock {
    last_micros: AtomicI64,
}

impl Default for LoadClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadClock {
    pub fn new() -> Self {
        Self {
            last_micros: AtomicI64::new(i64::MIN),
        }
    }

    /// Never issue a value at or below `ts`
    pub fn observe(&self, ts: DateTime<Utc>) {
        self.last_micros.fetch_max(to_epoch_micros(ts), Ordering::SeqCst);
    }

    /// Wall-clock now, bumped past the last issued or observed value
    pub fn tick(&self) -> Result<DateTime<Utc>> {
        let now = to_epoch_micros(now_micros());
        let (Ok(prev) | Err(prev)) =
            self.last_micros
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                    Some(now.max(prev.saturating_add(1)))
                });
        Ok(from_epoch_micros(now.max(prev.saturating_add(1)))?)
    }
}

/// What one discovery cycle did
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    #[serde(rename = "_load_ts")]
    pub load_ts: DateTime<Utc>,
    /// Files present in the landing directory
    pub files_discovered: usize,
    /// Unseen files taken into this batch
    pub files_pending: usize,
    pub files_applied: usize,
    pub documents_rejected: usize,
    /// Files that could not be read; left unmarked for the next cycle
    pub read_failures: usize,
    pub records_emitted: usize,
    pub records_dropped: usize,
    pub coercion_warnings: usize,
    /// More unseen files remain than one batch may take
    pub backlog: bool,
    pub merge: MergeStats,
}

impl CycleReport {
    fn new(cycle_id: Uuid, load_ts: DateTime<Utc>, files_discovered: usize) -> Self {
        Self {
            cycle_id,
            load_ts,
            files_discovered,
            files_pending: 0,
            files_applied: 0,
            documents_rejected: 0,
            read_failures: 0,
            records_emitted: 0,
            records_dropped: 0,
            coercion_warnings: 0,
            backlog: false,
            merge: MergeStats::default(),
        }
    }
}

/// Totals over the lifetime of [`Pipeline::run`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub files_applied: usize,
    pub documents_rejected: usize,
    pub read_failures: usize,
    pub records_emitted: usize,
    pub records_dropped: usize,
    pub coercion_warnings: usize,
    pub merge: MergeStats,
}

impl RunSummary {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.files_applied += report.files_applied;
        self.documents_rejected += report.documents_rejected;
        self.read_failures += report.read_failures;
        self.records_emitted += report.records_emitted;
        self.records_dropped += report.records_dropped;
        self.coercion_warnings += report.coercion_warnings;
        self.merge.absorb(&report.merge);
    }
}

/// Per-file result of the read/parse/flatten stage
enum Processed {
    Applied {
        entry: LedgerEntry,
        flattened: Flattened,
    },
    Rejected {
        entry: LedgerEntry,
        error: IngestError,
    },
    Unreadable {
        path: String,
        error: IngestError,
    },
}

/// Parse and flatten one document; CPU-bound, run off the async workers
fn digest(doc: RawDocument, load_ts: DateTime<Utc>) -> Processed {
    match parse_document(&doc.content) {
        Ok(parsed) => {
            let flattened = flatten_document(&parsed, load_ts);
            let entry = LedgerEntry::applied(&doc, flattened.records.len(), flattened.dropped.len());
            Processed::Applied { entry, flattened }
        },
        Err(error) => Processed::Rejected {
            entry: LedgerEntry::rejected(&doc),
            error,
        },
    }
}

pub struct Pipeline {
    source: Arc<dyn DocumentSource>,
    store: EventStore,
    config: IngestConfig,
    clock: LoadClock,
}

impl Pipeline {
    pub async fn new(
        source: Arc<dyn DocumentSource>,
        store: EventStore,
        config: IngestConfig,
    ) -> Result<Self> {
        let clock = LoadClock::new();
        if let Some(latest) = store.latest_load_ts().await? {
            clock.observe(latest);
        }

        Ok(Self {
            source,
            store,
            config,
            clock,
        })
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Run one discovery cycle to commit
    ///
    /// Returns an error only for batch-level failures (discovery timeout,
    /// storage failure, a crashed worker); in that case nothing from the
    /// batch was committed and every file will be offered again.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let timeout = self.config.discovery_timeout();

        let listing = tokio::time::timeout(timeout, self.source.list())
            .await
            .map_err(|_| IngestError::DiscoveryTimeout(timeout))??;
        let files_discovered = listing.len();

        let mut pending = self
            .store
            .ledger()
            .unseen(listing.into_iter().map(|f| f.path).collect())
            .await?;
        let backlog = pending.len() > self.config.max_files_per_cycle;
        pending.truncate(self.config.max_files_per_cycle);

        let load_ts = self.clock.tick()?;
        let mut report = CycleReport::new(cycle_id, load_ts, files_discovered);
        report.files_pending = pending.len();
        report.backlog = backlog;

        if pending.is_empty() {
            debug!(cycle_id = %cycle_id, files_discovered, "No new files");
            return Ok(report);
        }

        info!(
            cycle_id = %cycle_id,
            files_discovered,
            files_pending = pending.len(),
            backlog,
            "Starting ingestion cycle"
        );

        let processed: Vec<Result<Processed>> = stream::iter(pending)
            .map(|path| self.process_file(path, load_ts))
            .buffered(self.config.workers)
            .collect()
            .await;

        let mut records = Vec::new();
        let mut entries = Vec::new();

        for outcome in processed {
            match outcome? {
                Processed::Applied { entry, flattened } => {
                    for dropped in &flattened.dropped {
                        warn!(
                            path = %entry.path,
                            index = dropped.index,
                            reason = %dropped.reason,
                            "Dropped feature"
                        );
                    }
                    for warning in &flattened.warnings {
                        warn!(
                            path = %entry.path,
                            id = %warning.id,
                            field = warning.field,
                            raw = %warning.raw,
                            "Field failed type coercion; stored as null"
                        );
                    }

                    report.files_applied += 1;
                    report.records_emitted += flattened.records.len();
                    report.records_dropped += flattened.dropped.len();
                    report.coercion_warnings += flattened.warnings.len();
                    records.extend(flattened.records);
                    entries.push(entry);
                },
                Processed::Rejected { entry, error } => {
                    warn!(path = %entry.path, error = %error, "Rejected malformed document");
                    report.documents_rejected += 1;
                    entries.push(entry);
                },
                Processed::Unreadable { path, error } => {
                    warn!(path = %path, error = %error, "Could not read document; retrying next cycle");
                    report.read_failures += 1;
                },
            }
        }

        report.merge = self.store.apply_batch(records, &entries).await?;

        info!(
            cycle_id = %cycle_id,
            files_applied = report.files_applied,
            documents_rejected = report.documents_rejected,
            read_failures = report.read_failures,
            records_emitted = report.records_emitted,
            records_dropped = report.records_dropped,
            coercion_warnings = report.coercion_warnings,
            inserted = report.merge.inserted,
            updated = report.merge.updated,
            stale = report.merge.stale,
            "Ingestion cycle committed"
        );

        Ok(report)
    }

    async fn process_file(&self, path: String, load_ts: DateTime<Utc>) -> Result<Processed> {
        let timeout = self.config.discovery_timeout();
        let content = match tokio::time::timeout(timeout, self.source.read(&path)).await {
            Ok(Ok(content)) => content,
            Ok(Err(error)) => return Ok(Processed::Unreadable { path, error }),
            Err(_) => {
                let error = IngestError::Source {
                    path: path.clone(),
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("read did not finish within {:?}", timeout),
                    ),
                };
                return Ok(Processed::Unreadable { path, error });
            },
        };

        let doc = RawDocument::new(path, content, Utc::now());
        tokio::task::spawn_blocking(move || digest(doc, load_ts))
            .await
            .map_err(|e| IngestError::Worker(format!("parse task failed: {}", e)))
    }

    /// Poll until `shutdown` is cancelled
    ///
    /// Retryable cycle failures back off exponentially; after `max_retries`
    /// consecutive failures, or on any other error, the loop stops and
    /// returns it. When a cycle leaves a backlog the next one starts at once.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut failures: u32 = 0;

        info!(
            source = %self.source.describe(),
            poll_interval_secs = self.config.poll_interval_secs,
            workers = self.config.workers,
            "Starting ingestion loop"
        );

        while !shutdown.is_cancelled() {
            let pause = match self.run_cycle().await {
                Ok(report) => {
                    failures = 0;
                    summary.record(&report);
                    if report.backlog {
                        Duration::ZERO
                    } else {
                        self.config.poll_interval()
                    }
                },
                Err(e) if e.is_retryable() && failures < self.config.max_retries => {
                    failures += 1;
                    summary.failed_cycles += 1;
                    let backoff = self.config.retry_backoff(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Cycle failed; retrying"
                    );
                    backoff
                },
                Err(e) => {
                    summary.failed_cycles += 1;
                    error!(error = %e, consecutive_failures = failures + 1, "Ingestion loop giving up");
                    return Err(e);
                },
            };

            if pause.is_zero() {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {},
            }
        }

        info!(
            cycles = summary.cycles,
            failed_cycles = summary.failed_cycles,
            files_applied = summary.files_applied,
            documents_rejected = summary.documents_rejected,
            read_failures = summary.read_failures,
            records_emitted = summary.records_emitted,
            records_dropped = summary.records_dropped,
            coercion_warnings = summary.coercion_warnings,
            "Ingestion loop stopped"
        );

        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::source::SourceFile;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// In-memory source with switchable failure modes
    #[derive(Default)]
    struct MemorySource {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
        unreadable: Mutex<Vec<String>>,
        hang: bool,
        hang_reads: bool,
        fail_listing: bool,
        list_calls: AtomicUsize,
    }

    impl MemorySource {
        fn put(&self, path: &str, body: &str) {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), body.as_bytes().to_vec());
        }
    }

    #[async_trait]
    impl DocumentSource for MemorySource {
        async fn list(&self) -> Result<Vec<SourceFile>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_listing {
                return Err(IngestError::Worker("listing crashed".into()));
            }
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .map(|(path, body)| SourceFile {
                    path: path.clone(),
                    size_bytes: body.len() as u64,
                })
                .collect())
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            if self.hang_reads {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.unreadable.lock().unwrap().iter().any(|p| p == path) {
                return Err(IngestError::Source {
                    path: path.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            Ok(self.files.lock().unwrap().get(path).cloned().unwrap_or_default())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn config() -> IngestConfig {
        IngestConfig {
            namespace: "test".into(),
            workers: 2,
            retry_backoff_ms: 1,
            ..IngestConfig::default()
        }
    }

    async fn pipeline(source: Arc<MemorySource>, config: IngestConfig) -> Pipeline {
        let store = EventStore::in_memory().await.unwrap();
        Pipeline::new(source, store, config).await.unwrap()
    }

    fn event(id: &str, mag: &str) -> String {
        format!(r#"{{"features":[{{"id":"{}","properties":{{"mag":"{}"}}}}]}}"#, id, mag)
    }

    #[test]
    fn test_load_clock_is_strictly_increasing() {
        let clock = LoadClock::new();
        let mut last = clock.tick().unwrap();
        for _ in 0..1000 {
            let next = clock.tick().unwrap();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_load_clock_respects_observed_future() {
        let clock = LoadClock::new();
        let future = Utc.with_ymd_and_hms(2200, 1, 1, 0, 0, 0).unwrap();
        clock.observe(future);
        assert!(clock.tick().unwrap() > future);
    }

    #[tokio::test]
    async fn test_cycle_applies_and_rejects() {
        let source = Arc::new(MemorySource::default());
        source.put("a.json", &event("ev1", "1.5"));
        source.put("b.json", "{\"type\":\"FeatureCollection\"}");
        source.put("c.json", r#"{"features":[{"id":"ev2","properties":{"mag":"x"}},{"properties":{}}]}"#);

        let pipeline = pipeline(source, config()).await;
        let report = pipeline.run_cycle().await.unwrap();

        assert_eq!(report.files_discovered, 3);
        assert_eq!(report.files_applied, 2);
        assert_eq!(report.documents_rejected, 1);
        assert_eq!(report.records_emitted, 2);
        assert_eq!(report.records_dropped, 1);
        assert_eq!(report.coercion_warnings, 1);
        assert_eq!(report.merge.inserted, 2);

        let ledger = pipeline.store().ledger();
        assert_eq!(ledger.count().await.unwrap(), 3);
        assert_eq!(ledger.count_rejected().await.unwrap(), 1);

        let stored = pipeline.store().get("ev1").await.unwrap().unwrap();
        assert_eq!(stored.mag, Some(1.5));
        assert_eq!(stored.load_ts, report.load_ts);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_retried_next_cycle() {
        let source = Arc::new(MemorySource::default());
        source.put("a.json", &event("ev1", "1.0"));
        source.unreadable.lock().unwrap().push("a.json".to_string());

        let pipeline = pipeline(source.clone(), config()).await;
        let first = pipeline.run_cycle().await.unwrap();
        assert_eq!(first.read_failures, 1);
        assert!(!pipeline.store().ledger().is_seen("a.json").await.unwrap());

        source.unreadable.lock().unwrap().clear();
        let second = pipeline.run_cycle().await.unwrap();
        assert_eq!(second.files_applied, 1);
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cycle_cap_leaves_backlog() {
        let source = Arc::new(MemorySource::default());
        for i in 0..5 {
            source.put(&format!("{:02}.json", i), &event(&format!("ev{}", i), "1.0"));
        }
        let config = IngestConfig {
            max_files_per_cycle: 2,
            ..config()
        };

        let pipeline = pipeline(source, config).await;
        let first = pipeline.run_cycle().await.unwrap();
        assert_eq!(first.files_pending, 2);
        assert!(first.backlog);

        pipeline.run_cycle().await.unwrap();
        let last = pipeline.run_cycle().await.unwrap();
        assert_eq!(last.files_pending, 1);
        assert!(!last.backlog);
        assert_eq!(pipeline.store().count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_later_cycle_replaces_event() {
        let source = Arc::new(MemorySource::default());
        source.put("1.json", &event("ev1", "1.0"));

        let pipeline = pipeline(source.clone(), config()).await;
        let first = pipeline.run_cycle().await.unwrap();

        source.put("2.json", &event("ev1", "2.0"));
        let second = pipeline.run_cycle().await.unwrap();

        assert!(second.load_ts > first.load_ts);
        assert_eq!(second.merge.updated, 1);
        let stored = pipeline.store().get("ev1").await.unwrap().unwrap();
        assert_eq!(stored.mag, Some(2.0));
    }

    #[tokio::test]
    async fn test_same_cycle_tie_goes_to_later_file() {
        let source = Arc::new(MemorySource::default());
        source.put("2024/01.json", &event("ev1", "1.0"));
        source.put("2024/02.json", &event("ev1", "2.0"));

        let pipeline = pipeline(source, config()).await;
        let report = pipeline.run_cycle().await.unwrap();

        assert_eq!(report.merge.superseded, 1);
        let stored = pipeline.store().get("ev1").await.unwrap().unwrap();
        assert_eq!(stored.mag, Some(2.0));
    }

    #[tokio::test]
    async fn test_discovery_timeout_is_retryable() {
        let source = Arc::new(MemorySource {
            hang: true,
            ..MemorySource::default()
        });
        let pipeline = pipeline(source, config()).await;

        tokio::time::pause();
        let err = pipeline.run_cycle().await.unwrap_err();
        assert!(matches!(err, IngestError::DiscoveryTimeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_stalled_read_counts_as_unreadable() {
        let source = Arc::new(MemorySource {
            hang_reads: true,
            ..MemorySource::default()
        });
        source.put("a.json", &event("ev1", "1.0"));
        let config = IngestConfig {
            discovery_timeout_secs: 1,
            ..config()
        };
        let pipeline = pipeline(source, config).await;

        let report = tokio::time::timeout(Duration::from_secs(30), pipeline.run_cycle())
            .await
            .expect("Stalled read was not abandoned")
            .unwrap();
        assert_eq!(report.read_failures, 1);
        assert_eq!(report.files_applied, 0);
        assert!(!pipeline.store().ledger().is_seen("a.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_retries() {
        let source = Arc::new(MemorySource {
            fail_listing: true,
            ..MemorySource::default()
        });
        let config = IngestConfig {
            max_retries: 2,
            ..config()
        };
        let pipeline = pipeline(source.clone(), config).await;

        let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, IngestError::Worker(_)));
        assert_eq!(source.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_exits_without_cycle_when_already_cancelled() {
        let source = Arc::new(MemorySource::default());
        let pipeline = pipeline(source.clone(), config()).await;

        let token = CancellationToken::new();
        token.cancel();
        let summary = pipeline.run(token).await.unwrap();

        assert_eq!(summary.cycles, 0);
        assert_eq!(source.list_calls.load(Ordering::SeqCst), 0);
    }
}
