//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding one output record
//! per processed source, its validation warnings, and batch run bookkeeping.
//! [`RecordStore`] is the narrow interface the batch orchestrator writes
//! through.
//!
//! **Access rules:**
//! - `extract`: read-write via [`Storage::open`], writes serialized by an
//!   internal lock, one transaction per saved record
//! - `stats` / `export`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use serde::Serialize;
use tokio::sync::Mutex;

use mcpextract_shared::{Disposition, ExtractorError, OutputRecord, Result, RunId, SourceId};

/// Persistence interface used by the batch orchestrator.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Whether a record for `source` has already been persisted.
    async fn exists(&self, source: &SourceId) -> Result<bool>;

    /// Persist `record`, replacing any earlier record for the same source.
    /// Atomic: the record and its warnings land together or not at all.
    async fn save(&self, record: &OutputRecord) -> Result<()>;

    async fn begin_run(&self, run: &RunId) -> Result<()>;

    /// Store the run's counters so far.
    async fn checkpoint_run(&self, run: &RunId, stats_json: &str) -> Result<()>;

    async fn finish_run(&self, run: &RunId, stats_json: &str) -> Result<()>;
}

/// Record counts per disposition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub approved: u64,
    pub needs_review: u64,
    pub rejected: u64,
    /// `(config_type, count)` ordered by count, `unknown` for untyped records.
    pub by_config_type: Vec<(String, u64)>,
}

/// A row of `batch_runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRunRow {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub stats_json: Option<String>,
}

fn db_err(e: libsql::Error) -> ExtractorError {
    ExtractorError::Storage(e.to_string())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ExtractorError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ExtractorError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            write_lock: Mutex::new(()),
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ExtractorError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ExtractorError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Source records
    // -----------------------------------------------------------------------

    /// Upsert a record and replace its warnings in one transaction.
    pub async fn save_record(&self, record: &OutputRecord) -> Result<()> {
        self.check_writable()?;
        let record_json = serde_json::to_string(record)
            .map_err(|e| ExtractorError::Storage(format!("record serialization: {e}")))?;

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "INSERT INTO sources (source_id, name, disposition, confidence, config_type,
                                  bundle_hash, attempts, record_json, error, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(source_id) DO UPDATE SET
               name = excluded.name,
               disposition = excluded.disposition,
               confidence = excluded.confidence,
               config_type = excluded.config_type,
               bundle_hash = excluded.bundle_hash,
               attempts = excluded.attempts,
               record_json = excluded.record_json,
               error = excluded.error,
               processed_at = excluded.processed_at",
            params![
                record.source_id.as_str(),
                record.name.as_deref(),
                record.disposition.as_str(),
                record.confidence,
                record.config_type.map(|c| c.as_str()),
                record.bundle_hash.as_deref(),
                i64::from(record.attempts),
                record_json.as_str(),
                record.error.as_deref(),
                record.processed_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(db_err)?;

        tx.execute(
            "DELETE FROM source_warnings WHERE source_id = ?1",
            params![record.source_id.as_str()],
        )
        .await
        .map_err(db_err)?;

        for (position, message) in record.warnings.iter().enumerate() {
            tx.execute(
                "INSERT INTO source_warnings (source_id, position, message) VALUES (?1, ?2, ?3)",
                params![record.source_id.as_str(), position as i64, message.as_str()],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(
            source = %record.source_id,
            disposition = %record.disposition,
            "record saved"
        );
        Ok(())
    }

    /// Whether a record for `source` exists.
    pub async fn has_record(&self, source: &SourceId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM sources WHERE source_id = ?1",
                params![source.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    /// Get the persisted record for `source`.
    pub async fn get_record(&self, source: &SourceId) -> Result<Option<OutputRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM sources WHERE source_id = ?1",
                params![source.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// List records, optionally filtered by disposition, ordered by source.
    pub async fn list_records(&self, disposition: Option<Disposition>) -> Result<Vec<OutputRecord>> {
        let mut rows = match disposition {
            Some(d) => {
                self.conn
                    .query(
                        "SELECT record_json FROM sources WHERE disposition = ?1 ORDER BY source_id",
                        params![d.as_str()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        "SELECT record_json FROM sources ORDER BY source_id",
                        params![],
                    )
                    .await
            }
        }
        .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_record(&row)?);
        }
        Ok(results)
    }

    /// Warnings stored for `source`, in their original order.
    pub async fn warnings_for(&self, source: &SourceId) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT message FROM source_warnings WHERE source_id = ?1 ORDER BY position",
                params![source.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(results)
    }

    /// Counts per disposition and per install method.
    pub async fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        let mut rows = self
            .conn
            .query(
                "SELECT disposition, COUNT(*) FROM sources GROUP BY disposition",
                params![],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let disposition: Disposition = row.get::<String>(0).map_err(db_err)?.parse()?;
            let count = row.get::<i64>(1).map_err(db_err)? as u64;
            stats.total += count;
            match disposition {
                Disposition::Approved => stats.approved = count,
                Disposition::NeedsReview => stats.needs_review = count,
                Disposition::Rejected => stats.rejected = count,
            }
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(config_type, 'unknown'), COUNT(*) FROM sources
                 GROUP BY 1 ORDER BY 2 DESC, 1",
                params![],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            stats.by_config_type.push((
                row.get::<String>(0).map_err(db_err)?,
                row.get::<i64>(1).map_err(db_err)? as u64,
            ));
        }

        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Batch runs
    // -----------------------------------------------------------------------

    /// Insert a new run row.
    pub async fn insert_run(&self, run: &RunId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO batch_runs (id, started_at) VALUES (?1, ?2)",
                params![run.to_string(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Update a run's stats, optionally marking it finished.
    pub async fn update_run(&self, run: &RunId, stats_json: &str, finished: bool) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let finished_at = finished.then(|| Utc::now().to_rfc3339());
        self.conn
            .execute(
                "UPDATE batch_runs SET stats_json = ?1, finished_at = COALESCE(?2, finished_at)
                 WHERE id = ?3",
                params![stats_json, finished_at, run.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_run(&self, run: &RunId) -> Result<Option<BatchRunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, stats_json FROM batch_runs WHERE id = ?1",
                params![run.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(BatchRunRow {
                id: row.get::<String>(0).map_err(db_err)?,
                started_at: row.get::<String>(1).map_err(db_err)?,
                finished_at: row.get::<String>(2).ok(),
                stats_json: row.get::<String>(3).ok(),
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RecordStore for Storage {
    async fn exists(&self, source: &SourceId) -> Result<bool> {
        self.has_record(source).await
    }

    async fn save(&self, record: &OutputRecord) -> Result<()> {
        self.save_record(record).await
    }

    async fn begin_run(&self, run: &RunId) -> Result<()> {
        self.insert_run(run).await
    }

    async fn checkpoint_run(&self, run: &RunId, stats_json: &str) -> Result<()> {
        self.update_run(run, stats_json, false).await
    }

    async fn finish_run(&self, run: &RunId, stats_json: &str) -> Result<()> {
        self.update_run(run, stats_json, true).await
    }
}

fn row_to_record(row: &libsql::Row) -> Result<OutputRecord> {
    let json = row.get::<String>(0).map_err(db_err)?;
    serde_json::from_str(&json)
        .map_err(|e| ExtractorError::Storage(format!("corrupt record_json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpextract_shared::{InstallMethod, ValidationReport};
    use uuid::Uuid;

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("mcpx_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn record(url: &str, disposition: Disposition, warnings: &[&str]) -> OutputRecord {
        let candidate = mcpextract_shared::CandidateConfig::from_value(serde_json::json!({
            "name": "weather",
            "command": "npx",
            "args": ["-y", "@acme/weather"],
            "env": {}
        }))
        .unwrap();
        let mut report = ValidationReport::default();
        for w in warnings {
            report.note(*w);
        }
        OutputRecord::from_scored(
            SourceId::parse(url).unwrap(),
            &candidate,
            &report,
            disposition,
            0.95,
        )
        .with_attempts(1)
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("mcpx_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn save_then_exists_and_get() {
        let storage = test_storage().await;
        let rec = record("https://github.com/acme/weather", Disposition::Approved, &[]);

        assert!(!storage.exists(&rec.source_id).await.unwrap());
        storage.save(&rec).await.expect("save");
        assert!(storage.exists(&rec.source_id).await.unwrap());

        let loaded = storage.get_record(&rec.source_id).await.unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("weather"));
        assert_eq!(loaded.config_type, Some(InstallMethod::Npx));
        assert_eq!(loaded.disposition, Disposition::Approved);
    }

    #[tokio::test]
    async fn save_replaces_record_and_warnings() {
        let storage = test_storage().await;
        let first = record(
            "https://github.com/acme/weather",
            Disposition::NeedsReview,
            &["a", "b", "c"],
        );
        storage.save(&first).await.unwrap();
        assert_eq!(
            storage.warnings_for(&first.source_id).await.unwrap(),
            vec!["a", "b", "c"]
        );

        let second = record("https://github.com/acme/weather", Disposition::Approved, &["z"]);
        storage.save(&second).await.unwrap();

        let all = storage.list_records(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].disposition, Disposition::Approved);
        assert_eq!(storage.warnings_for(&second.source_id).await.unwrap(), vec!["z"]);
    }

    #[tokio::test]
    async fn failed_save_leaves_no_partial_record() {
        let tmp = std::env::temp_dir().join(format!("mcpx_test_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.unwrap();
        storage
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON source_warnings
                 WHEN NEW.message = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'warning rejected'); END;",
            )
            .await
            .unwrap();

        let broken = record("https://github.com/a/b", Disposition::NeedsReview, &["ok", "boom"]);
        assert!(storage.save(&broken).await.is_err());
        assert!(!storage.exists(&broken.source_id).await.unwrap());
        assert!(storage.warnings_for(&broken.source_id).await.unwrap().is_empty());

        // The connection stays usable after the rollback.
        let fine = record("https://github.com/a/c", Disposition::Approved, &["ok"]);
        storage.save(&fine).await.unwrap();
        drop(storage);

        let reopened = Storage::open(&tmp).await.unwrap();
        assert!(!reopened.exists(&broken.source_id).await.unwrap());
        assert!(reopened.exists(&fine.source_id).await.unwrap());
        assert_eq!(reopened.warnings_for(&fine.source_id).await.unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn list_and_stats_by_disposition() {
        let storage = test_storage().await;
        storage
            .save(&record("https://github.com/a/one", Disposition::Approved, &[]))
            .await
            .unwrap();
        storage
            .save(&record("https://github.com/a/two", Disposition::Approved, &[]))
            .await
            .unwrap();
        storage
            .save(&OutputRecord::failed(
                SourceId::parse("https://github.com/a/three").unwrap(),
                "source inaccessible",
            ))
            .await
            .unwrap();

        let rejected = storage
            .list_records(Some(Disposition::Rejected))
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].error.as_deref(), Some("source inaccessible"));

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.approved, 2);
        assert_eq!(stats.needs_review, 0);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.by_config_type[0], ("npx".to_string(), 2));
        assert!(stats.by_config_type.contains(&("unknown".to_string(), 1)));
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let storage = test_storage().await;
        let run = RunId::new();

        storage.begin_run(&run).await.expect("begin");
        storage
            .checkpoint_run(&run, r#"{"processed": 5}"#)
            .await
            .expect("checkpoint");
        let row = storage.get_run(&run).await.unwrap().unwrap();
        assert!(row.finished_at.is_none());
        assert_eq!(row.stats_json.as_deref(), Some(r#"{"processed": 5}"#));

        storage
            .finish_run(&run, r#"{"processed": 7}"#)
            .await
            .expect("finish");
        let row = storage.get_run(&run).await.unwrap().unwrap();
        assert!(row.finished_at.is_some());
        assert!(row.stats_json.unwrap().contains('7'));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("mcpx_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.save(&record("https://github.com/a/one", Disposition::Approved, &[]))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_records(None).await.unwrap().len(), 1);
        let result = ro
            .save(&record("https://github.com/a/two", Disposition::Approved, &[]))
            .await;
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("mcpx_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
