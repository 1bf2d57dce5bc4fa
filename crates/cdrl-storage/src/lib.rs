//! Call record + coverage persistence for CDRL, plus the on-disk report archive.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use cdrl_core::{CallRecord, CoverageEntry, IdentityKey, SourceDocument, StoreStats};
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cdrl-storage";

/// Logical schema for the record and coverage tables, with reporting views.
pub const SCHEMA_DDL: &str = r#"
-- Call detail records, one row per call event.
CREATE TABLE IF NOT EXISTS call_records (
    id BIGSERIAL PRIMARY KEY,
    call_time TIMESTAMPTZ NOT NULL,
    call_id VARCHAR(64) NOT NULL DEFAULT '',
    call_date DATE NOT NULL,
    direction VARCHAR(20) NOT NULL,
    status VARCHAR(20) NOT NULL,
    extension VARCHAR(10),
    employee_name VARCHAR(100),
    phone_number VARCHAR(20),
    caller_id_raw VARCHAR(255),
    ringing_seconds INT NOT NULL DEFAULT 0,
    talking_seconds INT NOT NULL DEFAULT 0,
    cost DECIMAL(10,4) NOT NULL DEFAULT 0,
    from_field VARCHAR(255) NOT NULL DEFAULT '',
    to_field VARCHAR(255) NOT NULL DEFAULT '',
    call_activity_details TEXT,
    source_file VARCHAR(255),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_call UNIQUE (call_time, call_id, from_field, to_field)
);

CREATE INDEX IF NOT EXISTS idx_call_records_date ON call_records(call_date);
CREATE INDEX IF NOT EXISTS idx_call_records_direction ON call_records(direction);
CREATE INDEX IF NOT EXISTS idx_call_records_extension ON call_records(extension);
CREATE INDEX IF NOT EXISTS idx_call_records_phone ON call_records(phone_number);
CREATE INDEX IF NOT EXISTS idx_call_records_status ON call_records(status);
CREATE INDEX IF NOT EXISTS idx_call_records_employee ON call_records(employee_name);

-- One row per calendar date whose records have been committed.
CREATE TABLE IF NOT EXISTS call_load_tracker (
    load_date DATE PRIMARY KEY,
    record_count INT NOT NULL DEFAULT 0,
    source VARCHAR(255),
    loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE OR REPLACE VIEW v_outbound_by_salesperson AS
SELECT
    call_date,
    extension,
    employee_name,
    phone_number,
    COUNT(*) AS total_calls,
    SUM(CASE WHEN status = 'Answered' THEN 1 ELSE 0 END) AS answered,
    SUM(CASE WHEN status = 'Unanswered' THEN 1 ELSE 0 END) AS unanswered,
    ROUND(100.0 * SUM(CASE WHEN status = 'Answered' THEN 1 ELSE 0 END) / NULLIF(COUNT(*), 0), 1) AS connect_rate,
    SUM(talking_seconds) AS total_talk_seconds,
    AVG(talking_seconds) FILTER (WHERE status = 'Answered') AS avg_talk_seconds
FROM call_records
WHERE direction = 'Outbound'
GROUP BY call_date, extension, employee_name, phone_number;

CREATE OR REPLACE VIEW v_inbound_by_employee AS
SELECT
    call_date,
    extension,
    employee_name,
    COUNT(*) AS total_calls,
    SUM(CASE WHEN status = 'Answered' THEN 1 ELSE 0 END) AS answered,
    SUM(CASE WHEN status = 'Unanswered' THEN 1 ELSE 0 END) AS missed,
    SUM(talking_seconds) AS total_talk_seconds,
    AVG(talking_seconds) FILTER (WHERE status = 'Answered') AS avg_talk_seconds,
    AVG(ringing_seconds) AS avg_ring_seconds
FROM call_records
WHERE direction = 'Inbound'
  AND extension IS NOT NULL
  AND extension NOT IN ('801', '807', '808', '809')
GROUP BY call_date, extension, employee_name;

CREATE OR REPLACE VIEW v_daily_summary AS
SELECT
    call_date,
    COUNT(*) AS total_calls,
    SUM(CASE WHEN direction = 'Outbound' THEN 1 ELSE 0 END) AS outbound,
    SUM(CASE WHEN direction = 'Inbound' THEN 1 ELSE 0 END) AS inbound,
    SUM(CASE WHEN direction = 'Internal' THEN 1 ELSE 0 END) AS internal,
    SUM(CASE WHEN status = 'Answered' THEN 1 ELSE 0 END) AS answered,
    SUM(CASE WHEN status = 'Unanswered' THEN 1 ELSE 0 END) AS unanswered,
    SUM(talking_seconds) / 60 AS total_talk_minutes,
    SUM(cost) AS total_cost
FROM call_records
GROUP BY call_date
ORDER BY call_date DESC;

CREATE OR REPLACE VIEW v_repeat_callers AS
SELECT
    phone_number,
    MIN(call_date) AS first_call,
    MAX(call_date) AS last_call,
    COUNT(*) AS total_calls,
    COUNT(DISTINCT call_date) AS days_called,
    SUM(talking_seconds) AS total_talk_seconds
FROM call_records
WHERE direction = 'Inbound'
  AND phone_number IS NOT NULL
  AND LENGTH(phone_number) = 10
GROUP BY phone_number
HAVING COUNT(*) > 1
ORDER BY total_calls DESC;

CREATE OR REPLACE VIEW v_salesperson_daily AS
SELECT
    call_date,
    extension,
    employee_name,
    SUM(CASE WHEN direction = 'Outbound' THEN 1 ELSE 0 END) AS outbound_calls,
    SUM(CASE WHEN direction = 'Outbound' AND status = 'Answered' THEN 1 ELSE 0 END) AS outbound_connected,
    SUM(CASE WHEN direction = 'Inbound' THEN 1 ELSE 0 END) AS inbound_calls,
    SUM(CASE WHEN direction = 'Inbound' AND status = 'Answered' THEN 1 ELSE 0 END) AS inbound_answered,
    SUM(talking_seconds) AS total_talk_seconds,
    ROUND(SUM(talking_seconds) / 60.0, 1) AS total_talk_minutes
FROM call_records
WHERE extension IS NOT NULL
  AND extension BETWEEN '100' AND '199'
GROUP BY call_date, extension, employee_name
ORDER BY call_date DESC, employee_name;
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store rejected write: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence seam for call records and per-date coverage markers.
///
/// Every write is an upsert so repeating a load after a crash is a no-op.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn coverage_dates(&self) -> StoreResult<BTreeSet<NaiveDate>>;

    async fn upsert_coverage(&self, entry: &CoverageEntry) -> StoreResult<()>;

    /// Upsert a batch on the identity tuple. The batch succeeds or fails as a whole.
    async fn upsert_records(&self, records: &[CallRecord]) -> StoreResult<u64>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}

#[derive(Debug, Clone)]
pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to DATABASE_URL")?;
        Ok(Self { pool })
    }

    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA_DDL)
            .execute(&self.pool)
            .await
            .context("applying call record schema")?;
        info!("schema applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn clamp_i32(value: impl TryInto<i32>) -> i32 {
    value.try_into().unwrap_or(i32::MAX)
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn coverage_dates(&self) -> StoreResult<BTreeSet<NaiveDate>> {
        let dates = sqlx::query_scalar::<_, NaiveDate>("SELECT load_date FROM call_load_tracker")
            .fetch_all(&self.pool)
            .await?;
        Ok(dates.into_iter().collect())
    }

    async fn upsert_coverage(&self, entry: &CoverageEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO call_load_tracker (load_date, record_count, source, loaded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (load_date) DO UPDATE
               SET record_count = EXCLUDED.record_count,
                   source = EXCLUDED.source,
                   loaded_at = EXCLUDED.loaded_at
            "#,
        )
        .bind(entry.date)
        .bind(clamp_i32(entry.record_count))
        .bind(&entry.source_identifier)
        .bind(entry.loaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_records(&self, records: &[CallRecord]) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO call_records (call_time, call_id, call_date, direction, status, extension, \
             employee_name, phone_number, caller_id_raw, ringing_seconds, talking_seconds, cost, \
             from_field, to_field, call_activity_details, source_file) ",
        );
        qb.push_values(records, |mut row, record| {
            row.push_bind(record.event_timestamp)
                .push_bind(record.external_call_id.clone())
                .push_bind(record.event_date)
                .push_bind(record.direction.as_str().to_string())
                .push_bind(record.status.clone())
                .push_bind(record.extension.clone())
                .push_bind(record.participant_name.clone())
                .push_bind(record.counterparty_number.clone())
                .push_bind(record.raw_caller_field.clone())
                .push_bind(clamp_i32(record.ring_duration_seconds))
                .push_bind(clamp_i32(record.talk_duration_seconds))
                .push_bind(record.cost)
                .push_bind(record.raw_from_field.clone())
                .push_bind(record.raw_to_field.clone())
                .push_bind(record.activity_detail.clone())
                .push_bind(record.source_identifier.clone());
        });
        qb.push(
            " ON CONFLICT (call_time, call_id, from_field, to_field) DO UPDATE SET \
             call_date = EXCLUDED.call_date, \
             direction = EXCLUDED.direction, \
             status = EXCLUDED.status, \
             extension = EXCLUDED.extension, \
             employee_name = EXCLUDED.employee_name, \
             phone_number = EXCLUDED.phone_number, \
             caller_id_raw = EXCLUDED.caller_id_raw, \
             ringing_seconds = EXCLUDED.ringing_seconds, \
             talking_seconds = EXCLUDED.talking_seconds, \
             cost = EXCLUDED.cost, \
             call_activity_details = EXCLUDED.call_activity_details, \
             source_file = EXCLUDED.source_file",
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let (min_date, max_date, total_records): (Option<NaiveDate>, Option<NaiveDate>, i64) =
            sqlx::query_as("SELECT MIN(call_date), MAX(call_date), COUNT(*) FROM call_records")
                .fetch_one(&self.pool)
                .await?;
        let days_loaded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM call_load_tracker")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            min_date,
            max_date,
            total_records,
            days_loaded,
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<IdentityKey, CallRecord>,
    coverage: BTreeMap<NaiveDate, CoverageEntry>,
    record_batches: usize,
}

/// In-process store with the same upsert semantics as [`PgCallStore`].
///
/// Can be told to reject specific call ids or any multi-record batch, which
/// exercises the per-record fallback in the commit path. Coverage reads and
/// writes can be failed independently.
#[derive(Debug, Default)]
pub struct MemoryCallStore {
    state: Mutex<MemoryState>,
    rejected_call_ids: HashSet<String>,
    reject_multi_record_batches: bool,
    fail_coverage_reads: bool,
    fail_coverage_writes: bool,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.rejected_call_ids.insert(call_id.into());
        self
    }

    pub fn rejecting_multi_record_batches(mut self) -> Self {
        self.reject_multi_record_batches = true;
        self
    }

    pub fn failing_coverage_reads(mut self) -> Self {
        self.fail_coverage_reads = true;
        self
    }

    pub fn failing_coverage_writes(mut self) -> Self {
        self.fail_coverage_writes = true;
        self
    }

    pub async fn records(&self) -> Vec<CallRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn coverage(&self) -> Vec<CoverageEntry> {
        self.state.lock().await.coverage.values().cloned().collect()
    }

    /// Number of record batches that were accepted.
    pub async fn record_batches(&self) -> usize {
        self.state.lock().await.record_batches
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn coverage_dates(&self) -> StoreResult<BTreeSet<NaiveDate>> {
        if self.fail_coverage_reads {
            return Err(StoreError::Rejected("coverage read refused".into()));
        }
        Ok(self.state.lock().await.coverage.keys().copied().collect())
    }

    async fn upsert_coverage(&self, entry: &CoverageEntry) -> StoreResult<()> {
        if self.fail_coverage_writes {
            return Err(StoreError::Rejected(format!(
                "coverage write for {} refused",
                entry.date
            )));
        }
        self.state
            .lock()
            .await
            .coverage
            .insert(entry.date, entry.clone());
        Ok(())
    }

    async fn upsert_records(&self, records: &[CallRecord]) -> StoreResult<u64> {
        if self.reject_multi_record_batches && records.len() > 1 {
            return Err(StoreError::Rejected(format!(
                "batch of {} records refused",
                records.len()
            )));
        }
        if let Some(bad) = records
            .iter()
            .find(|r| self.rejected_call_ids.contains(&r.external_call_id))
        {
            return Err(StoreError::Rejected(format!(
                "call_id={} refused",
                bad.external_call_id
            )));
        }

        let mut state = self.state.lock().await;
        for record in records {
            state.records.insert(record.identity(), record.clone());
        }
        state.record_batches += 1;
        Ok(records.len() as u64)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let state = self.state.lock().await;
        Ok(StoreStats {
            min_date: state.records.values().map(|r| r.event_date).min(),
            max_date: state.records.values().map(|r| r.event_date).max(),
            total_records: state.records.len() as i64,
            days_loaded: state.coverage.len() as i64,
        })
    }
}

/// Reads and writes coverage markers, the authority for "this date is loaded".
pub struct CoverageTracker<'a> {
    store: &'a dyn CallStore,
}

impl<'a> CoverageTracker<'a> {
    pub fn new(store: &'a dyn CallStore) -> Self {
        Self { store }
    }

    /// All dates with a coverage marker. A store failure yields an empty set so
    /// the caller rescans everything instead of aborting.
    pub async fn loaded_dates(&self) -> BTreeSet<NaiveDate> {
        match self.store.coverage_dates().await {
            Ok(dates) => dates,
            Err(err) => {
                warn!(error = %err, "could not read coverage markers; treating store as empty");
                BTreeSet::new()
            }
        }
    }

    pub async fn mark_loaded(
        &self,
        date: NaiveDate,
        record_count: usize,
        source_identifier: &str,
    ) -> StoreResult<()> {
        let entry = CoverageEntry {
            date,
            record_count: i64::try_from(record_count).unwrap_or(i64::MAX),
            source_identifier: source_identifier.to_string(),
            loaded_at: Utc::now(),
        };
        self.store.upsert_coverage(&entry).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Written,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ArchivedReport {
    pub path: PathBuf,
    pub content_hash: String,
    pub outcome: ArchiveOutcome,
}

/// On-disk copy of each extracted report, one file per message and attachment:
/// `<root>/<effective date>/uid-<handle>_<attachment name>`.
///
/// Re-archiving the same report is a no-op. A changed payload for the same
/// message replaces the earlier copy.
#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn report_path(&self, document: &SourceDocument, attachment_name: &str) -> PathBuf {
        let name = attachment_name
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        let name = name.trim_start_matches('.');
        let name = if name.is_empty() { "report.csv" } else { name };
        self.root
            .join(document.effective_date.format("%Y-%m-%d").to_string())
            .join(format!("uid-{}_{name}", document.handle))
    }

    pub async fn store(
        &self,
        document: &SourceDocument,
        attachment_name: &str,
        text: &str,
    ) -> anyhow::Result<ArchivedReport> {
        let path = self.report_path(document, attachment_name);
        let content_hash = Self::sha256_hex(text.as_bytes());

        match fs::read(&path).await {
            Ok(existing) if Self::sha256_hex(&existing) == content_hash => {
                return Ok(ArchivedReport {
                    path,
                    content_hash,
                    outcome: ArchiveOutcome::Unchanged,
                });
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("reading archived report {}", path.display()))
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        fs::write(&partial, text.as_bytes())
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("moving report into {}", path.display()));
        }

        Ok(ArchivedReport {
            path,
            content_hash,
            outcome: ArchiveOutcome::Written,
        })
    }
}
