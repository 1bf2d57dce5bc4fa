use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cdrl_adapters::{MailConnector, MailError, MailSession};
use cdrl_core::{CoverageEntry, MessageHandle};
use cdrl_storage::{CallStore, MemoryCallStore};
use cdrl_sync::{weekdays_between, LoadOrchestrator, RunMode, SyncConfig};
use chrono::{NaiveDate, Utc};

const SUBJECT: &str = "Your 3CX Report DB_DATA";
const HEADER: &str =
    "Call Time,Call ID,From,To,Direction,Status,Ringing,Talking,Cost,Call Activity Details";

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// `(call time, call id, status)` rows from one extension to one number.
fn report_csv(rows: &[(&str, &str, &str)]) -> String {
    let mut out = format!("Call Log Report\n{HEADER}\n");
    for (time, id, status) in rows {
        out.push_str(&format!(
            "{time},{id},\"Orlando, Julissa (117)\",5551234567,Outbound,{status},00:00:03,00:01:00,0,\n"
        ));
    }
    out.push_str("Totals,,,,,,,,0,\n");
    out
}

fn report_email(date_header: &str, csv: &str) -> Vec<u8> {
    format!(
        "From: pbx@example.com\r\n\
Date: {date_header}\r\n\
Subject: {SUBJECT}\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"B\"\r\n\r\n\
--B\r\nContent-Type: text/plain\r\n\r\nAttached.\r\n\
--B\r\nContent-Type: text/csv; name=\"DBDATA.csv\"\r\n\
Content-Disposition: attachment; filename=\"DBDATA.csv\"\r\n\
Content-Transfer-Encoding: 8bit\r\n\r\n{csv}\r\n--B--\r\n"
    )
    .into_bytes()
}

struct Message {
    uid: u32,
    date_header: String,
    raw: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    messages: Vec<Message>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fetched: Mutex<Vec<u32>>,
}

impl Mailbox {
    fn with(mut self, uid: u32, date_header: &str, csv: &str) -> Self {
        self.messages.push(Message {
            uid,
            date_header: date_header.to_string(),
            raw: report_email(date_header, csv),
        });
        self
    }

    fn fetched(&self) -> Vec<u32> {
        self.fetched.lock().unwrap().clone()
    }
}

struct ScriptedConnector(Arc<Mailbox>);

struct ScriptedSession(Arc<Mailbox>);

#[async_trait]
impl MailConnector for ScriptedConnector {
    async fn open(&self) -> Result<Box<dyn MailSession>, MailError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession(self.0.clone())))
    }
}

#[async_trait]
impl MailSession for ScriptedSession {
    async fn search(
        &mut self,
        subject: &str,
        _since: NaiveDate,
    ) -> Result<Vec<MessageHandle>, MailError> {
        if subject != SUBJECT {
            return Ok(Vec::new());
        }
        Ok(self.0.messages.iter().map(|m| MessageHandle(m.uid)).collect())
    }

    async fn fetch_date_header(
        &mut self,
        handle: MessageHandle,
    ) -> Result<Option<String>, MailError> {
        Ok(self
            .0
            .messages
            .iter()
            .find(|m| m.uid == handle.0)
            .map(|m| m.date_header.clone()))
    }

    async fn fetch_message(&mut self, handle: MessageHandle) -> Result<Vec<u8>, MailError> {
        self.0.fetched.lock().unwrap().push(handle.0);
        self.0
            .messages
            .iter()
            .find(|m| m.uid == handle.0)
            .map(|m| m.raw.clone())
            .ok_or(MailError::MissingMessage(handle))
    }

    async fn close(&mut self) -> Result<(), MailError> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(retention_start: NaiveDate) -> SyncConfig {
    let mut config = SyncConfig::with_database_url("postgres://unused");
    config.retention_start = retention_start;
    config.search_since = d(2025, 9, 1);
    config
}

async fn seed_coverage(store: &MemoryCallStore, dates: impl IntoIterator<Item = NaiveDate>) {
    for date in dates {
        store
            .upsert_coverage(&CoverageEntry {
                date,
                record_count: 1,
                source_identifier: "seed".into(),
                loaded_at: Utc::now(),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn single_missing_day_fetches_only_the_covering_report() {
    let store = Arc::new(MemoryCallStore::new());
    seed_coverage(
        &store,
        weekdays_between(d(2025, 8, 13), d(2025, 11, 2))
            .into_iter()
            .filter(|date| *date != d(2025, 10, 15)),
    )
    .await;

    let mailbox = Arc::new(
        Mailbox::default()
            .with(1, "Fri, 12 Sep 2025 06:00:00 -0400", &report_csv(&[]))
            .with(2, "Wed, 01 Oct 2025 06:00:00 -0400", &report_csv(&[]))
            .with(
                3,
                "Sat, 01 Nov 2025 06:00:00 -0400",
                &report_csv(&[
                    ("2025-10-15T09:00:00-04:00", "A1", "Answered"),
                    ("2025-10-16T09:00:00-04:00", "A2", "Answered"),
                ]),
            ),
    );
    let orchestrator = LoadOrchestrator::new(store.clone(), config(d(2025, 8, 13)));

    let summary = orchestrator
        .run_gap_fill(&ScriptedConnector(mailbox.clone()), d(2025, 11, 3))
        .await
        .unwrap();

    assert_eq!(summary.mode, RunMode::GapFill);
    assert_eq!(summary.missing_dates, 1);
    assert_eq!(summary.documents_found, 3);
    assert_eq!(summary.documents_selected, 1);
    assert_eq!(mailbox.fetched(), vec![3]);
    assert_eq!(mailbox.opens.load(Ordering::SeqCst), 1);
    assert_eq!(mailbox.closes.load(Ordering::SeqCst), 1);

    let gap = store
        .coverage()
        .await
        .into_iter()
        .find(|entry| entry.date == d(2025, 10, 15))
        .unwrap();
    assert_eq!(gap.record_count, 1);
    assert_eq!(gap.source_identifier, "email:2025-11-01");
    assert_eq!(store.record_count().await, 2);
}

#[tokio::test]
async fn fully_loaded_store_never_contacts_the_mailbox() {
    let store = Arc::new(MemoryCallStore::new());
    seed_coverage(&store, weekdays_between(d(2025, 10, 13), d(2025, 11, 2))).await;
    let mailbox = Arc::new(Mailbox::default());
    let orchestrator = LoadOrchestrator::new(store.clone(), config(d(2025, 10, 13)));

    let summary = orchestrator
        .run_gap_fill(&ScriptedConnector(mailbox.clone()), d(2025, 11, 3))
        .await
        .unwrap();

    assert_eq!(summary.missing_dates, 0);
    assert_eq!(summary.records_written, 0);
    assert_eq!(mailbox.opens.load(Ordering::SeqCst), 0);
}

fn coverage_view(entries: &[CoverageEntry]) -> Vec<(NaiveDate, i64, String)> {
    entries
        .iter()
        .map(|e| (e.date, e.record_count, e.source_identifier.clone()))
        .collect()
}

#[tokio::test]
async fn rerunning_the_pipeline_changes_nothing() {
    let store = Arc::new(MemoryCallStore::new());
    let csv = report_csv(&[
        ("2025-10-13T08:30:00-04:00", "B1", "Answered"),
        ("2025-10-14T10:00:00-04:00", "B2", "Answered"),
        ("2025-10-14T10:00:00-04:00", "B2", "Unanswered"),
        ("2025-10-16T16:45:00-04:00", "B3", "Answered"),
    ]);
    let mailbox = Arc::new(Mailbox::default().with(7, "Fri, 17 Oct 2025 18:00:00 -0400", &csv));
    let connector = ScriptedConnector(mailbox.clone());
    let orchestrator = LoadOrchestrator::new(store.clone(), config(d(2025, 10, 13)));

    let first = orchestrator
        .run_gap_fill(&connector, d(2025, 10, 18))
        .await
        .unwrap();
    let records_after_first = store.records().await;
    let coverage_after_first = coverage_view(&store.coverage().await);

    assert_eq!(first.records_parsed, 3);
    assert_eq!(first.duplicates_removed, 1);
    assert_eq!(records_after_first.len(), 3);
    let b2 = records_after_first
        .iter()
        .find(|r| r.external_call_id == "B2")
        .unwrap();
    assert_eq!(b2.status, "Answered");

    let marked: BTreeSet<NaiveDate> = coverage_after_first.iter().map(|(date, _, _)| *date).collect();
    assert_eq!(
        marked,
        [d(2025, 10, 13), d(2025, 10, 14), d(2025, 10, 15), d(2025, 10, 16)]
            .into_iter()
            .collect()
    );
    let empty_day = coverage_after_first
        .iter()
        .find(|(date, _, _)| *date == d(2025, 10, 15))
        .unwrap();
    assert_eq!(empty_day.1, 0);

    let second = orchestrator
        .run_gap_fill(&connector, d(2025, 10, 18))
        .await
        .unwrap();
    assert_eq!(second.missing_dates, 1);
    assert_eq!(store.records().await, records_after_first);
    assert_eq!(coverage_view(&store.coverage().await), coverage_after_first);
    assert_eq!(mailbox.opens.load(Ordering::SeqCst), mailbox.closes.load(Ordering::SeqCst));
}

#[tokio::test]
async fn earlier_report_keeps_overlapping_dates_within_a_run() {
    let store = Arc::new(MemoryCallStore::new());
    let older = report_csv(&[("2025-10-01T11:00:00-04:00", "C1", "Answered")]);
    let newer = report_csv(&[
        ("2025-10-01T11:00:00-04:00", "C1", "Unanswered"),
        ("2025-10-02T11:00:00-04:00", "C2", "Answered"),
    ]);
    let mailbox = Arc::new(
        Mailbox::default()
            .with(20, "Sat, 01 Nov 2025 06:00:00 -0400", &newer)
            .with(10, "Wed, 01 Oct 2025 06:00:00 -0400", &older),
    );
    let mut cfg = config(d(2025, 9, 1));
    cfg.backfill_anchors = vec![d(2025, 10, 1)];
    let orchestrator = LoadOrchestrator::new(store.clone(), cfg);

    let summary = orchestrator
        .run_backfill(&ScriptedConnector(mailbox.clone()))
        .await
        .unwrap();

    assert_eq!(summary.mode, RunMode::Backfill);
    assert_eq!(mailbox.fetched(), vec![10, 20]);
    assert_eq!(summary.dates_skipped, 1);

    let c1 = store
        .records()
        .await
        .into_iter()
        .find(|r| r.external_call_id == "C1")
        .unwrap();
    assert_eq!(c1.status, "Answered");
    assert_eq!(c1.source_identifier, "email:2025-10-01");

    let coverage = coverage_view(&store.coverage().await);
    assert!(coverage.contains(&(d(2025, 10, 1), 1, "email:2025-10-01".to_string())));
    assert!(coverage.contains(&(d(2025, 10, 2), 1, "email:2025-11-01".to_string())));
}

#[tokio::test]
async fn failed_chunk_falls_back_to_single_records() {
    let store = Arc::new(MemoryCallStore::new().rejecting_call_id("BAD"));
    let mut cfg = config(d(2025, 10, 1));
    cfg.batch_size = 2;
    let orchestrator = LoadOrchestrator::new(store.clone(), cfg);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manual_export.csv");
    let csv = format!(
        "\u{feff}{}",
        report_csv(&[
            ("2025-10-20T09:00:00-04:00", "OK1", "Answered"),
            ("2025-10-20T09:05:00-04:00", "BAD", "Answered"),
            ("2025-10-20T09:10:00-04:00", "OK2", "Answered"),
        ])
    );
    std::fs::write(&path, csv).unwrap();

    let summary = orchestrator.load_csv_file(&path).await.unwrap();

    assert_eq!(summary.mode, RunMode::File);
    assert_eq!(summary.records_written, 2);
    assert_eq!(summary.records_dropped, 1);
    let records = store.records().await;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.source_identifier == "manual_export.csv"));

    let coverage = store.coverage().await;
    assert_eq!(coverage.len(), 1);
    assert_eq!(coverage[0].date, d(2025, 10, 20));
    assert_eq!(coverage[0].record_count, 3);
    assert_eq!(coverage[0].source_identifier, "csv:manual_export.csv");
}

#[tokio::test]
async fn missing_csv_file_is_an_error() {
    let store = Arc::new(MemoryCallStore::new());
    let orchestrator = LoadOrchestrator::new(store, config(d(2025, 10, 1)));
    let err = orchestrator
        .load_csv_file(std::path::Path::new("/nonexistent/report.csv"))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/report.csv"));
}

#[tokio::test]
async fn status_on_empty_store_lists_the_whole_recent_window() {
    let store = Arc::new(MemoryCallStore::new());
    let orchestrator = LoadOrchestrator::new(store, config(d(2025, 8, 13)));
    let today = d(2025, 11, 3);

    let status = orchestrator.status(today).await.unwrap();

    assert_eq!(status.stats.total_records, 0);
    assert_eq!(status.loaded_dates, 0);
    assert_eq!(status.coverage_percent, None);
    assert_eq!(status.missing_recent, weekdays_between(d(2025, 10, 4), today));
    assert!(status.render().contains("Total Records:  0"));
}

#[tokio::test]
async fn payloads_are_archived_when_configured() {
    let store = Arc::new(MemoryCallStore::new());
    let archive_dir = tempfile::tempdir().unwrap();
    let mut cfg = config(d(2025, 10, 13));
    cfg.artifacts_dir = Some(archive_dir.path().to_path_buf());
    let csv = report_csv(&[("2025-10-13T08:30:00-04:00", "D1", "Answered")]);
    let mailbox = Arc::new(Mailbox::default().with(1, "Tue, 14 Oct 2025 06:00:00 -0400", &csv));
    let orchestrator = LoadOrchestrator::new(store, cfg);

    orchestrator
        .run_gap_fill(&ScriptedConnector(mailbox), d(2025, 10, 15))
        .await
        .unwrap();

    let stored = archive_dir.path().join("2025-10-14").join("uid-1_DBDATA.csv");
    let text = std::fs::read_to_string(&stored).unwrap();
    assert!(text.contains("2025-10-13T08:30:00-04:00,D1"));
    assert_eq!(std::fs::read_dir(archive_dir.path()).unwrap().count(), 1);
}

fn two_day_report() -> Arc<Mailbox> {
    let csv = report_csv(&[
        ("2025-10-13T08:30:00-04:00", "E1", "Answered"),
        ("2025-10-14T11:15:00-04:00", "E2", "Unanswered"),
    ]);
    Arc::new(Mailbox::default().with(7, "Fri, 17 Oct 2025 18:00:00 -0400", &csv))
}

#[tokio::test]
async fn unreadable_coverage_rescans_every_retained_weekday() {
    let store = Arc::new(MemoryCallStore::new().failing_coverage_reads());
    seed_coverage(&store, weekdays_between(d(2025, 10, 13), d(2025, 10, 17))).await;
    let mailbox = two_day_report();
    let orchestrator = LoadOrchestrator::new(store.clone(), config(d(2025, 10, 13)));

    let summary = orchestrator
        .run_gap_fill(&ScriptedConnector(mailbox.clone()), d(2025, 10, 18))
        .await
        .unwrap();

    assert_eq!(summary.missing_dates, 5);
    assert_eq!(summary.documents_selected, 1);
    assert_eq!(mailbox.fetched(), vec![7]);
    assert_eq!(summary.records_written, 2);
    assert_eq!(store.record_count().await, 2);
    assert_eq!(mailbox.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unwritable_coverage_still_commits_records() {
    let store = Arc::new(MemoryCallStore::new().failing_coverage_writes());
    let mailbox = two_day_report();
    let orchestrator = LoadOrchestrator::new(store.clone(), config(d(2025, 10, 13)));

    let summary = orchestrator
        .run_gap_fill(&ScriptedConnector(mailbox.clone()), d(2025, 10, 18))
        .await
        .unwrap();

    assert_eq!(summary.records_written, 2);
    assert_eq!(summary.dates_marked, 0);
    assert_eq!(store.record_count().await, 2);
    assert!(store.coverage().await.is_empty());
}

#[test]
fn run_summary_serializes_mode_in_snake_case() {
    let value = serde_json::to_value(RunMode::GapFill).unwrap();
    assert_eq!(value, serde_json::json!("gap_fill"));
}
