//! Load orchestration for CDRL: configuration, gap selection, commit policy,
//! and the run entry points used by the CLI.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cdrl_adapters::{
    MailConfig, MailConnector, MailSession, ParsedReport, RecordParser, ReportLocator,
    ReportPayload,
};
use cdrl_core::{CallRecord, SourceDocument, StoreStats, COVERAGE_WINDOW_DAYS};
use cdrl_storage::{ArchiveOutcome, CallStore, CoverageTracker, PgCallStore, ReportArchive};
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdrl-sync";

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_MAILBOX: &str = "INBOX";
pub const DEFAULT_REPORT_SUBJECTS: [&str; 2] =
    ["Your 3CX Report DB_DATA", "Your 3CX Scheduled Reports"];
const STATUS_MISSING_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

fn lookup_non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn require(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<String, ConfigError> {
    lookup_non_empty(lookup, key).ok_or(ConfigError::Missing(key))
}

fn parse_date(key: &'static str, value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

/// Settings for store-backed commands, read once at startup.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub timezone: Tz,
    /// Earliest date the gap scan looks at.
    pub retention_start: NaiveDate,
    /// Earliest send date searched for in the mailbox.
    pub search_since: NaiveDate,
    pub backfill_anchors: Vec<NaiveDate>,
    pub report_subjects: Vec<String>,
    pub batch_size: usize,
    pub artifacts_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            timezone: chrono_tz::America::New_York,
            retention_start: ymd(2025, 8, 13),
            search_since: ymd(2025, 9, 12),
            backfill_anchors: vec![ymd(2025, 9, 12), ymd(2025, 10, 1), ymd(2025, 11, 1)],
            report_subjects: DEFAULT_REPORT_SUBJECTS.iter().map(|s| s.to_string()).collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            artifacts_dir: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::with_database_url(require(&lookup, "DATABASE_URL")?);

        if let Some(value) = lookup_non_empty(&lookup, "APP_TIMEZONE") {
            config.timezone = value.parse::<Tz>().map_err(|err| ConfigError::Invalid {
                key: "APP_TIMEZONE",
                value: value.clone(),
                reason: err.to_string(),
            })?;
        }
        if let Some(value) = lookup_non_empty(&lookup, "CDRL_RETENTION_START") {
            config.retention_start = parse_date("CDRL_RETENTION_START", &value)?;
        }
        if let Some(value) = lookup_non_empty(&lookup, "CDRL_SEARCH_SINCE") {
            config.search_since = parse_date("CDRL_SEARCH_SINCE", &value)?;
        }
        if let Some(value) = lookup_non_empty(&lookup, "CDRL_BACKFILL_ANCHORS") {
            config.backfill_anchors = value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| parse_date("CDRL_BACKFILL_ANCHORS", part))
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = lookup_non_empty(&lookup, "CDRL_REPORT_SUBJECTS") {
            let subjects: Vec<String> = value
                .split('|')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            if subjects.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "CDRL_REPORT_SUBJECTS",
                    value,
                    reason: "no subjects listed".to_string(),
                });
            }
            config.report_subjects = subjects;
        }
        if let Some(value) = lookup_non_empty(&lookup, "CDRL_BATCH_SIZE") {
            config.batch_size = match value.parse::<usize>() {
                Ok(size) if size > 0 => size,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        key: "CDRL_BATCH_SIZE",
                        value,
                        reason: "must be greater than zero".to_string(),
                    })
                }
                Err(err) => {
                    return Err(ConfigError::Invalid {
                        key: "CDRL_BATCH_SIZE",
                        value,
                        reason: err.to_string(),
                    })
                }
            };
        }
        config.artifacts_dir = lookup_non_empty(&lookup, "CDRL_ARTIFACTS_DIR").map(PathBuf::from);

        Ok(config)
    }
}

pub fn mail_config_from_env() -> Result<MailConfig, ConfigError> {
    mail_config_from_vars(|key| std::env::var(key).ok())
}

pub fn mail_config_from_vars(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<MailConfig, ConfigError> {
    let username = require(&lookup, "EMAIL_ADDRESS")?;
    let password = require(&lookup, "EMAIL_PASSWORD")?;
    let server = require(&lookup, "IMAP_SERVER")?;
    let port = match lookup_non_empty(&lookup, "IMAP_PORT") {
        Some(value) => value.parse::<u16>().map_err(|err| ConfigError::Invalid {
            key: "IMAP_PORT",
            value: value.clone(),
            reason: err.to_string(),
        })?,
        None => DEFAULT_IMAP_PORT,
    };
    let mailbox =
        lookup_non_empty(&lookup, "IMAP_MAILBOX").unwrap_or_else(|| DEFAULT_MAILBOX.to_string());
    Ok(MailConfig {
        server,
        port,
        username,
        password,
        mailbox,
    })
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekdays in `[start, end]`, ascending.
pub fn weekdays_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    if start > end {
        return Vec::new();
    }
    start
        .iter_days()
        .take_while(|date| *date <= end)
        .filter(|date| is_weekday(*date))
        .collect()
}

pub fn missing_weekdays(
    loaded: &BTreeSet<NaiveDate>,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    weekdays_between(start, end)
        .into_iter()
        .filter(|date| !loaded.contains(date))
        .collect()
}

/// Greedy cover of `missing` by report windows, newest report first.
///
/// Returns the chosen documents oldest first. Dates no document covers are
/// logged and left out.
pub fn select_covering_documents(
    documents: &[SourceDocument],
    missing: &[NaiveDate],
) -> Vec<SourceDocument> {
    let mut uncovered: BTreeSet<NaiveDate> = missing.iter().copied().collect();
    let mut newest_first: Vec<&SourceDocument> = documents.iter().collect();
    newest_first.sort_by(|a, b| b.effective_date.cmp(&a.effective_date));

    let mut selected = Vec::new();
    for document in newest_first {
        if uncovered.is_empty() {
            break;
        }
        let covered: Vec<NaiveDate> = uncovered
            .iter()
            .copied()
            .filter(|date| document.covers(*date))
            .collect();
        if covered.is_empty() {
            continue;
        }
        info!(
            effective_date = %document.effective_date,
            covers = covered.len(),
            "selected report email"
        );
        for date in &covered {
            uncovered.remove(date);
        }
        selected.push(document.clone());
    }

    if !uncovered.is_empty() {
        let sample: Vec<String> = uncovered.iter().take(5).map(ToString::to_string).collect();
        warn!(
            count = uncovered.len(),
            dates = %sample.join(", "),
            "no report email covers some missing dates"
        );
    }

    selected.sort_by_key(|doc| (doc.effective_date, doc.handle));
    selected
}

/// The report closest to each anchor (earliest on a tie) plus the newest
/// report, oldest first.
pub fn select_backfill_documents(
    documents: &[SourceDocument],
    anchors: &[NaiveDate],
) -> Vec<SourceDocument> {
    let mut selected: Vec<SourceDocument> = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |doc: &SourceDocument, selected: &mut Vec<SourceDocument>| {
        if seen.insert(doc.handle) {
            selected.push(doc.clone());
        }
    };

    for anchor in anchors {
        let closest = documents.iter().min_by_key(|doc| {
            (
                (doc.effective_date - *anchor).num_days().abs(),
                doc.effective_date,
                doc.handle,
            )
        });
        if let Some(doc) = closest {
            debug!(%anchor, effective_date = %doc.effective_date, "anchor report");
            push(doc, &mut selected);
        }
    }
    if let Some(newest) = documents
        .iter()
        .max_by_key(|doc| (doc.effective_date, doc.handle))
    {
        push(newest, &mut selected);
    }

    selected.sort_by_key(|doc| (doc.effective_date, doc.handle));
    selected
}

pub fn group_by_date(records: Vec<CallRecord>) -> BTreeMap<NaiveDate, Vec<CallRecord>> {
    let mut by_date: BTreeMap<NaiveDate, Vec<CallRecord>> = BTreeMap::new();
    for record in records {
        by_date.entry(record.event_date).or_default().push(record);
    }
    by_date
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub written: u64,
    pub dropped: usize,
}

/// Upsert `records` in chunks. A failed chunk is retried one record at a time
/// and records that still fail are dropped.
pub async fn commit_records(
    store: &dyn CallStore,
    records: &[CallRecord],
    chunk_size: usize,
) -> CommitOutcome {
    let mut outcome = CommitOutcome::default();
    for chunk in records.chunks(chunk_size.max(1)) {
        match store.upsert_records(chunk).await {
            Ok(written) => outcome.written += written,
            Err(err) => {
                warn!(
                    chunk = chunk.len(),
                    error = %err,
                    "chunk upsert failed; retrying records one at a time"
                );
                for record in chunk {
                    match store.upsert_records(std::slice::from_ref(record)).await {
                        Ok(written) => outcome.written += written,
                        Err(err) => {
                            outcome.dropped += 1;
                            error!(
                                call_id = %record.external_call_id,
                                call_time = %record.event_timestamp,
                                error = %err,
                                "dropping record that could not be stored"
                            );
                        }
                    }
                }
            }
        }
    }
    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    GapFill,
    Backfill,
    File,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::GapFill => "gap_fill",
            Self::Backfill => "backfill",
            Self::File => "file",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub missing_dates: usize,
    pub documents_found: usize,
    pub documents_selected: usize,
    pub documents_loaded: usize,
    pub records_parsed: usize,
    pub duplicates_removed: usize,
    pub records_written: u64,
    pub records_dropped: usize,
    pub dates_marked: usize,
    pub dates_skipped: usize,
}

impl RunSummary {
    fn start(mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: now,
            finished_at: now,
            missing_dates: 0,
            documents_found: 0,
            documents_selected: 0,
            documents_loaded: 0,
            records_parsed: 0,
            duplicates_removed: 0,
            records_written: 0,
            records_dropped: 0,
            dates_marked: 0,
            dates_skipped: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        info!(
            run_id = %self.run_id,
            mode = %self.mode,
            documents_loaded = self.documents_loaded,
            records_written = self.records_written,
            records_dropped = self.records_dropped,
            dates_marked = self.dates_marked,
            "load run finished"
        );
        self
    }
}

/// Coverage snapshot printed by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub today: NaiveDate,
    pub stats: StoreStats,
    pub loaded_dates: usize,
    pub coverage_percent: Option<f64>,
    pub missing_recent: Vec<NaiveDate>,
}

fn with_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if value < 0 {
        out.insert(0, '-');
    }
    out
}

impl StatusReport {
    pub fn render(&self) -> String {
        let rule = "=".repeat(60);
        let mut lines = vec![
            rule.clone(),
            "CALL DATA COVERAGE STATUS".to_string(),
            rule.clone(),
        ];
        match (self.stats.min_date, self.stats.max_date) {
            (Some(min), Some(max)) => lines.push(format!("Date Range:     {min} to {max}")),
            _ => lines.push("Date Range:     (no records)".to_string()),
        }
        lines.push(format!(
            "Total Records:  {}",
            with_thousands(self.stats.total_records)
        ));
        lines.push(format!("Days Loaded:    {}", self.stats.days_loaded));
        if let Some(percent) = self.coverage_percent {
            lines.push(format!("Coverage:       {percent:.1}% (weekdays only)"));
        }
        lines.push(String::new());

        if self.missing_recent.is_empty() {
            lines.push(format!(
                "No missing dates in the last {COVERAGE_WINDOW_DAYS} days!"
            ));
        } else {
            lines.push(format!(
                "Missing dates (last {COVERAGE_WINDOW_DAYS} days): {}",
                self.missing_recent.len()
            ));
            for date in self.missing_recent.iter().take(STATUS_MISSING_LIMIT) {
                lines.push(format!("  - {date} ({})", date.format("%A")));
            }
            if self.missing_recent.len() > STATUS_MISSING_LIMIT {
                lines.push(format!(
                    "  ... and {} more",
                    self.missing_recent.len() - STATUS_MISSING_LIMIT
                ));
            }
        }
        lines.push(rule);
        lines.join("\n")
    }
}

/// Loaded dates as a share of the weekdays between the first and last one.
pub fn coverage_percent(loaded: &BTreeSet<NaiveDate>) -> Option<f64> {
    let (first, last) = (loaded.first()?, loaded.last()?);
    let expected = weekdays_between(*first, *last).len();
    if expected == 0 {
        return Some(0.0);
    }
    Some(loaded.len() as f64 / expected as f64 * 100.0)
}

/// Per-run bookkeeping for first-writer-wins.
struct RunLedger {
    loaded_before_run: BTreeSet<NaiveDate>,
    claimed: BTreeSet<NaiveDate>,
}

impl RunLedger {
    fn new(loaded_before_run: BTreeSet<NaiveDate>) -> Self {
        Self {
            loaded_before_run,
            claimed: BTreeSet::new(),
        }
    }
}

async fn close_session(session: &mut dyn MailSession) {
    if let Err(err) = session.close().await {
        warn!(error = %err, "mail session did not close cleanly");
    }
}

/// Runs gap-fill, backfill and file loads against a [`CallStore`].
pub struct LoadOrchestrator {
    store: Arc<dyn CallStore>,
    config: SyncConfig,
    parser: RecordParser,
    archive: Option<ReportArchive>,
}

impl LoadOrchestrator {
    pub fn new(store: Arc<dyn CallStore>, config: SyncConfig) -> Self {
        let parser = RecordParser::new(config.timezone);
        let archive = config.artifacts_dir.clone().map(ReportArchive::new);
        Self {
            store,
            config,
            parser,
            archive,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn tracker(&self) -> CoverageTracker<'_> {
        CoverageTracker::new(self.store.as_ref())
    }

    /// Load whatever is needed to cover weekdays between the retention start
    /// and yesterday that have no coverage marker. The mailbox is only opened
    /// when something is missing.
    pub async fn run_gap_fill(
        &self,
        connector: &dyn MailConnector,
        today: NaiveDate,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::start(RunMode::GapFill);
        let span = info_span!("load_run", run_id = %summary.run_id, mode = %summary.mode);
        self.gap_fill(connector, today, &mut summary)
            .instrument(span)
            .await?;
        Ok(summary.finish())
    }

    async fn gap_fill(
        &self,
        connector: &dyn MailConnector,
        today: NaiveDate,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let loaded = self.tracker().loaded_dates().await;
        let yesterday = today.pred_opt().unwrap_or(today);
        let missing = missing_weekdays(&loaded, self.config.retention_start, yesterday);
        summary.missing_dates = missing.len();

        let (Some(earliest), Some(latest)) = (missing.first(), missing.last()) else {
            info!(loaded = loaded.len(), "every weekday is loaded; nothing to do");
            return Ok(());
        };
        info!(missing = missing.len(), %earliest, %latest, "missing dates detected");

        let mut session = connector.open().await.context("opening mail session")?;
        let mut ledger = RunLedger::new(loaded);
        {
            let mut locator = ReportLocator::new(session.as_mut(), &self.config.report_subjects);
            let documents = locator.locate(self.config.search_since).await;
            summary.documents_found = documents.len();
            let selected = select_covering_documents(&documents, &missing);
            summary.documents_selected = selected.len();
            if selected.is_empty() {
                warn!(found = documents.len(), "no report email covers the missing dates");
            } else {
                self.load_documents(&mut locator, &selected, &mut ledger, summary)
                    .await;
            }
        }
        close_session(session.as_mut()).await;
        Ok(())
    }

    /// Reload the reports nearest the configured anchors plus the newest one,
    /// regardless of existing coverage.
    pub async fn run_backfill(&self, connector: &dyn MailConnector) -> Result<RunSummary> {
        let mut summary = RunSummary::start(RunMode::Backfill);
        let span = info_span!("load_run", run_id = %summary.run_id, mode = %summary.mode);
        self.backfill(connector, &mut summary).instrument(span).await?;
        Ok(summary.finish())
    }

    async fn backfill(&self, connector: &dyn MailConnector, summary: &mut RunSummary) -> Result<()> {
        let mut ledger = RunLedger::new(self.tracker().loaded_dates().await);
        let mut session = connector.open().await.context("opening mail session")?;
        {
            let mut locator = ReportLocator::new(session.as_mut(), &self.config.report_subjects);
            let documents = locator.locate(self.config.search_since).await;
            summary.documents_found = documents.len();
            let selected = select_backfill_documents(&documents, &self.config.backfill_anchors);
            summary.documents_selected = selected.len();
            if selected.is_empty() {
                warn!("no report emails found for backfill");
            } else {
                self.load_documents(&mut locator, &selected, &mut ledger, summary)
                    .await;
            }
        }
        close_session(session.as_mut()).await;
        Ok(())
    }

    /// Load a report export from disk, bypassing the mailbox.
    pub async fn load_csv_file(&self, path: &Path) -> Result<RunSummary> {
        let mut summary = RunSummary::start(RunMode::File);
        let span = info_span!("load_run", run_id = %summary.run_id, mode = %summary.mode);
        self.load_file(path, &mut summary).instrument(span).await?;
        Ok(summary.finish())
    }

    async fn load_file(&self, path: &Path, summary: &mut RunSummary) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!(file = %path.display(), bytes = bytes.len(), "loading report file");
        summary.documents_found = 1;
        summary.documents_selected = 1;

        let text = String::from_utf8_lossy(&bytes);
        let report = self.parser.parse_report(&text, &file_name);
        if report.records.is_empty() {
            warn!(file = %file_name, "no usable records in file");
            return Ok(());
        }
        summary.documents_loaded = 1;
        let mut ledger = RunLedger::new(self.tracker().loaded_dates().await);
        self.commit_report(report, &format!("csv:{file_name}"), None, &mut ledger, summary)
            .await;
        Ok(())
    }

    async fn load_documents(
        &self,
        locator: &mut ReportLocator<'_>,
        documents: &[SourceDocument],
        ledger: &mut RunLedger,
        summary: &mut RunSummary,
    ) {
        for (index, document) in documents.iter().enumerate() {
            let source = document.source_identifier();
            info!(
                document = index + 1,
                of = documents.len(),
                %source,
                "processing report email"
            );
            let Some(payload) = locator.extract_payload(document.handle).await else {
                continue;
            };
            self.archive_payload(document, &payload).await;

            let report = self.parser.parse_report(&payload.text, &source);
            if report.records.is_empty() {
                warn!(%source, "no usable records in report");
                continue;
            }
            summary.documents_loaded += 1;
            let window = (document.window_start(), document.effective_date);
            self.commit_report(report, &source, Some(window), ledger, summary)
                .await;
        }
    }

    async fn archive_payload(&self, document: &SourceDocument, payload: &ReportPayload) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive
            .store(document, &payload.attachment_name, &payload.text)
            .await
        {
            Ok(stored) => debug!(
                path = %stored.path.display(),
                unchanged = stored.outcome == ArchiveOutcome::Unchanged,
                "archived report payload"
            ),
            Err(err) => warn!(
                handle = %document.handle,
                error = ?err,
                "could not archive report payload"
            ),
        }
    }

    /// Commit every date in `report` not yet claimed in this run, then mark
    /// empty weekdays inside the observed span.
    async fn commit_report(
        &self,
        report: ParsedReport,
        coverage_source: &str,
        window: Option<(NaiveDate, NaiveDate)>,
        ledger: &mut RunLedger,
        summary: &mut RunSummary,
    ) {
        summary.records_parsed += report.records.len();
        summary.duplicates_removed += report.duplicates;
        let by_date = group_by_date(report.records);
        let tracker = self.tracker();

        let mut written = 0u64;
        let mut new_dates = 0usize;
        let mut overlapping = 0usize;
        for (date, records) in &by_date {
            if !ledger.claimed.insert(*date) {
                overlapping += 1;
                continue;
            }
            let outcome =
                commit_records(self.store.as_ref(), records, self.config.batch_size).await;
            written += outcome.written;
            summary.records_written += outcome.written;
            summary.records_dropped += outcome.dropped;
            self.mark(&tracker, *date, records.len(), coverage_source, summary)
                .await;
            new_dates += 1;
        }
        summary.dates_skipped += overlapping;

        let mut empty_days = 0usize;
        if let (Some(first), Some(last)) = (by_date.keys().next(), by_date.keys().next_back()) {
            let (start, end) = match window {
                Some((window_start, window_end)) => {
                    ((*first).max(window_start), (*last).min(window_end))
                }
                None => (*first, *last),
            };
            for date in weekdays_between(start, end) {
                if by_date.contains_key(&date) || ledger.loaded_before_run.contains(&date) {
                    continue;
                }
                if !ledger.claimed.insert(date) {
                    continue;
                }
                debug!(%date, "no calls in report for weekday; marking empty");
                self.mark(&tracker, date, 0, coverage_source, summary).await;
                empty_days += 1;
            }
        }

        info!(
            source = coverage_source,
            written,
            new_dates,
            overlapping,
            empty_days,
            "report committed"
        );
    }

    async fn mark(
        &self,
        tracker: &CoverageTracker<'_>,
        date: NaiveDate,
        record_count: usize,
        source: &str,
        summary: &mut RunSummary,
    ) {
        match tracker.mark_loaded(date, record_count, source).await {
            Ok(()) => summary.dates_marked += 1,
            Err(err) => warn!(
                %date,
                error = %err,
                "could not write coverage marker; date will be retried next run"
            ),
        }
    }

    /// Read-only coverage summary.
    pub async fn status(&self, today: NaiveDate) -> Result<StatusReport> {
        let stats = self
            .store
            .stats()
            .await
            .context("reading store statistics")?;
        let loaded = self.tracker().loaded_dates().await;
        let window_start = today
            .checked_sub_days(Days::new(COVERAGE_WINDOW_DAYS))
            .unwrap_or(today);
        Ok(StatusReport {
            today,
            stats,
            loaded_dates: loaded.len(),
            coverage_percent: coverage_percent(&loaded),
            missing_recent: missing_weekdays(&loaded, window_start, today),
        })
    }
}

/// Calendar date "now" in the configured timezone.
pub fn local_today(timezone: Tz) -> NaiveDate {
    Utc::now().with_timezone(&timezone).date_naive()
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<PgCallStore>> {
    let store = PgCallStore::connect(&config.database_url)
        .await
        .context("connecting to call store")?;
    Ok(Arc::new(store))
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let mail = mail_config_from_env()?;
    let store = connect_store(&config).await?;
    let today = local_today(config.timezone);
    let orchestrator = LoadOrchestrator::new(store.clone(), config);
    let result = orchestrator.run_gap_fill(&mail, today).await;
    store.close().await;
    result
}

pub async fn run_backfill_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let mail = mail_config_from_env()?;
    let store = connect_store(&config).await?;
    let orchestrator = LoadOrchestrator::new(store.clone(), config);
    let result = orchestrator.run_backfill(&mail).await;
    store.close().await;
    result
}

pub async fn load_csv_from_env(path: &Path) -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let orchestrator = LoadOrchestrator::new(store.clone(), config);
    let result = orchestrator.load_csv_file(path).await;
    store.close().await;
    result
}

pub async fn status_from_env() -> Result<StatusReport> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let today = local_today(config.timezone);
    let orchestrator = LoadOrchestrator::new(store.clone(), config);
    let result = orchestrator.status(today).await;
    store.close().await;
    result
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let result = store.apply_schema().await;
    store.close().await;
    result
}
