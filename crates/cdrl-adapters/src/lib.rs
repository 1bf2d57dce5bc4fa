//! Report source adapters: CSV row normalization and mailbox report discovery.

mod imap;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use cdrl_core::{CallRecord, Decimal, Direction, IdentityKey, MessageHandle, SourceDocument};
use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc,
};
use chrono_tz::Tz;
use mailparse::{MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crate::imap::ImapMailSession;

pub const CRATE_NAME: &str = "cdrl-adapters";

/// Column that starts the header line of every report export.
pub const HEADER_MARKER: &str = "Call Time";

static EXTENSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{3})\)").expect("extension pattern is valid"));
static PARENTHESIZED_PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{10})\)").expect("phone pattern is valid"));

/// One row of the report export, keyed by column name. Absent columns are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReportRow {
    #[serde(rename = "Call Time", default)]
    pub call_time: String,
    #[serde(rename = "Call ID", default)]
    pub call_id: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "Direction", default)]
    pub direction: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Ringing", default)]
    pub ringing: String,
    #[serde(rename = "Talking", default)]
    pub talking: String,
    #[serde(rename = "Cost", default)]
    pub cost: String,
    #[serde(rename = "Call Activity Details", default)]
    pub activity_details: String,
}

/// `HH:MM:SS` to seconds. Anything else is zero.
pub fn duration_to_seconds(value: &str) -> u32 {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return 0;
    }
    let mut total: u64 = 0;
    for (part, scale) in parts.iter().zip([3600u64, 60, 1]) {
        match part.trim().parse::<u64>() {
            Ok(n) => total = total.saturating_add(n.saturating_mul(scale)),
            Err(_) => return 0,
        }
    }
    u32::try_from(total).unwrap_or(u32::MAX)
}

/// Three-digit extension from `Name (123)`.
pub fn extract_extension(value: &str) -> Option<String> {
    EXTENSION_RE
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Display name from `Name (123)`, whitespace collapsed.
pub fn extract_name(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let before_paren = trimmed.split('(').next().unwrap_or_default().trim();
    let name = if before_paren.is_empty() {
        trimmed
    } else {
        before_paren
    };
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Bare 10-digit NANP number, if one can be recovered.
pub fn normalize_phone(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        return Some(digits[1..].to_string());
    }
    if digits.len() == 10 {
        return Some(digits);
    }
    PARENTHESIZED_PHONE_RE
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn parse_cost(value: &str) -> Decimal {
    match Decimal::from_str(value.trim()) {
        Ok(cost) if !cost.is_sign_negative() => cost,
        _ => Decimal::ZERO,
    }
}

/// Outcome of parsing one report payload.
#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    pub records: Vec<CallRecord>,
    pub duplicates: usize,
    pub skipped_rows: usize,
    pub header_found: bool,
}

/// Converts report rows into [`CallRecord`]s.
///
/// Call times without an offset are read as wall-clock time in `timezone`.
#[derive(Debug, Clone, Copy)]
pub struct RecordParser {
    timezone: Tz,
}

impl RecordParser {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// Wall-clock time in the reporting zone. Ambiguous times take the earlier
    /// offset; times skipped by a spring-forward gap keep the offset in force
    /// just before the gap.
    fn localize(&self, naive: &NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        if let Some(local) = self.timezone.from_local_datetime(naive).earliest() {
            return Some(local.fixed_offset());
        }
        let before_gap = self
            .timezone
            .from_local_datetime(&(*naive - TimeDelta::hours(3)))
            .earliest()?
            .offset()
            .fix();
        before_gap.from_local_datetime(naive).single()
    }

    pub fn parse_call_time(&self, value: &str) -> Option<DateTime<FixedOffset>> {
        let raw = value.trim();
        if raw.is_empty() {
            return None;
        }
        let normalized = match raw.strip_suffix('Z').or_else(|| raw.strip_suffix('z')) {
            Some(stripped) => format!("{stripped}+00:00"),
            None => raw.to_string(),
        };

        if let Ok(ts) = DateTime::parse_from_rfc3339(&normalized) {
            return Some(ts);
        }
        for fmt in [
            "%Y-%m-%dT%H:%M:%S%.f%:z",
            "%Y-%m-%d %H:%M:%S%.f%:z",
            "%Y-%m-%dT%H:%M:%S%.f%z",
            "%Y-%m-%d %H:%M:%S%.f%z",
        ] {
            if let Ok(ts) = DateTime::parse_from_str(&normalized, fmt) {
                return Some(ts);
            }
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
                return self.localize(&naive);
            }
        }
        None
    }

    /// `None` for header repeats, the totals row, and unparseable call times.
    pub fn parse_row(&self, row: &ReportRow, source_identifier: &str) -> Option<CallRecord> {
        let call_time = row.call_time.trim();
        if call_time.is_empty() || call_time == HEADER_MARKER || call_time.starts_with("Totals") {
            debug!(call_time, "skipping non-data row");
            return None;
        }
        let Some(event_timestamp) = self.parse_call_time(call_time) else {
            warn!(call_time, source = source_identifier, "could not parse call time; skipping row");
            return None;
        };

        let direction = Direction::parse(&row.direction);
        let from = row.from.trim();
        let to = row.to.trim();

        let (extension, participant_name, counterparty_number, raw_caller_field) = match &direction
        {
            Direction::Outbound => (
                extract_extension(from),
                extract_name(from),
                normalize_phone(to),
                Some(from.to_string()),
            ),
            Direction::Inbound => (
                extract_extension(to),
                extract_name(to),
                normalize_phone(from),
                Some(from.to_string()),
            ),
            Direction::Internal => (
                extract_extension(from),
                extract_name(from),
                None,
                Some(from.to_string()),
            ),
            Direction::Other(_) => (None, None, None, None),
        };

        Some(CallRecord {
            event_timestamp,
            event_date: event_timestamp.date_naive(),
            external_call_id: row.call_id.trim().to_string(),
            direction,
            status: row.status.trim().to_string(),
            extension,
            participant_name,
            counterparty_number,
            raw_caller_field,
            ring_duration_seconds: duration_to_seconds(&row.ringing),
            talk_duration_seconds: duration_to_seconds(&row.talking),
            cost: parse_cost(&row.cost),
            raw_from_field: from.to_string(),
            raw_to_field: to.to_string(),
            activity_detail: row.activity_details.clone(),
            source_identifier: source_identifier.to_string(),
        })
    }

    /// Parse a whole export. Lines before the header are ignored and rows
    /// repeating an identity tuple are dropped, first occurrence wins.
    pub fn parse_report(&self, text: &str, source_identifier: &str) -> ParsedReport {
        let content = text
            .replace('\u{feff}', "")
            .replace("\r\n", "\n")
            .replace('\r', "\n");
        let lines: Vec<&str> = content.split('\n').collect();
        let Some(header_index) = lines.iter().position(|line| line.starts_with(HEADER_MARKER))
        else {
            warn!(source = source_identifier, "no header row found in report");
            return ParsedReport::default();
        };
        let body = lines[header_index..].join("\n");

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(body.as_bytes());

        let mut report = ParsedReport {
            header_found: true,
            ..ParsedReport::default()
        };
        let mut seen: HashSet<IdentityKey> = HashSet::new();
        for (index, result) in reader.deserialize::<ReportRow>().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(err) => {
                    warn!(source = source_identifier, row = index + 1, error = %err, "unreadable report row");
                    report.skipped_rows += 1;
                    continue;
                }
            };
            match self.parse_row(&row, source_identifier) {
                Some(record) => {
                    if seen.insert(record.identity()) {
                        report.records.push(record);
                    } else {
                        report.duplicates += 1;
                    }
                }
                None => report.skipped_rows += 1,
            }
        }

        if report.duplicates > 0 {
            info!(
                source = source_identifier,
                duplicates = report.duplicates,
                "removed duplicate rows while parsing"
            );
        }
        report
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail connection failed: {0}")]
    Connect(String),
    #[error("mail login failed: {0}")]
    Login(String),
    #[error("mail protocol error: {0}")]
    Protocol(String),
    #[error("message {0} was not returned by the server")]
    MissingMessage(MessageHandle),
}

/// Connection settings for the report mailbox.
#[derive(Clone)]
pub struct MailConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
}

impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

/// A logged-in mailbox session. Handles are only valid for the session that
/// returned them.
#[async_trait]
pub trait MailSession: Send {
    async fn search(
        &mut self,
        subject: &str,
        since: NaiveDate,
    ) -> Result<Vec<MessageHandle>, MailError>;

    /// Raw `Date` header value, if the message has one.
    async fn fetch_date_header(&mut self, handle: MessageHandle)
        -> Result<Option<String>, MailError>;

    /// Full RFC 822 message bytes.
    async fn fetch_message(&mut self, handle: MessageHandle) -> Result<Vec<u8>, MailError>;

    async fn close(&mut self) -> Result<(), MailError>;
}

/// Opens a fresh [`MailSession`]; one session is opened per load run.
#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MailSession>, MailError>;
}

#[async_trait]
impl MailConnector for MailConfig {
    async fn open(&self) -> Result<Box<dyn MailSession>, MailError> {
        Ok(Box::new(ImapMailSession::connect(self).await?))
    }
}

/// Extract the `Date` header from a raw header block.
pub fn date_header_value(raw_headers: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(raw_headers).ok()?;
    headers.get_first_value("Date")
}

/// Calendar date a message was sent, in the offset the sender stamped it with.
pub fn parse_effective_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc2822(value) {
        return Some(ts.date_naive());
    }
    let epoch = mailparse::dateparse(value).ok()?;
    DateTime::<Utc>::from_timestamp(epoch, 0).map(|ts| ts.date_naive())
}

/// Decoded CSV attachment pulled out of a report email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPayload {
    pub attachment_name: String,
    pub text: String,
}

fn collect_parts<'m, 'a>(part: &'m ParsedMail<'a>, out: &mut Vec<&'m ParsedMail<'a>>) {
    out.push(part);
    for sub in &part.subparts {
        collect_parts(sub, out);
    }
}

fn attachment_name(part: &ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
}

fn is_report_attachment_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".csv") || name.contains("DBDATA")
}

/// First attachment named like a report export whose text contains the header.
pub fn find_report_attachment(
    raw_message: &[u8],
) -> Result<Option<ReportPayload>, mailparse::MailParseError> {
    let message = mailparse::parse_mail(raw_message)?;
    let mut parts = Vec::new();
    collect_parts(&message, &mut parts);

    for part in parts {
        let Some(name) = attachment_name(part) else {
            continue;
        };
        if !is_report_attachment_name(&name) {
            continue;
        }
        let bytes = match part.get_body_raw() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(attachment = %name, error = %err, "could not decode attachment");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if text.contains(HEADER_MARKER) {
            return Ok(Some(ReportPayload {
                attachment_name: name,
                text,
            }));
        }
        debug!(attachment = %name, "attachment lacks report header; ignoring");
    }
    Ok(None)
}

/// Finds report emails and pulls their CSV payloads.
pub struct ReportLocator<'a> {
    session: &'a mut dyn MailSession,
    subjects: &'a [String],
}

impl<'a> ReportLocator<'a> {
    pub fn new(session: &'a mut dyn MailSession, subjects: &'a [String]) -> Self {
        Self { session, subjects }
    }

    /// Report emails sent on or after `since`, oldest first. Messages whose
    /// send date cannot be resolved are dropped.
    pub async fn locate(&mut self, since: NaiveDate) -> Vec<SourceDocument> {
        let mut handles = Vec::new();
        let mut seen = HashSet::new();
        for subject in self.subjects {
            match self.session.search(subject, since).await {
                Ok(found) => {
                    for handle in found {
                        if seen.insert(handle) {
                            handles.push(handle);
                        }
                    }
                }
                Err(err) => warn!(subject = %subject, error = %err, "report search failed"),
            }
        }
        info!(count = handles.len(), %since, "found report emails");

        let mut documents = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.session.fetch_date_header(handle).await {
                Ok(Some(value)) => match parse_effective_date(&value) {
                    Some(date) => documents.push(SourceDocument::new(handle, date)),
                    None => warn!(%handle, date = %value, "unparseable Date header; skipping email"),
                },
                Ok(None) => warn!(%handle, "email has no Date header; skipping"),
                Err(err) => warn!(%handle, error = %err, "could not fetch email date"),
            }
        }
        documents.sort_by_key(|doc| (doc.effective_date, doc.handle));
        documents
    }

    /// `None` when the email cannot be fetched or carries no report attachment.
    pub async fn extract_payload(&mut self, handle: MessageHandle) -> Option<ReportPayload> {
        let raw = match self.session.fetch_message(handle).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%handle, error = %err, "could not fetch email");
                return None;
            }
        };
        match find_report_attachment(&raw) {
            Ok(Some(payload)) => {
                info!(%handle, attachment = %payload.attachment_name, "found report attachment");
                Some(payload)
            }
            Ok(None) => {
                warn!(%handle, "no report attachment in email");
                None
            }
            Err(err) => {
                warn!(%handle, error = %err, "could not parse email");
                None
            }
        }
    }
}
