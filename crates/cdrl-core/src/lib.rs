//! Core domain model for CDRL: call records, coverage markers, and report documents.

use std::fmt;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use rust_decimal::Decimal;

pub const CRATE_NAME: &str = "cdrl-core";

/// Number of days before its send date that a report is declared to cover.
pub const COVERAGE_WINDOW_DAYS: u64 = 30;

/// Call direction as reported by the phone system.
///
/// Unrecognised values are carried through verbatim so the row is still stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Direction {
    Outbound,
    Inbound,
    Internal,
    Other(String),
}

impl Direction {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "Outbound" => Self::Outbound,
            "Inbound" => Self::Inbound,
            "Internal" => Self::Internal,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Outbound => "Outbound",
            Self::Inbound => "Inbound",
            Self::Internal => "Internal",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for Direction {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Direction> for String {
    fn from(value: Direction) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniqueness key for a call record. Two rows sharing it are the same call.
///
/// Timestamps compare as instants, matching `TIMESTAMPTZ` semantics in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub event_timestamp: DateTime<FixedOffset>,
    pub external_call_id: String,
    pub raw_from_field: String,
    pub raw_to_field: String,
}

/// One normalized call event, ready to be upserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub event_timestamp: DateTime<FixedOffset>,
    pub event_date: NaiveDate,
    pub external_call_id: String,
    pub direction: Direction,
    pub status: String,
    pub extension: Option<String>,
    pub participant_name: Option<String>,
    pub counterparty_number: Option<String>,
    pub raw_caller_field: Option<String>,
    pub ring_duration_seconds: u32,
    pub talk_duration_seconds: u32,
    pub cost: Decimal,
    pub raw_from_field: String,
    pub raw_to_field: String,
    pub activity_detail: String,
    pub source_identifier: String,
}

impl CallRecord {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            event_timestamp: self.event_timestamp,
            external_call_id: self.external_call_id.clone(),
            raw_from_field: self.raw_from_field.clone(),
            raw_to_field: self.raw_to_field.clone(),
        }
    }
}

/// Marker that a calendar date has been fully committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageEntry {
    pub date: NaiveDate,
    pub record_count: i64,
    pub source_identifier: String,
    pub loaded_at: DateTime<Utc>,
}

/// Opaque mailbox handle. Only meaningful within the session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageHandle(pub u32);

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A located report email and the date range it claims to cover.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDocument {
    pub handle: MessageHandle,
    pub effective_date: NaiveDate,
}

impl SourceDocument {
    pub fn new(handle: MessageHandle, effective_date: NaiveDate) -> Self {
        Self {
            handle,
            effective_date,
        }
    }

    pub fn window_start(&self) -> NaiveDate {
        self.effective_date
            .checked_sub_days(Days::new(COVERAGE_WINDOW_DAYS))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Whether `date` falls in the declared window (inclusive at both ends).
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.window_start() <= date && date <= self.effective_date
    }

    /// Provenance string recorded on records and coverage markers.
    pub fn source_identifier(&self) -> String {
        format!("email:{}", self.effective_date)
    }
}

/// Aggregate view of the store, used for status output only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
    pub total_records: i64,
    pub days_loaded: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn document_window_is_inclusive_thirty_days() {
        let doc = SourceDocument::new(MessageHandle(7), ymd(2025, 11, 1));
        assert_eq!(doc.window_start(), ymd(2025, 10, 2));
        assert!(doc.covers(ymd(2025, 10, 2)));
        assert!(doc.covers(ymd(2025, 11, 1)));
        assert!(doc.covers(ymd(2025, 10, 15)));
        assert!(!doc.covers(ymd(2025, 10, 1)));
        assert!(!doc.covers(ymd(2025, 11, 2)));
        assert_eq!(doc.source_identifier(), "email:2025-11-01");
    }

    #[test]
    fn identity_compares_timestamps_as_instants() {
        let a = DateTime::parse_from_rfc3339("2025-10-15T14:00:00+00:00").unwrap();
        let b = DateTime::parse_from_rfc3339("2025-10-15T10:00:00-04:00").unwrap();
        let key = |ts| IdentityKey {
            event_timestamp: ts,
            external_call_id: "42".into(),
            raw_from_field: "A".into(),
            raw_to_field: "B".into(),
        };
        assert_eq!(key(a), key(b));
    }

    #[test]
    fn direction_round_trips_unknown_values() {
        assert_eq!(Direction::parse(" Inbound "), Direction::Inbound);
        let other = Direction::parse("Bridged");
        assert_eq!(other, Direction::Other("Bridged".into()));
        assert_eq!(other.as_str(), "Bridged");
        let json = serde_json::to_string(&Direction::Outbound).unwrap();
        assert_eq!(json, "\"Outbound\"");
    }
}
