use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ServiceError;

/// Fixed-width UTC timestamp format written by the service
///
/// Six fractional digits keep lexical order equal to chronological order,
/// which the range filter relies on.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// One attendance document, every field rendered as a string
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(default)]
    pub doc_id: String,
    #[serde(default)]
    pub student_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subject_id: String,
    #[serde(default)]
    pub subject_name: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub status: String,
}

/// Writable fields of an attendance document (everything but the id)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFields {
    #[serde(default)]
    pub student_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subject_id: String,
    #[serde(default)]
    pub subject_name: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub status: String,
}

impl RecordFields {
    /// Field name/value pairs in column order
    pub fn pairs(&self) -> [(&'static str, &str); 6] {
        [
            ("student_id", self.student_id.as_str()),
            ("name", self.name.as_str()),
            ("subject_id", self.subject_id.as_str()),
            ("subject_name", self.subject_name.as_str()),
            ("timestamp", self.timestamp.as_str()),
            ("status", self.status.as_str()),
        ]
    }

    pub fn into_record(self, doc_id: impl Into<String>) -> AttendanceRecord {
        AttendanceRecord {
            doc_id: doc_id.into(),
            student_id: self.student_id,
            name: self.name,
            subject_id: self.subject_id,
            subject_name: self.subject_name,
            timestamp: self.timestamp,
            status: self.status,
        }
    }
}

impl From<&AttendanceRecord> for RecordFields {
    fn from(r: &AttendanceRecord) -> Self {
        Self {
            student_id: r.student_id.clone(),
            name: r.name.clone(),
            subject_id: r.subject_id.clone(),
            subject_name: r.subject_name.clone(),
            timestamp: r.timestamp.clone(),
            status: r.status.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("Invalid start_date format. Use YYYY-MM-DD.")]
    InvalidStartDate,
    #[error("Invalid end_date format. Use YYYY-MM-DD.")]
    InvalidEndDate,
}

/// Query string accepted by the attendance list and download endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttendanceQuery {
    pub student_id: Option<String>,
    pub subject_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Conjunction of optional equality and inclusive timestamp range filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendanceFilter {
    pub student_id: Option<String>,
    pub subject_id: Option<String>,
    /// Inclusive lower bound, `YYYY-MM-DDT00:00:00`
    pub from: Option<String>,
    /// Inclusive upper bound, `YYYY-MM-DDT23:59:59.999999`
    pub to: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn parse_day(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

impl AttendanceFilter {
    /// Build a filter from request parameters; empty values are ignored
    pub fn from_query(query: &AttendanceQuery) -> Result<Self, FilterError> {
        let from = match non_empty(&query.start_date) {
            Some(s) => {
                let day = parse_day(s).ok_or(FilterError::InvalidStartDate)?;
                Some(day.format("%Y-%m-%dT00:00:00").to_string())
            }
            None => None,
        };
        let to = match non_empty(&query.end_date) {
            Some(s) => {
                let day = parse_day(s).ok_or(FilterError::InvalidEndDate)?;
                Some(day.format("%Y-%m-%dT23:59:59.999999").to_string())
            }
            None => None,
        };
        Ok(Self {
            student_id: non_empty(&query.student_id).map(str::to_string),
            subject_id: non_empty(&query.subject_id).map(str::to_string),
            from,
            to,
        })
    }

    /// Reference semantics: exact equality and lexical, inclusive range
    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        if let Some(id) = &self.student_id {
            if &record.student_id != id {
                return false;
            }
        }
        if let Some(id) = &self.subject_id {
            if &record.subject_id != id {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if record.timestamp.as_str() < from.as_str() {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if record.timestamp.as_str() > to.as_str() {
                return false;
            }
        }
        true
    }
}

/// Current UTC time in [`TIMESTAMP_FORMAT`]
pub fn now_timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// External document store holding attendance records and subjects
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn query(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>, ServiceError>;

    /// Create a new record, returning its id
    async fn insert(&self, fields: &RecordFields) -> Result<String, ServiceError>;

    /// Merge `fields` into the record at `doc_id`, creating it when absent
    async fn upsert_by_id(&self, doc_id: &str, fields: &RecordFields) -> Result<(), ServiceError>;

    /// Merge `fields` into an existing record; fails when it does not exist
    async fn update_by_id(&self, doc_id: &str, fields: &RecordFields) -> Result<(), ServiceError>;

    async fn add_subject(&self, name: &str) -> Result<Subject, ServiceError>;

    async fn list_subjects(&self) -> Result<Vec<Subject>, ServiceError>;

    async fn get_subject(&self, id: &str) -> Result<Option<Subject>, ServiceError>;
}
