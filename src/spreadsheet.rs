use calamine::{Data, DataType, Reader, Xlsx};
use log::debug;
use rust_xlsxwriter::{Workbook, XlsxError};
use std::io::Cursor;
use thiserror::Error;

use crate::constants::ATTENDANCE_COLUMNS;
use crate::error::ServiceError;
use crate::store::{AttendanceRecord, AttendanceStore, RecordFields, TIMESTAMP_FORMAT};

pub const EXPORT_SHEET: &str = "Attendance";
pub const TEMPLATE_SHEET: &str = "Attendance Template";

#[derive(Debug, Error)]
pub enum ImportError {
    /// First row is not the expected column header
    #[error("Incorrect template format")]
    Format,
    /// Bytes are not a readable workbook
    #[error("Failed to read Excel file: {0}")]
    Read(String),
}

/// One data row of an uploaded sheet
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub doc_id: String,
    pub fields: RecordFields,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImportSummary {
    /// Rows merged into an existing document id
    pub updated: usize,
    /// Rows created as new documents
    pub inserted: usize,
}

fn workbook_with_rows<'a>(
    sheet_name: &str,
    rows: impl Iterator<Item = [&'a str; 7]>,
) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet_name)?;
    for (col, header) in ATTENDANCE_COLUMNS.iter().enumerate() {
        worksheet.write_string(0, col as u16, *header)?;
    }
    for (idx, row) in rows.enumerate() {
        for (col, value) in row.iter().enumerate() {
            worksheet.write_string(idx as u32 + 1, col as u16, *value)?;
        }
    }
    workbook.save_to_buffer()
}

/// Render records as an xlsx workbook in the fixed column order
pub fn export_to_table(records: &[AttendanceRecord]) -> Result<Vec<u8>, XlsxError> {
    workbook_with_rows(
        EXPORT_SHEET,
        records.iter().map(|r| {
            [
                r.doc_id.as_str(),
                r.student_id.as_str(),
                r.name.as_str(),
                r.subject_id.as_str(),
                r.subject_name.as_str(),
                r.timestamp.as_str(),
                r.status.as_str(),
            ]
        }),
    )
}

/// Blank workbook holding only the header row
pub fn template_table() -> Result<Vec<u8>, XlsxError> {
    workbook_with_rows(TEMPLATE_SHEET, std::iter::empty())
}

fn cell_text(cell: Option<&Data>) -> String {
    match cell {
        None | Some(Data::Empty) => String::new(),
        Some(Data::String(s)) => s.clone(),
        Some(cell @ (Data::DateTime(_) | Data::DateTimeIso(_))) => match cell.as_datetime() {
            Some(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
            None => cell.to_string(),
        },
        Some(other) => other.to_string(),
    }
}

/// Parse the first worksheet of an uploaded workbook
///
/// The first row must be exactly the attendance header. Missing cells become
/// empty strings and rows with no content at all are skipped.
pub fn parse_table(bytes: &[u8]) -> Result<Vec<ImportRow>, ImportError> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(bytes)).map_err(|e| ImportError::Read(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::Read("workbook has no worksheets".to_string()))?
        .map_err(|e| ImportError::Read(e.to_string()))?;

    // Ranges start at the first used cell; the header must sit at A1
    if range.start() != Some((0, 0)) {
        return Err(ImportError::Format);
    }

    let mut rows = range.rows();
    let header = rows.next().ok_or(ImportError::Format)?;
    let mut header: Vec<String> = header.iter().map(|c| cell_text(Some(c))).collect();
    while header.last().is_some_and(|h| h.is_empty()) {
        header.pop();
    }
    if header != ATTENDANCE_COLUMNS {
        return Err(ImportError::Format);
    }

    let mut parsed = Vec::new();
    for row in rows {
        let cells: Vec<String> = (0..ATTENDANCE_COLUMNS.len())
            .map(|i| cell_text(row.get(i)))
            .collect();
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let mut cells = cells.into_iter();
        let mut next = || cells.next().unwrap_or_default();
        parsed.push(ImportRow {
            doc_id: next().trim().to_string(),
            fields: RecordFields {
                student_id: next(),
                name: next(),
                subject_id: next(),
                subject_name: next(),
                timestamp: next(),
                status: next(),
            },
        });
    }
    debug!("Parsed {} attendance rows", parsed.len());
    Ok(parsed)
}

/// Apply parsed rows: known ids are merged, rows without an id are created
pub async fn import_rows(
    store: &dyn AttendanceStore,
    rows: Vec<ImportRow>,
) -> Result<ImportSummary, ServiceError> {
    let mut summary = ImportSummary::default();
    for row in rows {
        if row.doc_id.is_empty() {
            store.insert(&row.fields).await?;
            summary.inserted += 1;
        } else {
            store.upsert_by_id(&row.doc_id, &row.fields).await?;
            summary.updated += 1;
        }
    }
    Ok(summary)
}
