//! Mapping between records and sheet rows.
//!
//! The remote backend stores one attendee per row, cells in the fixed order
//! given by [`COLUMNS`]. Row 1 holds the header; data starts at
//! [`FIRST_DATA_ROW`]. Other clients edit the sheet by hand, so decoding is
//! lenient about booleans, timestamps and short rows, but strict about the
//! id and the name.

use crate::{error::Result, Error, Record, RecordId, Timestamp};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One sheet row as an ordered list of cell values.
pub type RawRow = Vec<String>;

/// Header cells, in column order.
pub const COLUMNS: [&str; 10] = [
    "id",
    "name",
    "email",
    "title",
    "organization",
    "present",
    "presentAt",
    "badgePrinted",
    "printedAt",
    "registeredAt",
];

/// Sheet row number of the first data row (row 1 is the header).
pub const FIRST_DATA_ROW: u32 = 2;

const ID: usize = 0;
const NAME: usize = 1;
const EMAIL: usize = 2;
const TITLE: usize = 3;
const ORGANIZATION: usize = 4;
const PRESENT: usize = 5;
const PRESENT_AT: usize = 6;
const BADGE_PRINTED: usize = 7;
const PRINTED_AT: usize = 8;
const REGISTERED_AT: usize = 9;

/// A 1-based sheet row number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowAddress(pub u32);

impl RowAddress {
    /// Address of the data row at `index` (0-based) in a `read_all` result.
    pub fn for_index(index: usize) -> Self {
        Self(FIRST_DATA_ROW + index as u32)
    }

    /// 0-based position of this row among the data rows, if it is one.
    pub fn data_index(self) -> Option<usize> {
        self.0
            .checked_sub(FIRST_DATA_ROW)
            .map(|offset| offset as usize)
    }

    /// A1 notation covering every column of this row, e.g. `A7:J7`.
    pub fn a1_range(self) -> String {
        let last = (b'A' + (COLUMNS.len() as u8 - 1)) as char;
        format!("A{row}:{last}{row}", row = self.0)
    }
}

impl fmt::Display for RowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a single sheet row decodes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// A valid record
    Record(Record),
    /// The id cell is blank; the row is not a record
    MissingId,
}

/// Encode a record as a sheet row.
pub fn encode(record: &Record) -> RawRow {
    vec![
        record.id.clone(),
        record.name.clone(),
        record.email.clone().unwrap_or_default(),
        record.title.clone().unwrap_or_default(),
        record.organization.clone().unwrap_or_default(),
        encode_bool(record.present),
        encode_timestamp(record.present_at),
        encode_bool(record.badge_printed),
        encode_timestamp(record.printed_at),
        encode_timestamp(Some(record.registered_at)),
    ]
}

/// Decode a sheet row at `row`.
pub fn decode(row: RowAddress, cells: &[String]) -> Result<RowOutcome> {
    let cell = |index: usize| cells.get(index).map(|c| c.trim()).unwrap_or("");

    let id = cell(ID);
    if id.is_empty() {
        return Ok(RowOutcome::MissingId);
    }

    let name = cell(NAME);
    if name.is_empty() {
        return Err(invalid(row, "name is empty"));
    }

    let registered_at = decode_timestamp(row, "registeredAt", cell(REGISTERED_AT))?.unwrap_or(0);

    let mut record = Record::new(id, name, registered_at);
    record.email = optional_text(cell(EMAIL));
    record.title = optional_text(cell(TITLE));
    record.organization = optional_text(cell(ORGANIZATION));
    record.present = decode_bool(row, "present", cell(PRESENT))?;
    record.present_at = decode_timestamp(row, "presentAt", cell(PRESENT_AT))?;
    record.badge_printed = decode_bool(row, "badgePrinted", cell(BADGE_PRINTED))?;
    record.printed_at = decode_timestamp(row, "printedAt", cell(PRINTED_AT))?;

    Ok(RowOutcome::Record(record))
}

/// Return `cells` with the id column set, padding short rows.
pub fn with_id(cells: &[String], id: &RecordId) -> RawRow {
    let mut row = padded(cells);
    row[ID] = id.clone();
    row
}

/// Pad or truncate a row to exactly [`COLUMNS`] cells.
pub fn padded(cells: &[String]) -> RawRow {
    let mut row: RawRow = cells.iter().take(COLUMNS.len()).cloned().collect();
    row.resize(COLUMNS.len(), String::new());
    row
}

/// The trimmed id cell of a row, if it is not blank.
pub fn row_id(cells: &[String]) -> Option<&str> {
    cells
        .get(ID)
        .map(|c| c.trim())
        .filter(|id| !id.is_empty())
}

/// Address of the first row carrying each id, in sheet order.
///
/// Rows without an id and later rows repeating an id are left out.
pub fn index(rows: &[RawRow]) -> Vec<(RecordId, RowAddress)> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .enumerate()
        .filter_map(|(i, cells)| row_id(cells).map(|id| (id, RowAddress::for_index(i))))
        .filter(|(id, _)| seen.insert(*id))
        .map(|(id, address)| (id.to_string(), address))
        .collect()
}

/// The header row.
pub fn header() -> RawRow {
    COLUMNS.iter().map(|c| c.to_string()).collect()
}

fn encode_bool(value: bool) -> String {
    let cell = if value { "TRUE" } else { "FALSE" };
    cell.to_string()
}

fn encode_timestamp(value: Option<Timestamp>) -> String {
    value
        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64))
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn decode_bool(row: RowAddress, column: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "" | "false" | "0" | "no" => Ok(false),
        "true" | "1" | "yes" | "x" => Ok(true),
        other => Err(invalid(row, format!("{column}: not a boolean: {other:?}"))),
    }
}

fn decode_timestamp(row: RowAddress, column: &str, value: &str) -> Result<Option<Timestamp>> {
    if value.is_empty() {
        return Ok(None);
    }
    if let Ok(ms) = value.parse::<u64>() {
        return Ok(Some(ms));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| Some(dt.timestamp_millis().max(0) as Timestamp))
        .map_err(|_| invalid(row, format!("{column}: not a timestamp: {value:?}")))
}

fn optional_text(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn invalid(row: RowAddress, reason: impl Into<String>) -> Error {
    Error::InvalidRow {
        row,
        reason: reason.into(),
    }
}
