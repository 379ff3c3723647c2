//! Rows extracted from delivery manifests, their post-processing and output.
//!
//! Rows are keyed by a fixed set of columns. Cells keep the text the parser
//! produced; normalization (ISO dates, money to 2dp, integer item counts)
//! happens on output so the raw values survive until then.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;

/// Output columns, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Type,
    Status,
    ConsignmentNumber,
    Postcode,
    Service,
    Date,
    Size,
    Items,
    Pay,
    Enhancement,
    Account,
    CollectedFrom,
    CollectionPostcode,
    Location,
    DriverName,
    DriverId,
}

impl Column {
    pub const ALL: [Column; 16] = [
        Column::Type,
        Column::Status,
        Column::ConsignmentNumber,
        Column::Postcode,
        Column::Service,
        Column::Date,
        Column::Size,
        Column::Items,
        Column::Pay,
        Column::Enhancement,
        Column::Account,
        Column::CollectedFrom,
        Column::CollectionPostcode,
        Column::Location,
        Column::DriverName,
        Column::DriverId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Type => "Type",
            Column::Status => "Status",
            Column::ConsignmentNumber => "Consignment Number",
            Column::Postcode => "Postcode",
            Column::Service => "Service",
            Column::Date => "Date",
            Column::Size => "Size",
            Column::Items => "Items",
            Column::Pay => "Pay",
            Column::Enhancement => "Enhancement",
            Column::Account => "Account",
            Column::CollectedFrom => "Collected From",
            Column::CollectionPostcode => "Collection Postcode",
            Column::Location => "Location",
            Column::DriverName => "Driver Name",
            Column::DriverId => "Driver ID",
        }
    }

    /// Match a header cell to a column, ignoring case and surrounding space.
    pub fn from_header(cell: &str) -> Option<Column> {
        let cell = cell.trim();
        Column::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(cell))
    }
}

/// One extracted row. Missing cells read as empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: HashMap<Column, String>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: Column, value: impl Into<String>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: Column, value: impl Into<String>) {
        self.cells.insert(column, value.into());
    }

    /// Trimmed cell text, empty if absent.
    pub fn get(&self, column: Column) -> &str {
        self.cells.get(&column).map(|s| s.trim()).unwrap_or("")
    }

    pub fn has(&self, column: Column) -> bool {
        !self.get(column).is_empty()
    }

    /// Account, Collected From and Pay are all filled in.
    pub fn looks_like_collection(&self) -> bool {
        self.has(Column::Account) && self.has(Column::CollectedFrom) && self.has(Column::Pay)
    }

    /// Cells in column order, normalized for output.
    pub fn normalized(&self) -> Vec<String> {
        Column::ALL
            .iter()
            .map(|&column| {
                let raw = self.get(column);
                match column {
                    Column::Items => parse_int(raw)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| raw.to_string()),
                    Column::Pay | Column::Enhancement => parse_money(raw)
                        .map(|v| format!("{v:.2}"))
                        .unwrap_or_else(|| raw.to_string()),
                    Column::Date if !raw.is_empty() => to_iso_date(raw).unwrap_or_default(),
                    _ => raw.to_string(),
                }
            })
            .collect()
    }
}

static MONEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("money regex is valid"));

const DATE_FORMATS: [&str; 4] = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y"];

/// Four-digit years only. chrono's `%Y` also takes `24`, which would read
/// `01/03/24` as year 24.
static DATE_SHAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d{1,2}[/.-]\d{1,2}[/.-]\d{4}|\d{4}-\d{1,2}-\d{1,2})$")
        .expect("date regex is valid")
});

/// `YYYY-MM-DD`, or `None` when the date cannot be read with confidence.
pub fn to_iso_date(value: &str) -> Option<String> {
    let value = value.trim();
    if !DATE_SHAPE_RE.is_match(value) {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .map(|d| d.format("%Y-%m-%d").to_string())
}

/// Integer count, accepting values like `3` or `3.0`.
pub fn parse_int(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
}

/// Amount from `£2.11`, `Stop Rate £2.11` or `2.11`.
pub fn parse_money(value: &str) -> Option<f64> {
    let value = value.trim();
    let value = value.split_once('£').map(|(_, rest)| rest).unwrap_or(value);
    MONEY_RE
        .find(value)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Most frequent non-empty date cell. Ties go to the date seen first.
pub fn most_common_date(rows: &[Row]) -> Option<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        let date = row.get(Column::Date);
        if !date.is_empty() {
            counts.entry(date).or_insert((0, index)).0 += 1;
        }
    }

    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(date, _)| date.to_string())
}

/// Apply the collection rules in place.
///
/// - rows that look like collections get `Type=Collection`, a numeric Pay
///   (0.00 when unreadable) and Items defaulted to 1;
/// - undated collections take the date of the next dated row with the same
///   postcode, falling back to `default_date`.
pub fn fix_collections(rows: &mut [Row], default_date: Option<&str>) {
    let mut pending: HashMap<String, Vec<usize>> = HashMap::new();

    for index in 0..rows.len() {
        let row = &mut rows[index];
        if row.looks_like_collection() {
            row.set(Column::Type, "Collection");

            let pay = parse_money(row.get(Column::Pay)).unwrap_or(0.0);
            row.set(Column::Pay, format!("{pay:.2}"));

            if parse_int(row.get(Column::Items)).is_none() {
                row.set(Column::Items, "1");
            }

            if !row.has(Column::Date) && row.has(Column::Postcode) {
                pending
                    .entry(row.get(Column::Postcode).to_string())
                    .or_default()
                    .push(index);
            }
        }

        let row = &rows[index];
        if row.has(Column::Date)
            && let Some(waiting) = pending.remove(row.get(Column::Postcode))
        {
            let date = row.get(Column::Date).to_string();
            for earlier in waiting {
                rows[earlier].set(Column::Date, date.clone());
            }
        }
    }

    if let Some(date) = default_date {
        for earlier in pending.into_values().flatten() {
            rows[earlier].set(Column::Date, date);
        }
    }
}

/// Build rows from extracted page text.
///
/// Cells are separated by tabs or runs of two or more spaces. A line with at
/// least three cells naming known columns starts a table; following lines with
/// the same number of cells are its rows. Anything else is skipped.
pub fn rows_from_text(text: &str) -> Vec<Row> {
    let mut rows = Vec::new();
    let mut header: Option<Vec<Option<Column>>> = None;

    for line in text.lines() {
        let cells = split_cells(line);
        if cells.is_empty() {
            continue;
        }

        let mapped: Vec<Option<Column>> = cells.iter().map(|c| Column::from_header(c)).collect();
        if mapped.iter().filter(|c| c.is_some()).count() >= 3 {
            header = Some(mapped);
            continue;
        }

        let Some(columns) = header.as_ref() else {
            continue;
        };
        if columns.len() != cells.len() {
            continue;
        }

        let mut row = Row::new();
        for (column, cell) in columns.iter().zip(cells) {
            if let Some(column) = column {
                row.set(*column, cell);
            }
        }
        rows.push(row);
    }

    rows
}

static CELL_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\t+|\s{2,}").expect("cell separator regex is valid"));

fn split_cells(line: &str) -> Vec<&str> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    CELL_SEPARATOR.split(line).map(str::trim).collect()
}

/// Rows produced by one extraction, ready for output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedTable {
    rows: Vec<Row>,
}

/// JSON shape of a table: column names plus rows as arrays in column order.
#[derive(Debug, Serialize)]
pub struct TablePayload {
    pub columns: Vec<&'static str>,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
}

impl ExtractedTable {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Rows from page text with the collection rules applied.
    pub fn from_text(text: &str) -> Self {
        let mut rows = rows_from_text(text);
        let fallback = most_common_date(&rows);
        fix_collections(&mut rows, fallback.as_deref());
        Self::new(rows)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_payload(&self) -> TablePayload {
        TablePayload {
            columns: Column::ALL.iter().map(Column::as_str).collect(),
            rows: self.rows.iter().map(Row::normalized).collect(),
            row_count: self.rows.len(),
        }
    }

    /// CSV with a header row, `\n` line endings.
    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        writer.write_record(Column::ALL.iter().map(Column::as_str))?;
        for row in &self.rows {
            writer.write_record(row.normalized())?;
        }

        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}
