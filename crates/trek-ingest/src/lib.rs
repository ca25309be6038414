//! Normalizes job-listing CSV exports into [`ListingRecord`]s.
//!
//! Rows that cannot become a valid record are rejected individually and
//! reported on the batch; only unreadable files and missing required columns
//! fail the whole export.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use trek_core::{JobCategory, ListingRecord};

pub const CRATE_NAME: &str = "trek-ingest";

/// Export header → internal field name. Matching is case-sensitive.
pub const COLUMN_MAP: &[(&str, &str)] = &[
    ("Position Title", "position_title"),
    ("Date", "date"),
    ("Apply", "apply_link"),
    ("Work Model", "work_model"),
    ("Location", "location"),
    ("Company", "company"),
    ("Company Size", "company_size"),
    ("Company Industry", "company_industry"),
    ("Salary", "salary"),
    ("Qualifications", "qualifications"),
    ("H1b Sponsored", "h1b_sponsored"),
    ("Is New Grad", "is_new_grad"),
    ("Category", "csv_category"),
];

/// Headers an export must carry to be processed at all.
pub const REQUIRED_COLUMNS: &[&str] = &["Position Title", "Date", "Company"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%m-%d-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%b %d %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%d-%b-%Y",
];

const WEEKDAYS: &[&str] = &[
    "mon", "monday", "tue", "tues", "tuesday", "wed", "wednesday", "thu", "thur", "thurs",
    "thursday", "fri", "friday", "sat", "saturday", "sun", "sunday",
];

const TIMEZONE_SUFFIXES: &[&str] = &[
    "utc", "gmt", "z", "est", "edt", "cst", "cdt", "mst", "mdt", "pst", "pdt",
];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading CSV header: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV is missing required column {0:?}")]
    MissingColumn(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    MissingField(&'static str),
    InvalidDate(String),
    Malformed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingField(field) => write!(f, "missing required field {field}"),
            RejectReason::InvalidDate(raw) => write!(f, "unparseable posting date {raw:?}"),
            RejectReason::Malformed(err) => write!(f, "malformed row: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    /// 1-based data row (the header is row 0).
    pub row: usize,
    pub reason: RejectReason,
    pub position_title: Option<String>,
    pub company: Option<String>,
}

/// How the batch category was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CategoryResolution {
    /// The export has no Category column.
    CallerSupplied,
    /// Every non-empty Category value agrees on a recognized label.
    ColumnOverride(JobCategory),
    /// Category values disagree; the caller's category is kept.
    Conflicting(Vec<String>),
    /// The column is empty or holds a single unknown label; the caller's
    /// category is kept.
    Unrecognized(Option<String>),
}

/// Picks the category stamped on every record of an export.
///
/// `column_values` is `None` when the export has no Category column, otherwise
/// the distinct non-empty values in first-seen order.
pub fn resolve_category(
    caller: JobCategory,
    column_values: Option<&[String]>,
) -> (JobCategory, CategoryResolution, Option<String>) {
    let Some(values) = column_values else {
        return (caller, CategoryResolution::CallerSupplied, None);
    };

    match values {
        [] => (
            caller,
            CategoryResolution::Unrecognized(None),
            Some(format!("CSV Category column is empty, using specified category {caller}")),
        ),
        [single] => match single.parse::<JobCategory>() {
            Ok(column) => {
                let warning = (column != caller).then(|| {
                    format!("CSV category ({column}) differs from specified category ({caller}), using CSV category")
                });
                (column, CategoryResolution::ColumnOverride(column), warning)
            }
            Err(_) => (
                caller,
                CategoryResolution::Unrecognized(Some(single.clone())),
                Some(format!(
                    "CSV category {single:?} not recognized, using specified category {caller}"
                )),
            ),
        },
        many => (
            caller,
            CategoryResolution::Conflicting(many.to_vec()),
            Some(format!(
                "CSV contains multiple categories {many:?}, enforcing specified category {caller}"
            )),
        ),
    }
}

/// `"yes"` in any case is true; everything else, including a missing cell,
/// is false.
pub fn parse_yes_flag(raw: Option<&str>) -> bool {
    raw.is_some_and(|v| v.trim().eq_ignore_ascii_case("yes"))
}

fn parse_date_strict(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Best-effort cleanup of a date cell: strips quotes, weekday prefixes,
/// ordinal suffixes and trailing timezone names, and collapses whitespace.
pub fn repair_date_text(raw: &str) -> String {
    let unquoted = raw.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
    let mut tokens: Vec<String> = unquoted
        .split_whitespace()
        .map(|token| strip_ordinal(token.trim_end_matches('.')))
        .collect();

    if let Some(first) = tokens.first() {
        if WEEKDAYS.contains(&first.trim_end_matches(',').to_ascii_lowercase().as_str()) {
            tokens.remove(0);
        }
    }
    while let Some(last) = tokens.last() {
        if TIMEZONE_SUFFIXES.contains(&last.to_ascii_lowercase().as_str()) {
            tokens.pop();
        } else {
            break;
        }
    }

    tokens.join(" ").trim_end_matches(',').to_string()
}

fn strip_ordinal(token: &str) -> String {
    let (body, comma) = match token.strip_suffix(',') {
        Some(body) => (body, ","),
        None => (token, ""),
    };
    let lower = body.to_ascii_lowercase();
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(digits) = lower.strip_suffix(suffix) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return format!("{digits}{comma}");
            }
        }
    }
    token.to_string()
}

/// Parses a posting date, falling back to a repair pass. The flag reports
/// whether the repair pass was needed.
pub fn parse_posting_date(raw: &str) -> Option<(NaiveDateTime, bool)> {
    let trimmed = raw.trim();
    if let Some(dt) = parse_date_strict(trimmed) {
        return Some((dt, false));
    }
    parse_date_strict(&repair_date_text(trimmed)).map(|dt| (dt, true))
}

/// One export's rows after normalization.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedBatch {
    pub source_name: String,
    pub category: JobCategory,
    pub resolution: CategoryResolution,
    pub records: Vec<ListingRecord>,
    pub rejected: Vec<RejectedRow>,
    pub repaired_dates: usize,
    pub warnings: Vec<String>,
}

impl NormalizedBatch {
    /// Every data row read from the export, accepted or not.
    pub fn total_rows(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}

struct ColumnIndex(HashMap<&'static str, usize>);

impl ColumnIndex {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut positions = HashMap::new();
        for (pos, header) in headers.iter().enumerate() {
            let header = header.trim_start_matches('\u{feff}').trim();
            if let Some((_, field)) = COLUMN_MAP.iter().find(|(external, _)| *external == header) {
                positions.entry(*field).or_insert(pos);
            }
        }
        Self(positions)
    }

    fn has(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    fn cell<'r>(&self, row: &'r StringRecord, field: &str) -> Option<&'r str> {
        self.0
            .get(field)
            .and_then(|pos| row.get(*pos))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn owned(&self, row: &StringRecord, field: &str) -> Option<String> {
        self.cell(row, field).map(ToString::to_string)
    }
}

fn internal_name(external: &str) -> &'static str {
    COLUMN_MAP
        .iter()
        .find(|(header, _)| *header == external)
        .map(|(_, field)| *field)
        .unwrap_or("unknown")
}

/// Reads an export file. The file name becomes the batch's `source_name`.
pub fn normalize_csv(path: impl AsRef<Path>, category: JobCategory) -> Result<NormalizedBatch, IngestError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    normalize_reader(file, source_name, category)
}

pub fn normalize_reader<R: Read>(
    reader: R,
    source_name: impl Into<String>,
    category: JobCategory,
) -> Result<NormalizedBatch, IngestError> {
    let source_name = source_name.into();
    let span = info_span!("normalize", source = %source_name, requested_category = %category);
    let _guard = span.enter();

    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers()?.clone();
    let columns = ColumnIndex::from_headers(&headers);
    for required in REQUIRED_COLUMNS {
        if !columns.has(internal_name(required)) {
            return Err(IngestError::MissingColumn(required));
        }
    }

    let mut rows: Vec<(usize, Result<StringRecord, String>)> = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        rows.push((idx + 1, result.map_err(|e| e.to_string())));
    }
    info!(rows = rows.len(), columns = headers.len(), "read listings export");

    let column_values = columns.has("csv_category").then(|| {
        let mut distinct: Vec<String> = Vec::new();
        for (_, row) in &rows {
            if let Ok(row) = row {
                if let Some(value) = columns.cell(row, "csv_category") {
                    if !distinct.iter().any(|v| v == value) {
                        distinct.push(value.to_string());
                    }
                }
            }
        }
        distinct
    });
    let (category, resolution, warning) = resolve_category(category, column_values.as_deref());
    let mut warnings = Vec::new();
    if let Some(message) = warning {
        warn!("{message}");
        warnings.push(message);
    }
    info!(%category, ?resolution, "resolved batch category");

    let mut records = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();
    let mut repaired_dates = 0usize;

    for (row_no, row) in rows {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                warn!(row = row_no, error = %err, "skipping malformed CSV row");
                rejected.push(RejectedRow {
                    row: row_no,
                    reason: RejectReason::Malformed(err),
                    position_title: None,
                    company: None,
                });
                continue;
            }
        };

        let position_title = columns.owned(&row, "position_title");
        let company = columns.owned(&row, "company");
        let raw_date = columns.cell(&row, "date");
        let apply_link = columns.owned(&row, "apply_link");

        let reject = |reason: RejectReason| RejectedRow {
            row: row_no,
            reason,
            position_title: position_title.clone(),
            company: company.clone(),
        };

        let missing = [
            ("position_title", position_title.is_none()),
            ("company", company.is_none()),
            ("posting_date", raw_date.is_none()),
            ("apply_link", apply_link.is_none()),
        ]
        .into_iter()
        .find_map(|(field, absent)| absent.then_some(field));
        if let Some(field) = missing {
            let rejection = reject(RejectReason::MissingField(field));
            warn!(
                row = row_no,
                title = ?rejection.position_title,
                company = ?rejection.company,
                "skipping row with missing {field}"
            );
            rejected.push(rejection);
            continue;
        }

        let raw_date = raw_date.unwrap_or_default();
        let Some((posting_date, repaired)) = parse_posting_date(raw_date) else {
            warn!(row = row_no, date = raw_date, "removing row with invalid date");
            rejected.push(reject(RejectReason::InvalidDate(raw_date.to_string())));
            continue;
        };
        if repaired {
            debug!(row = row_no, date = raw_date, "repaired posting date");
            repaired_dates += 1;
        }

        records.push(ListingRecord {
            source_row: row_no,
            position_title: position_title.unwrap_or_default(),
            posting_date,
            apply_link: apply_link.unwrap_or_default(),
            work_model: columns.owned(&row, "work_model"),
            location: columns.owned(&row, "location"),
            company: company.unwrap_or_default(),
            company_size: columns.owned(&row, "company_size"),
            company_industry: columns.owned(&row, "company_industry"),
            salary: columns.owned(&row, "salary"),
            qualifications: columns.owned(&row, "qualifications"),
            h1b_sponsored: parse_yes_flag(columns.cell(&row, "h1b_sponsored")),
            is_new_grad: parse_yes_flag(columns.cell(&row, "is_new_grad")),
            job_category: category,
        });
    }

    info!(
        accepted = records.len(),
        rejected = rejected.len(),
        repaired_dates,
        "normalized listings export"
    );

    Ok(NormalizedBatch {
        source_name,
        category,
        resolution,
        records,
        rejected,
        repaired_dates,
        warnings,
    })
}
