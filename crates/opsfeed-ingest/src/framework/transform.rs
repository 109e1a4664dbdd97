//! Record transformer
//!
//! Maps one [`RawRecord`] onto a [`TableSchema`] producing a [`StagingRow`].
//! The transformer is pure: no I/O, the clock comes in through
//! [`TransformContext`].
//!
//! Defaults differ by type on purpose. Numeric columns default to zero so
//! counts and durations aggregate cleanly, text defaults to the empty string,
//! timestamps and dates default to null, booleans default to 0.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::schema::{ColumnSource, ColumnSpec, ColumnType, Derivation, TableSchema, TimestampFormat};
use super::types::{Cell, RawRecord, StagingRow};

/// Per-record transformation failure; the record is dropped, the batch continues
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("required column {column} is missing")]
    MissingRequired { column: String },

    #[error("column {column}: {value:?} is not a number")]
    InvalidNumber { column: String, value: String },

    #[error("column {column}: cannot coerce a nested value")]
    NestedValue { column: String },
}

/// Inputs shared by every record of one run
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub timezone: Tz,
    pub ingested_at: DateTime<Utc>,
}

impl TransformContext {
    pub fn new(timezone: Tz, ingested_at: DateTime<Utc>) -> Self {
        Self {
            timezone,
            ingested_at,
        }
    }
}

/// A record that failed transformation, by position in the input batch
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedRecord {
    pub index: usize,
    pub error: TransformError,
}

/// Result of transforming a batch: good rows plus what was dropped
#[derive(Debug, Clone, Default)]
pub struct TransformOutcome {
    pub rows: Vec<StagingRow>,
    pub dropped: Vec<DroppedRecord>,
}

/// Generic schema-driven transformer
pub struct Transformer<'a> {
    schema: &'a TableSchema,
    ctx: &'a TransformContext,
}

impl<'a> Transformer<'a> {
    pub fn new(schema: &'a TableSchema, ctx: &'a TransformContext) -> Self {
        Self { schema, ctx }
    }

    pub fn transform(&self, record: &RawRecord) -> Result<StagingRow, TransformError> {
        let mut row = StagingRow::with_capacity(self.schema.columns().len());
        for column in self.schema.columns() {
            row.push(self.column_cell(column, record)?);
        }
        Ok(row)
    }

    pub fn transform_batch<'r, I>(&self, records: I) -> TransformOutcome
    where
        I: IntoIterator<Item = &'r RawRecord>,
    {
        let mut outcome = TransformOutcome::default();
        for (index, record) in records.into_iter().enumerate() {
            match self.transform(record) {
                Ok(row) => outcome.rows.push(row),
                Err(error) => {
                    warn!(
                        table = %self.schema.table(),
                        index,
                        error = %error,
                        "Dropping record that failed transformation"
                    );
                    outcome.dropped.push(DroppedRecord { index, error });
                },
            }
        }
        outcome
    }

    fn column_cell(&self, column: &ColumnSpec, record: &RawRecord) -> Result<Cell, TransformError> {
        match &column.source {
            ColumnSource::Field(path) => {
                let value = record.get(path).filter(|v| !is_blank(v));
                if column.required && value.is_none() {
                    return Err(TransformError::MissingRequired {
                        column: column.name.clone(),
                    });
                }
                coerce(&column.name, &column.kind, value, self.ctx.timezone)
            },
            ColumnSource::Derived(derivation) => {
                let cell = derive(derivation, record, self.ctx);
                if column.required && cell.is_null() {
                    return Err(TransformError::MissingRequired {
                        column: column.name.clone(),
                    });
                }
                Ok(cell)
            },
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Coerce one raw value according to its column type
pub fn coerce(
    column: &str,
    kind: &ColumnType,
    value: Option<&Value>,
    tz: Tz,
) -> Result<Cell, TransformError> {
    let cell = match kind {
        ColumnType::Timestamp { format } => coerce_timestamp(value, *format, tz),
        ColumnType::Date { pattern } => coerce_date(value, pattern),
        ColumnType::Boolean => coerce_boolean(value),
        ColumnType::Integer => coerce_integer(column, value)?,
        ColumnType::Float { decimals } => coerce_float(column, value, *decimals)?,
        ColumnType::Text => coerce_text(column, value, false)?,
        ColumnType::LowerText => coerce_text(column, value, true)?,
    };
    Ok(cell)
}

/// A parsed source instant
#[derive(Debug, Clone, Copy, PartialEq)]
enum Instant {
    Utc(DateTime<Utc>),
    /// A bare calendar date, taken as local midnight and never shifted
    LocalDate(NaiveDate),
}

fn parse_instant(value: &Value, format: TimestampFormat) -> Option<Instant> {
    match value {
        Value::Number(n) => epoch_to_utc(n.as_f64()?).map(Instant::Utc),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            match format {
                TimestampFormat::EpochSeconds => {
                    epoch_to_utc(s.parse::<f64>().ok()?).map(Instant::Utc)
                },
                TimestampFormat::Iso8601 => parse_iso8601(s),
            }
        },
        _ => None,
    }
}

fn epoch_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

fn parse_iso8601(s: &str) -> Option<Instant> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Instant::Utc(dt.with_timezone(&Utc)));
    }
    // Offsets without a colon, e.g. 2024-01-05T14:03:22.000+0000
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(Instant::Utc(dt.with_timezone(&Utc)));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, pattern) {
            return Some(Instant::Utc(naive.and_utc()));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(Instant::LocalDate)
}

fn to_utc(instant: Instant, tz: Tz) -> Option<DateTime<Utc>> {
    match instant {
        Instant::Utc(dt) => Some(dt),
        Instant::LocalDate(date) => tz
            .from_local_datetime(&date.and_time(chrono::NaiveTime::MIN))
            .earliest()
            .map(|local| local.with_timezone(&Utc)),
    }
}

fn to_reporting_time(instant: Instant, tz: Tz) -> NaiveDateTime {
    match instant {
        Instant::Utc(dt) => dt.with_timezone(&tz).naive_local(),
        Instant::LocalDate(date) => date.and_time(chrono::NaiveTime::MIN),
    }
}

/// Missing or unparsable input yields null, never an error
pub fn coerce_timestamp(value: Option<&Value>, format: TimestampFormat, tz: Tz) -> Cell {
    value
        .and_then(|v| parse_instant(v, format))
        .map(|instant| Cell::Timestamp(to_reporting_time(instant, tz)))
        .unwrap_or(Cell::Null)
}

pub fn coerce_date(value: Option<&Value>, pattern: &str) -> Cell {
    value
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), pattern).ok())
        .map(Cell::Date)
        .unwrap_or(Cell::Null)
}

/// Absence means false: only the truthy spellings map to 1
pub fn coerce_boolean(value: Option<&Value>) -> Cell {
    let truthy = match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "t" | "1")
        },
        _ => false,
    };
    Cell::Int(i64::from(truthy))
}

fn numeric(column: &str, value: Option<&Value>) -> Result<Option<f64>, TransformError> {
    let invalid = |raw: String| TransformError::InvalidNumber {
        column: column.to_string(),
        value: raw,
    };

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(n.to_string())),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Some)
                .ok_or_else(|| invalid(s.to_string()))
        },
        Some(_) => Err(TransformError::NestedValue {
            column: column.to_string(),
        }),
    }
}

pub fn coerce_integer(column: &str, value: Option<&Value>) -> Result<Cell, TransformError> {
    if let Some(i) = value.and_then(Value::as_i64) {
        return Ok(Cell::Int(i));
    }
    Ok(Cell::Int(numeric(column, value)?.map(|f| f.trunc() as i64).unwrap_or(0)))
}

pub fn coerce_float(
    column: &str,
    value: Option<&Value>,
    decimals: Option<u32>,
) -> Result<Cell, TransformError> {
    let raw = numeric(column, value)?.unwrap_or(0.0);
    let rounded = match decimals {
        Some(places) => {
            let factor = 10f64.powi(places as i32);
            (raw * factor).round() / factor
        },
        None => raw,
    };
    Ok(Cell::Float(rounded))
}

pub fn coerce_text(column: &str, value: Option<&Value>, lowercase: bool) -> Result<Cell, TransformError> {
    let text = match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => {
            return Err(TransformError::NestedValue {
                column: column.to_string(),
            })
        },
    };
    Ok(Cell::Text(if lowercase { text.to_lowercase() } else { text }))
}

fn derive(derivation: &Derivation, record: &RawRecord, ctx: &TransformContext) -> Cell {
    match derivation {
        Derivation::SecondsBetween { start, end, format } => {
            let instant = |path: &str| {
                record
                    .get(path)
                    .and_then(|v| parse_instant(v, *format))
                    .and_then(|i| to_utc(i, ctx.timezone))
            };
            match (instant(start), instant(end)) {
                (Some(s), Some(e)) => Cell::Float((e - s).num_milliseconds() as f64 / 1000.0),
                _ => Cell::Null,
            }
        },
        Derivation::TrailingSegment { path, marker } => record
            .get_str(path)
            .and_then(|s| s.rsplit_once(marker.as_str()))
            .map(|(_, segment)| segment)
            .filter(|segment| !segment.is_empty())
            .map(|segment| Cell::Text(segment.to_string()))
            .unwrap_or(Cell::Null),
        Derivation::IngestedAt => {
            Cell::Timestamp(ctx.ingested_at.with_timezone(&ctx.timezone).naive_local())
        },
    }
}
