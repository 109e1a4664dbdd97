//! Declarative staging-table schemas
//!
//! A [`TableSchema`] is the versioned row contract of one job: an ordered
//! list of named columns, each with a semantic type and the raw field (or
//! derivation) it is filled from. Adding a column is compatible with the
//! staging table; removing or renaming one is a breaking change.

use opsfeed_common::{ident, FeedError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a timestamp column is represented at the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// RFC 3339, `...Z`, fractional seconds, naive date-time or bare date
    Iso8601,
    /// Seconds since the Unix epoch, as a number or numeric string
    EpochSeconds,
}

/// Semantic type of a staging column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    /// UTC at the source, reporting-timezone wall clock in the row; null when unparsable
    Timestamp { format: TimestampFormat },
    /// Calendar date parsed with a chrono pattern; null when unparsable
    Date { pattern: String },
    /// 1 for truthy spellings, 0 for everything else
    Boolean,
    /// 0 when missing
    Integer,
    /// 0.0 when missing, optionally rounded
    Float { decimals: Option<u32> },
    /// Trimmed, empty string when missing
    Text,
    /// Trimmed and lowercased, empty string when missing
    LowerText,
}

/// Composite value computed from one or more raw fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Derivation {
    /// `end - start` in seconds when both timestamps parse, else null
    SecondsBetween {
        start: String,
        end: String,
        format: TimestampFormat,
    },
    /// Text after the last `marker` in the field, e.g. the id in an ARN; null without the marker
    TrailingSegment { path: String, marker: String },
    /// The run's start time in the reporting timezone
    IngestedAt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSource {
    Field(String),
    Derived(Derivation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub source: ColumnSource,
    pub kind: ColumnType,
    /// A missing required field fails the record instead of defaulting
    pub required: bool,
}

impl ColumnSpec {
    pub fn field(name: impl Into<String>, path: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            source: ColumnSource::Field(path.into()),
            kind,
            required: false,
        }
    }

    pub fn text(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::field(name, path, ColumnType::Text)
    }

    pub fn timestamp(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::field(
            name,
            path,
            ColumnType::Timestamp {
                format: TimestampFormat::Iso8601,
            },
        )
    }

    pub fn epoch_timestamp(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::field(
            name,
            path,
            ColumnType::Timestamp {
                format: TimestampFormat::EpochSeconds,
            },
        )
    }

    pub fn date(name: impl Into<String>, path: impl Into<String>, pattern: &str) -> Self {
        Self::field(
            name,
            path,
            ColumnType::Date {
                pattern: pattern.to_string(),
            },
        )
    }

    pub fn boolean(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::field(name, path, ColumnType::Boolean)
    }

    pub fn integer(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::field(name, path, ColumnType::Integer)
    }

    pub fn float(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::field(name, path, ColumnType::Float { decimals: None })
    }

    pub fn derived(name: impl Into<String>, derivation: Derivation) -> Self {
        let kind = match derivation {
            Derivation::SecondsBetween { .. } => ColumnType::Float { decimals: None },
            Derivation::TrailingSegment { .. } => ColumnType::Text,
            Derivation::IngestedAt => ColumnType::Timestamp {
                format: TimestampFormat::Iso8601,
            },
        };
        Self {
            name: name.into(),
            source: ColumnSource::Derived(derivation),
            kind,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Ordered column contract for one staging (or dimension) table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    table: String,
    promote: Option<String>,
    columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            promote: None,
            columns: Vec::new(),
        }
    }

    /// Stored procedure that merges this staging table into its final table
    pub fn promoted_by(mut self, procedure: impl Into<String>) -> Self {
        self.promote = Some(procedure.into());
        self
    }

    pub fn column(mut self, spec: ColumnSpec) -> Self {
        self.columns.push(spec);
        self
    }

    pub fn columns_from<I: IntoIterator<Item = ColumnSpec>>(mut self, specs: I) -> Self {
        self.columns.extend(specs);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn promote_procedure(&self) -> Option<&str> {
        self.promote.as_deref()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Check every identifier and reject duplicate column names
    pub fn validate(&self) -> opsfeed_common::Result<()> {
        ident::validate_identifier(&self.table)?;
        if let Some(procedure) = &self.promote {
            ident::validate_identifier(procedure)?;
        }
        if self.columns.is_empty() {
            return Err(FeedError::config(format!("schema {} has no columns", self.table)));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            ident::validate_identifier(&column.name)?;
            if !seen.insert(column.name.as_str()) {
                return Err(FeedError::config(format!(
                    "schema {} declares column {} twice",
                    self.table, column.name
                )));
            }
        }
        Ok(())
    }
}

/// Closed-world column classification
///
/// Columns named in one of the typed sets get that type; every other column
/// is text.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    timestamps: HashSet<String>,
    booleans: HashSet<String>,
    integers: HashSet<String>,
    floats: HashSet<String>,
}

impl Classification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamps(mut self, names: &[&str]) -> Self {
        self.timestamps.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn booleans(mut self, names: &[&str]) -> Self {
        self.booleans.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn integers(mut self, names: &[&str]) -> Self {
        self.integers.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn floats(mut self, names: &[&str]) -> Self {
        self.floats.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn classify(&self, column: &str) -> ColumnType {
        if self.timestamps.contains(column) {
            ColumnType::Timestamp {
                format: TimestampFormat::Iso8601,
            }
        } else if self.booleans.contains(column) {
            ColumnType::Boolean
        } else if self.integers.contains(column) {
            ColumnType::Integer
        } else if self.floats.contains(column) {
            ColumnType::Float { decimals: None }
        } else {
            ColumnType::Text
        }
    }

    /// Column specs for the given names, each read from the same-named field
    pub fn specs<'a, I>(&self, names: I) -> Vec<ColumnSpec>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .map(|name| ColumnSpec::field(name, name, self.classify(name)))
            .collect()
    }
}
