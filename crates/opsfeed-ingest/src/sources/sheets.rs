//! Spreadsheet values source
//!
//! Reads a whole range with `GET /v4/spreadsheets/{id}/values/{range}`. The
//! first row is the header; every following row becomes one record keyed by
//! the header cells.

use serde_json::Value;
use tracing::{debug, info};

use super::http::GatewayClient;
use crate::framework::{RawRecord, RetryPolicy, SourceError};

pub struct SheetsSource {
    client: GatewayClient,
    sheet_id: String,
    retry: RetryPolicy,
}

impl SheetsSource {
    pub fn new(client: GatewayClient, sheet_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            sheet_id: sheet_id.into(),
            retry,
        }
    }

    pub async fn records(&self, range: &str) -> Result<Vec<RawRecord>, SourceError> {
        let path = format!("v4/spreadsheets/{}/values/{}", self.sheet_id, range);
        let body = self
            .retry
            .run("sheet values", || self.client.send_json(self.client.get(&path)))
            .await?
            .ok_or_else(|| SourceError::Permanent(format!("range {range} not found")))?;

        let rows = match body.get("values") {
            Some(Value::Array(rows)) => rows
                .iter()
                .map(|row| row.as_array().cloned().unwrap_or_default())
                .collect::<Vec<_>>(),
            None | Some(Value::Null) => Vec::new(),
            Some(_) => return Err(SourceError::Permanent("values is not an array".to_string())),
        };

        let records = rows_to_records(&rows);
        info!(range, rows = records.len(), "Read sheet range");
        Ok(records)
    }
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Header row plus data rows into records; short rows are padded with ""
pub fn rows_to_records(rows: &[Vec<Value>]) -> Vec<RawRecord> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };
    let header: Vec<String> = header.iter().map(|h| cell_text(h).trim().to_string()).collect();

    data.iter()
        .filter(|row| row.iter().any(|cell| !cell_text(cell).trim().is_empty()))
        .map(|row| {
            header
                .iter()
                .enumerate()
                .filter(|(_, name)| !name.is_empty())
                .map(|(i, name)| {
                    let value = row.get(i).map(cell_text).unwrap_or_default();
                    (name.clone(), Value::String(value))
                })
                .collect::<RawRecord>()
        })
        .inspect(|record| debug!(fields = record.len(), "Sheet row"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Vec<Value>> {
        value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|r| r.as_array().cloned().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_rows_keyed_by_header() {
        let records = rows_to_records(&rows(json!([
            ["Email", "Employee name", "Hiring date"],
            ["a@x.com", "Ana", "31/01/2024"],
            ["b@x.com", "Ben"],
            ["", "", ""]
        ])));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get_str("Employee name"), Some("Ana"));
        assert_eq!(records[1].get("Hiring date"), Some(&json!("")));
    }

    #[test]
    fn test_header_only_or_empty() {
        assert!(rows_to_records(&rows(json!([["Email"]]))).is_empty());
        assert!(rows_to_records(&[]).is_empty());
    }

    #[test]
    fn test_numeric_cells_rendered() {
        let records = rows_to_records(&rows(json!([["week number", "Goal Productivity"], [12, 0.85]])));
        assert_eq!(records[0].get_str("week number"), Some("12"));
        assert_eq!(records[0].get_str("Goal Productivity"), Some("0.85"));
    }
}
