//! Row encoding
//!
//! This module flattens streams into the row format consumed by the
//! dashboards: one JSON object per record, the canonical timestamp under the
//! stream's time column as RFC 3339 in the reference offset, and unmatched
//! cells as `null`.

use serde_json::Map;

use crate::error::FusionError;
use crate::loader::JsonRow;
use crate::types::{Record, Stream};

/// Output layout for encoded rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// One compact JSON object per line
    Ndjson,
    /// Compact JSON array
    Json,
    /// Indented JSON array
    JsonPretty,
}

/// Encoder from streams to flat JSON rows
pub struct RowEncoder;

impl RowEncoder {
    /// Encode one record; the canonical time overrides any column of the same name
    pub fn to_row(time_column: &str, record: &Record) -> JsonRow {
        let mut row: JsonRow = Map::new();
        for (column, value) in &record.columns {
            // Value's Serialize never fails
            let cell = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
            row.insert(column.clone(), cell);
        }
        row.insert(
            time_column.to_string(),
            serde_json::Value::from(record.time.to_rfc3339()),
        );
        row
    }

    pub fn to_rows(stream: &Stream) -> Vec<JsonRow> {
        stream
            .iter()
            .map(|record| Self::to_row(stream.time_column(), record))
            .collect()
    }

    pub fn encode(stream: &Stream, format: RowFormat) -> Result<String, FusionError> {
        let rows = Self::to_rows(stream);
        match format {
            RowFormat::Json => Ok(serde_json::to_string(&rows)?),
            RowFormat::JsonPretty => Ok(serde_json::to_string_pretty(&rows)?),
            RowFormat::Ndjson => {
                let mut out = String::new();
                for row in &rows {
                    out.push_str(&serde_json::to_string(row)?);
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }
}
