//! Stream loading
//!
//! Turns already-read tabular rows (a JSON array or NDJSON, one object per
//! row) into raw rows whose timestamp cell is still in its native encoding.
//! Reading files or querying databases stays with the caller.

use serde::Serialize;
use serde_json::Map;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::FusionError;
use crate::types::Value;

/// One input row as delivered by the external loader
pub type JsonRow = Map<String, serde_json::Value>;

/// A row with typed measurement cells and an undecoded timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// Native timestamp cell (`null` when the row had none)
    pub time: serde_json::Value,
    pub columns: BTreeMap<String, Value>,
}

/// Row accounting for one stream's load stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub rows: usize,
    pub incomplete: usize,
    pub duplicates: usize,
}

/// Loader for raw stream rows
pub struct StreamLoader;

impl StreamLoader {
    /// Parse a JSON string containing an array of row objects
    pub fn parse_array(json: &str) -> Result<Vec<JsonRow>, FusionError> {
        let rows: Vec<JsonRow> = serde_json::from_str(json)?;
        Ok(rows)
    }

    /// Parse NDJSON (newline-delimited JSON) row objects
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<JsonRow>, FusionError> {
        let mut rows = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRow>(trimmed) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    return Err(FusionError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(rows)
    }

    /// Parse either format, picking NDJSON unless the text opens a JSON array
    pub fn parse_auto(text: &str) -> Result<Vec<JsonRow>, FusionError> {
        if text.trim_start().starts_with('[') {
            Self::parse_array(text)
        } else {
            Self::parse_ndjson(text)
        }
    }

    /// Convert JSON rows to raw rows for one configured stream
    ///
    /// Rows with a null field are dropped when `drop_incomplete` is set;
    /// otherwise null cells become `Value::Unmatched`. Exact duplicates are
    /// dropped when `dedupe` is set. A missing timestamp field is left for the
    /// clock normalizer to reject and count.
    pub fn to_raw_rows(
        rows: Vec<JsonRow>,
        config: &StreamConfig,
    ) -> Result<(Vec<RawRow>, LoadReport), FusionError> {
        let mut report = LoadReport {
            rows: rows.len(),
            ..Default::default()
        };
        let mut seen: HashSet<String> = HashSet::new();
        let mut raw_rows = Vec::with_capacity(rows.len());

        for (idx, mut row) in rows.into_iter().enumerate() {
            if config.dedupe {
                let key = serde_json::to_string(&row)?;
                if !seen.insert(key) {
                    report.duplicates += 1;
                    continue;
                }
            }

            let has_null = row.values().any(serde_json::Value::is_null);
            if has_null && config.drop_incomplete {
                report.incomplete += 1;
                continue;
            }

            let time = row
                .remove(&config.time_column)
                .unwrap_or(serde_json::Value::Null);

            let mut columns = BTreeMap::new();
            for (column, cell) in row {
                let value = convert_cell(&config.name, idx, &column, cell)?;
                columns.insert(column, value);
            }

            raw_rows.push(RawRow { time, columns });
        }

        debug!(
            stream = %config.name,
            rows = report.rows,
            incomplete = report.incomplete,
            duplicates = report.duplicates,
            "loaded raw rows"
        );

        Ok((raw_rows, report))
    }
}

fn convert_cell(
    stream: &str,
    row: usize,
    column: &str,
    cell: serde_json::Value,
) -> Result<Value, FusionError> {
    match cell {
        serde_json::Value::Null => Ok(Value::Unmatched),
        serde_json::Value::Number(n) => n.as_f64().map(Value::Number).ok_or_else(|| {
            FusionError::ParseError(format!("stream '{}' row {}: '{}' is not representable", stream, row, column))
        }),
        serde_json::Value::String(s) => Ok(Value::Category(s)),
        serde_json::Value::Bool(b) => Ok(Value::Category(b.to_string())),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(FusionError::ParseError(
            format!("stream '{}' row {}: column '{}' holds a nested value", stream, row, column),
        )),
    }
}
