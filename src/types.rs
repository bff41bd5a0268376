//! Core types for the Swing Fusion pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: cell values, records, and time-ordered streams.

use chrono::{DateTime, FixedOffset};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use crate::error::FusionError;

/// Canonical instant, always carried in the run's reference UTC offset
pub type Timestamp = DateTime<FixedOffset>;

/// A single cell of a record
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Numeric measurement
    Number(f64),
    /// Categorical label (stroke type, hand, session tag)
    Category(String),
    /// Timestamp carried as a column (e.g. the matched right-side time of a join)
    Time(Timestamp),
    /// Explicit "no value": a null input cell, the right-side cell of an
    /// unmatched join row, or a value computed from unmatched inputs
    Unmatched,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            Value::Category(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_unmatched(&self) -> bool {
        matches!(self, Value::Unmatched)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Category(_) => "category",
            Value::Time(_) => "time",
            Value::Unmatched => "unmatched",
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Number(v) => serializer.serialize_f64(*v),
            Value::Category(s) => serializer.serialize_str(s),
            Value::Time(t) => serializer.serialize_str(&t.to_rfc3339()),
            Value::Unmatched => serializer.serialize_none(),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Category(s.to_string())
    }
}

/// One sensor reading: a canonical timestamp plus named columns
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: Timestamp,
    pub columns: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            columns: BTreeMap::new(),
        }
    }

    /// Builder-style column insertion
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.columns.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Value::as_f64)
    }

    pub fn category(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_category)
    }
}

/// A named, time-ordered sequence of records from one source
///
/// Records are stable-sorted by timestamp on construction, so every `Stream`
/// is non-decreasing in time and equal timestamps keep their input order.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    name: String,
    time_column: String,
    records: Vec<Record>,
}

impl Stream {
    pub fn new(name: impl Into<String>, time_column: impl Into<String>, mut records: Vec<Record>) -> Self {
        records.sort_by(|a, b| a.time.cmp(&b.time));
        Self {
            name: name.into(),
            time_column: time_column.into(),
            records,
        }
    }

    /// Build a stream sharing this stream's name and time column
    pub fn derive(&self, records: Vec<Record>) -> Self {
        Self::new(self.name.clone(), self.time_column.clone(), records)
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time_column(&self) -> &str {
        &self.time_column
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Union of column names across all records
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .iter()
            .flat_map(|r| r.columns.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Fail with `SchemaMismatch` unless every record carries `column`
    pub fn require_column(&self, column: &str) -> Result<(), FusionError> {
        match self.records.iter().position(|r| !r.columns.contains_key(column)) {
            None => Ok(()),
            Some(idx) => Err(FusionError::schema(
                &self.name,
                format!("column '{}' missing from record {}", column, idx),
            )),
        }
    }

    /// Keep only `columns` in every record
    pub fn select(&self, columns: &[String]) -> Result<Self, FusionError> {
        for column in columns {
            self.require_column(column)?;
        }
        let records = self
            .records
            .iter()
            .map(|r| Record {
                time: r.time,
                columns: r
                    .columns
                    .iter()
                    .filter(|(name, _)| columns.contains(name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            })
            .collect();
        Ok(self.derive(records))
    }

    /// Numeric values of `column`, with `None` for unmatched cells
    ///
    /// Fails when the column is absent from a record or holds a non-numeric value.
    pub fn numeric_column(&self, column: &str) -> Result<Vec<Option<f64>>, FusionError> {
        self.records
            .iter()
            .enumerate()
            .map(|(idx, r)| match r.get(column) {
                Some(Value::Number(v)) => Ok(Some(*v)),
                Some(Value::Unmatched) => Ok(None),
                Some(other) => Err(FusionError::schema(
                    &self.name,
                    format!("column '{}' holds {} values, expected number", column, other.kind()),
                )),
                None => Err(FusionError::schema(
                    &self.name,
                    format!("column '{}' missing from record {}", column, idx),
                )),
            })
            .collect()
    }

    /// Observed `[min, max]` over the numeric cells of `column`
    ///
    /// Returns `None` when the stream has no numeric values for the column.
    pub fn numeric_range(&self, column: &str) -> Result<Option<(f64, f64)>, FusionError> {
        let values = self.numeric_column(column)?;
        Ok(values
            .into_iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            }))
    }
}

impl<'a> IntoIterator for &'a Stream {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> Timestamp {
        FixedOffset::west_opt(7 * 3600)
            .unwrap()
            .timestamp_opt(secs, 0)
            .unwrap()
    }

    #[test]
    fn test_stream_sorts_stably() {
        let stream = Stream::new(
            "watch",
            "timestamp",
            vec![
                Record::new(ts(5)).with("v", 1.0),
                Record::new(ts(1)).with("v", 2.0),
                Record::new(ts(5)).with("v", 3.0),
                Record::new(ts(3)).with("v", 4.0),
            ],
        );

        let order: Vec<f64> = stream.iter().map(|r| r.number("v").unwrap()).collect();
        assert_eq!(order, vec![2.0, 4.0, 1.0, 3.0]);
    }

    #[test]
    fn test_numeric_range_skips_unmatched() {
        let stream = Stream::new(
            "joined",
            "time",
            vec![
                Record::new(ts(0)).with("v", 4.0),
                Record::new(ts(1)).with("v", Value::Unmatched),
                Record::new(ts(2)).with("v", -2.0),
            ],
        );

        assert_eq!(stream.numeric_range("v").unwrap(), Some((-2.0, 4.0)));
    }

    #[test]
    fn test_missing_column_is_schema_mismatch() {
        let stream = Stream::new(
            "zepp",
            "time",
            vec![Record::new(ts(0)).with("v", 1.0), Record::new(ts(1))],
        );

        let err = stream.numeric_range("v").unwrap_err();
        assert!(matches!(err, FusionError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_categorical_column_is_not_numeric() {
        let stream = Stream::new("bab", "time", vec![Record::new(ts(0)).with("type", "SERVE")]);
        assert!(stream.numeric_column("type").is_err());
    }

    #[test]
    fn test_unmatched_serializes_as_null() {
        let json = serde_json::to_string(&Value::Unmatched).unwrap();
        assert_eq!(json, "null");
        let json = serde_json::to_string(&Value::Category("FH".into())).unwrap();
        assert_eq!(json, "\"FH\"");
    }
}
