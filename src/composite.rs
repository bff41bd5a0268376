//! Composite scores
//!
//! A composite score is a category-weighted sum of already-normalized columns,
//! e.g. `ZIQ = (ZIQspeed + ZIQspin + ZIQpos) × weight(stroke)`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::derive::code_key;
use crate::error::FusionError;
use crate::types::{Record, Stream, Value};

fn default_coefficient() -> f64 {
    1.0
}

fn default_weight() -> f64 {
    1.0
}

/// One weighted input of a composite score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTerm {
    pub column: String,
    #[serde(default = "default_coefficient")]
    pub coefficient: f64,
}

/// Composite score definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSpec {
    /// Output column
    pub name: String,
    pub terms: Vec<ScoreTerm>,
    /// Category column selecting the weight; every record gets the default when absent
    #[serde(default)]
    pub category_column: Option<String>,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default = "default_weight")]
    pub default_weight: f64,
}

impl CompositeSpec {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            terms: columns
                .iter()
                .map(|c| ScoreTerm {
                    column: c.to_string(),
                    coefficient: 1.0,
                })
                .collect(),
            category_column: None,
            weights: BTreeMap::new(),
            default_weight: 1.0,
        }
    }

    pub fn weighted_by(mut self, column: impl Into<String>, weights: BTreeMap<String, f64>) -> Self {
        self.category_column = Some(column.into());
        self.weights = weights;
        self
    }

    /// Weight for a record; uncategorized and unlisted records get the default
    pub fn weight_for(&self, record: &Record) -> f64 {
        self.category_column
            .as_deref()
            .and_then(|column| record.get(column))
            .and_then(code_key)
            .and_then(|key| self.weights.get(&key).copied())
            .unwrap_or(self.default_weight)
    }

    /// Score one record; any unmatched or missing term yields `Value::Unmatched`
    pub fn score(&self, record: &Record) -> Value {
        let mut total = 0.0;
        for term in &self.terms {
            match record.number(&term.column) {
                Some(v) => total += term.coefficient * v,
                None => return Value::Unmatched,
            }
        }
        Value::Number(self.weight_for(record) * total)
    }
}

/// Builder adding composite score columns to streams
pub struct CompositeScoreBuilder;

impl CompositeScoreBuilder {
    /// Add `spec.name` to every record of `stream`
    ///
    /// Term columns must be numeric (unmatched allowed) and present on every
    /// record; the category column, when set, must be present too.
    pub fn apply(stream: &Stream, spec: &CompositeSpec) -> Result<Stream, FusionError> {
        for term in &spec.terms {
            stream.numeric_column(&term.column)?;
        }
        if let Some(column) = &spec.category_column {
            stream.require_column(column)?;
        }

        let records: Vec<Record> = stream
            .iter()
            .map(|record| {
                let mut out = record.clone();
                out.columns.insert(spec.name.clone(), spec.score(record));
                out
            })
            .collect();

        let unmatched = records
            .iter()
            .filter(|r| r.get(&spec.name).map_or(false, Value::is_unmatched))
            .count();
        debug!(
            stream = stream.name(),
            score = spec.name.as_str(),
            records = records.len(),
            unmatched,
            "composite score built"
        );

        Ok(stream.derive(records))
    }
}
