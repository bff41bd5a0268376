//! Outlier rejection
//!
//! Drops records whose bounded columns fall outside exclusive validity bounds.
//! Runs before any min/max is taken so observed ranges reflect validated data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::FusionError;
use crate::types::Stream;

/// Exclusive validity bound for one column; a missing side is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Bound {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn below(max: f64) -> Self {
        Self::new(None, Some(max))
    }

    pub fn above(min: f64) -> Self {
        Self::new(Some(min), None)
    }

    /// Strictly inside; NaN is never inside
    pub fn contains(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        self.min.map_or(true, |lo| value > lo) && self.max.map_or(true, |hi| value < hi)
    }

    pub fn validate(&self, column: &str) -> Result<(), FusionError> {
        if let (Some(lo), Some(hi)) = (self.min, self.max) {
            if lo >= hi {
                return Err(FusionError::InvalidConfig(format!(
                    "bound for '{}' is empty: min {} >= max {}",
                    column, lo, hi
                )));
            }
        }
        Ok(())
    }
}

/// Bounds keyed by column name
pub type Bounds = BTreeMap<String, Bound>;

/// Outcome of one filter pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub kept: usize,
    pub removed: usize,
    /// Removed records attributed to the first (by name) bound they violated
    pub removed_by_column: BTreeMap<String, usize>,
}

/// Outlier filter over bounded columns
pub struct OutlierFilter;

impl OutlierFilter {
    /// Retain records whose every bounded column lies strictly inside its bound
    ///
    /// Order-preserving. Unmatched cells fail their bound. A bounded column that
    /// is missing or non-numeric is a schema mismatch.
    pub fn apply(stream: &Stream, bounds: &Bounds) -> Result<(Stream, FilterReport), FusionError> {
        if bounds.is_empty() {
            let report = FilterReport {
                kept: stream.len(),
                ..Default::default()
            };
            return Ok((stream.clone(), report));
        }

        let mut columns: Vec<(&String, &Bound, Vec<Option<f64>>)> = Vec::with_capacity(bounds.len());
        for (column, bound) in bounds {
            columns.push((column, bound, stream.numeric_column(column)?));
        }

        let mut report = FilterReport::default();
        let mut kept = Vec::with_capacity(stream.len());

        for (idx, record) in stream.iter().enumerate() {
            let violated = columns.iter().find(|(_, bound, values)| {
                !values[idx].map_or(false, |v| bound.contains(v))
            });
            match violated {
                None => kept.push(record.clone()),
                Some((column, _, _)) => {
                    *report.removed_by_column.entry((*column).clone()).or_insert(0) += 1;
                    report.removed += 1;
                }
            }
        }

        report.kept = kept.len();
        if report.removed > 0 {
            info!(
                stream = stream.name(),
                removed = report.removed,
                kept = report.kept,
                "outliers removed"
            );
        } else {
            debug!(stream = stream.name(), kept = report.kept, "no outliers");
        }

        Ok((stream.derive(kept), report))
    }
}
