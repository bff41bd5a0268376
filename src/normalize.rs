//! Range normalization
//!
//! This module rescales a column of one stream into the observed value range
//! of a reference column from another stream, so physically different
//! measurements (ball spin vs. effect score, raw acceleration vs. gyro counts)
//! can be compared on one axis.
//! - Affine min-max mapping recomputed from the current stream contents
//! - Category multiplier table applied after the mapping
//! - Unit-interval scaling for overlaying signals

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::derive::code_key;
use crate::error::FusionError;
use crate::types::{Record, Stream, Value};

fn default_multiplier() -> f64 {
    1.0
}

/// Affine mapping from a source range onto a reference range
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizationMapping {
    pub scale: f64,
    pub offset: f64,
    pub source_min: f64,
    pub source_max: f64,
    pub target_min: f64,
    pub target_max: f64,
}

impl NormalizationMapping {
    /// `scale = (maxA - minA) / (maxB - minB)`, `offset = minA - minB * scale`
    pub fn from_ranges(
        column: &str,
        target: (f64, f64),
        source: (f64, f64),
    ) -> Result<Self, FusionError> {
        let (target_min, target_max) = target;
        let (source_min, source_max) = source;
        if source_max == source_min {
            return Err(FusionError::DegenerateRange {
                column: column.to_string(),
                value: source_min,
            });
        }
        let scale = (target_max - target_min) / (source_max - source_min);
        Ok(Self {
            scale,
            offset: target_min - source_min * scale,
            source_min,
            source_max,
            target_min,
            target_max,
        })
    }

    /// Map a source value; the source extremes land exactly on the target extremes
    pub fn apply(&self, value: f64) -> f64 {
        if value == self.source_min {
            self.target_min
        } else if value == self.source_max {
            self.target_max
        } else {
            (value - self.source_min) * self.scale + self.target_min
        }
    }
}

/// Category-dependent multiplier applied after the affine mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierTable {
    /// Category column consulted per record
    pub column: String,
    pub table: BTreeMap<String, f64>,
    /// Multiplier for categories not listed in the table
    #[serde(default = "default_multiplier")]
    pub default: f64,
}

impl MultiplierTable {
    pub fn multiplier(&self, record: &Record) -> f64 {
        record
            .get(&self.column)
            .and_then(code_key)
            .and_then(|key| self.table.get(&key).copied())
            .unwrap_or(self.default)
    }
}

/// Range normalizer over stream columns
pub struct RangeNormalizer;

impl RangeNormalizer {
    /// Fit a mapping from the current contents of both columns
    ///
    /// Returns `Ok(None)` when either column has no numeric values.
    pub fn fit(
        reference: &Stream,
        reference_column: &str,
        source: &Stream,
        source_column: &str,
    ) -> Result<Option<NormalizationMapping>, FusionError> {
        let target = reference.numeric_range(reference_column)?;
        let range = source.numeric_range(source_column)?;
        match (target, range) {
            (Some(target), Some(range)) => {
                NormalizationMapping::from_ranges(source_column, target, range).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Add `output_column` to `source`: `source_column` mapped into the range
    /// of `reference_column`, then scaled by the category multiplier
    ///
    /// Unmatched source cells stay unmatched. When either side has no values
    /// to take a range from, the output column is filled with
    /// `Value::Unmatched` and no mapping is returned.
    pub fn normalize_column(
        reference: &Stream,
        reference_column: &str,
        source: &Stream,
        source_column: &str,
        output_column: &str,
        multipliers: Option<&MultiplierTable>,
    ) -> Result<(Stream, Option<NormalizationMapping>), FusionError> {
        if source.is_empty() {
            warn!(source = source.name(), column = source_column, "normalizing empty stream");
            return Ok((source.clone(), None));
        }
        if let Some(table) = multipliers {
            source.require_column(&table.column)?;
        }

        let mapping = Self::fit(reference, reference_column, source, source_column)?;
        if mapping.is_none() {
            warn!(
                reference = reference.name(),
                reference_column,
                source = source.name(),
                source_column,
                "no values to take a range from"
            );
        }

        let records = map_column(source, source_column, output_column, mapping, multipliers)?;

        if let Some(m) = mapping {
            debug!(
                source = source.name(),
                source_column,
                output_column,
                scale = m.scale,
                offset = m.offset,
                "normalized column"
            );
        }

        Ok((source.derive(records), mapping))
    }

    /// Rescale a column into [0, 1] by its own min and max
    pub fn unit_scale(
        source: &Stream,
        column: &str,
        output_column: &str,
    ) -> Result<(Stream, Option<NormalizationMapping>), FusionError> {
        let mapping = source
            .numeric_range(column)?
            .map(|range| NormalizationMapping::from_ranges(column, (0.0, 1.0), range))
            .transpose()?;
        let records = map_column(source, column, output_column, mapping, None)?;
        Ok((source.derive(records), mapping))
    }
}

fn map_column(
    source: &Stream,
    column: &str,
    output_column: &str,
    mapping: Option<NormalizationMapping>,
    multipliers: Option<&MultiplierTable>,
) -> Result<Vec<Record>, FusionError> {
    let values = source.numeric_column(column)?;
    Ok(source
        .iter()
        .zip(values)
        .map(|(record, value)| {
            let mapped = match (mapping, value) {
                (Some(m), Some(v)) => {
                    let factor = multipliers.map_or(1.0, |t| t.multiplier(record));
                    Value::Number(m.apply(v) * factor)
                }
                _ => Value::Unmatched,
            };
            let mut out = record.clone();
            out.columns.insert(output_column.to_string(), mapped);
            out
        })
        .collect())
}
