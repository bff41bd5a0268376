//! Column derivation
//!
//! This module derives per-record columns at load time:
//! - Code relabelling (numeric swing codes to stroke labels)
//! - Linear combinations with optional absolute value (impact penalties, PIQ)
//! - Category concatenation (swing type + hand into a stroke label)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::FusionError;
use crate::types::{Record, Stream, Value};

fn default_coefficient() -> f64 {
    1.0
}

/// Numeric code to label table for one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub column: String,
    /// Column receiving the labels; relabels in place when absent
    #[serde(default)]
    pub output: Option<String>,
    pub codes: BTreeMap<String, String>,
}

/// One term of a linear derivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearTerm {
    pub column: String,
    #[serde(default = "default_coefficient")]
    pub coefficient: f64,
    /// Take the absolute value of the column before weighting
    #[serde(default)]
    pub abs: bool,
}

/// A derived column specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeriveSpec {
    /// `constant + Σ coefficient · (|x| or x)`
    Linear {
        name: String,
        terms: Vec<LinearTerm>,
        #[serde(default)]
        constant: f64,
    },
    /// Concatenate the textual form of several columns
    Concat {
        name: String,
        columns: Vec<String>,
        #[serde(default)]
        separator: String,
    },
}

impl DeriveSpec {
    pub fn name(&self) -> &str {
        match self {
            DeriveSpec::Linear { name, .. } | DeriveSpec::Concat { name, .. } => name,
        }
    }

    fn inputs(&self) -> Vec<&str> {
        match self {
            DeriveSpec::Linear { terms, .. } => terms.iter().map(|t| t.column.as_str()).collect(),
            DeriveSpec::Concat { columns, .. } => columns.iter().map(String::as_str).collect(),
        }
    }
}

/// Lookup key for a code cell: integral numbers print without a fraction
pub(crate) fn code_key(value: &Value) -> Option<String> {
    match value {
        Value::Number(v) if v.fract() == 0.0 && v.is_finite() => Some(format!("{}", *v as i64)),
        Value::Number(v) => Some(v.to_string()),
        Value::Category(s) => Some(s.clone()),
        Value::Time(_) | Value::Unmatched => None,
    }
}

/// Column deriver for relabelled and computed columns
pub struct ColumnDeriver;

impl ColumnDeriver {
    /// Apply label tables, then derivations in declaration order
    pub fn apply(
        stream: &Stream,
        labels: &[LabelSpec],
        derive: &[DeriveSpec],
    ) -> Result<Stream, FusionError> {
        if labels.is_empty() && derive.is_empty() {
            return Ok(stream.clone());
        }

        for label in labels {
            stream.require_column(&label.column)?;
        }

        let mut records: Vec<Record> = stream.records().to_vec();
        for label in labels {
            let target = label.output.as_deref().unwrap_or(&label.column);
            for record in &mut records {
                let relabelled = record
                    .get(&label.column)
                    .map(|v| relabel(v, &label.codes))
                    .unwrap_or(Value::Unmatched);
                record.columns.insert(target.to_string(), relabelled);
            }
        }

        for spec in derive {
            for record in &mut records {
                let value = derive_value(stream.name(), record, spec)?;
                record.columns.insert(spec.name().to_string(), value);
            }
        }

        Ok(stream.derive(records))
    }
}

fn relabel(value: &Value, codes: &BTreeMap<String, String>) -> Value {
    code_key(value)
        .and_then(|key| codes.get(&key))
        .map(|label| Value::Category(label.clone()))
        .unwrap_or_else(|| value.clone())
}

fn derive_value(stream: &str, record: &Record, spec: &DeriveSpec) -> Result<Value, FusionError> {
    for column in spec.inputs() {
        match record.get(column) {
            None => {
                return Err(FusionError::schema(
                    stream,
                    format!("'{}' needs column '{}'", spec.name(), column),
                ))
            }
            Some(Value::Unmatched) => return Ok(Value::Unmatched),
            Some(_) => {}
        }
    }

    match spec {
        DeriveSpec::Linear { name, terms, constant } => {
            let mut total = *constant;
            for term in terms {
                let v = record.number(&term.column).ok_or_else(|| {
                    FusionError::schema(
                        stream,
                        format!("'{}' needs numeric column '{}'", name, term.column),
                    )
                })?;
                let v = if term.abs { v.abs() } else { v };
                total += term.coefficient * v;
            }
            Ok(Value::Number(total))
        }
        DeriveSpec::Concat { columns, separator, .. } => {
            let parts: Vec<String> = columns
                .iter()
                .filter_map(|c| record.get(c).and_then(code_key))
                .collect();
            Ok(Value::Category(parts.join(separator)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn swing(secs: i64, swing_type: f64, side: f64, x: f64, y: f64) -> Record {
        let t = FixedOffset::east_opt(0).unwrap().timestamp_opt(secs, 0).unwrap();
        Record::new(t)
            .with("swing_type", swing_type)
            .with("swing_side", side)
            .with("impact_position_x", x)
            .with("impact_position_y", y)
    }

    fn zepp() -> Stream {
        Stream::new(
            "zepp",
            "l_id",
            vec![swing(0, 3.0, 0.0, 0.5, -1.0), swing(1, 2.0, 1.0, -2.0, 0.25)],
        )
    }

    fn labels() -> Vec<LabelSpec> {
        vec![
            LabelSpec {
                column: "swing_type".into(),
                output: None,
                codes: [("2", "TOPSPIN"), ("3", "SERVE")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            LabelSpec {
                column: "swing_side".into(),
                output: Some("hand_type".into()),
                codes: [("0", "FH"), ("1", "BH")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        ]
    }

    #[test]
    fn test_labels_and_stroke_concat() {
        let derive = vec![DeriveSpec::Concat {
            name: "stroke".into(),
            columns: vec!["swing_type".into(), "hand_type".into()],
            separator: String::new(),
        }];
        let out = ColumnDeriver::apply(&zepp(), &labels(), &derive).unwrap();

        assert_eq!(out.records()[0].category("stroke"), Some("SERVEFH"));
        assert_eq!(out.records()[1].category("stroke"), Some("TOPSPINBH"));
        // in-place relabel keeps the source column name, output labels keep the code column
        assert_eq!(out.records()[0].category("swing_type"), Some("SERVE"));
        assert_eq!(out.records()[0].number("swing_side"), Some(0.0));
    }

    #[test]
    fn test_unlisted_code_kept() {
        let stream = Stream::new("zepp", "l_id", vec![swing(0, 9.0, 0.0, 0.0, 0.0)]);
        let out = ColumnDeriver::apply(&stream, &labels(), &[]).unwrap();
        assert_eq!(out.records()[0].number("swing_type"), Some(9.0));
    }

    #[test]
    fn test_linear_with_abs_penalty() {
        let derive = vec![
            DeriveSpec::Linear {
                name: "abs_imp".into(),
                terms: vec![
                    LinearTerm { column: "impact_position_x".into(), coefficient: -1.0, abs: true },
                    LinearTerm { column: "impact_position_y".into(), coefficient: -1.0, abs: true },
                ],
                constant: 0.0,
            },
            DeriveSpec::Linear {
                name: "diffxy".into(),
                terms: vec![
                    LinearTerm { column: "impact_position_x".into(), coefficient: 0.5, abs: false },
                    LinearTerm { column: "impact_position_y".into(), coefficient: -1.0, abs: false },
                ],
                constant: 0.0,
            },
        ];
        let out = ColumnDeriver::apply(&zepp(), &[], &derive).unwrap();

        assert_eq!(out.records()[0].number("abs_imp"), Some(-1.5));
        assert_eq!(out.records()[1].number("abs_imp"), Some(-2.25));
        assert_eq!(out.records()[0].number("diffxy"), Some(1.25));
    }

    #[test]
    fn test_missing_input_column_is_schema_mismatch() {
        let derive = vec![DeriveSpec::Linear {
            name: "PIQ".into(),
            terms: vec![LinearTerm { column: "SpeedScore".into(), coefficient: 1.0, abs: false }],
            constant: 0.0,
        }];
        let err = ColumnDeriver::apply(&zepp(), &[], &derive).unwrap_err();
        assert!(matches!(err, FusionError::SchemaMismatch { .. }));
    }
}
