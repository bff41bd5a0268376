//! Temporal join
//!
//! Aligns two independently-clocked streams by nearest timestamp within a
//! tolerance window. Both inputs are time-ordered (`Stream` guarantees it),
//! so each left record finds its candidates with a binary search over the
//! right stream instead of a full scan.
//!
//! Match rules:
//! - the right record with minimum `|t_right - t_left|` wins
//! - equidistant candidates resolve to the earlier right record; among equal
//!   right timestamps, the first in stream order
//! - a match is valid when the gap is `<= tolerance`
//! - right records may match several left records
//!
//! Chained joins (`join_chain`) keep the original left timestamps, so the
//! result of `(A ⋈ B) ⋈ C` matches B and C independently against A's
//! timestamps and equals a direct three-way nearest join.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::clock::apply_skew;
use crate::error::FusionError;
use crate::types::{Record, Stream, Timestamp, Value};

/// What to emit for a left record with no right record inside the tolerance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Keep the left record; every right column holds `Value::Unmatched`
    #[default]
    Fill,
    /// Drop the left record
    Drop,
}

/// Parameters of one pairwise join
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinOptions {
    pub tolerance: Duration,
    /// Clock skew of the right stream for this join; corrected = decoded - skew
    pub right_skew: Duration,
    pub unmatched: UnmatchedPolicy,
}

impl JoinOptions {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance,
            right_skew: Duration::zero(),
            unmatched: UnmatchedPolicy::Fill,
        }
    }

    pub fn with_right_skew(mut self, skew: Duration) -> Self {
        self.right_skew = skew;
        self
    }

    pub fn with_policy(mut self, policy: UnmatchedPolicy) -> Self {
        self.unmatched = policy;
        self
    }
}

/// Match accounting for one join
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinReport {
    pub left: String,
    pub right: String,
    pub left_records: usize,
    pub right_records: usize,
    pub matched: usize,
    pub unmatched: usize,
    /// Left records dropped under `UnmatchedPolicy::Drop`
    pub dropped: usize,
}

/// Absolute time gap between two instants
pub fn gap(a: &Timestamp, b: &Timestamp) -> Duration {
    if a >= b {
        *a - *b
    } else {
        *b - *a
    }
}

/// Nearest-timestamp joiner
pub struct TemporalJoiner;

impl TemporalJoiner {
    /// Index of the record nearest to `at`, earlier record on ties
    pub fn nearest(records: &[Record], at: &Timestamp) -> Option<usize> {
        let upper = records.partition_point(|r| r.time < *at);

        let after = records.get(upper).map(|r| (upper, r.time - *at));
        let before = if upper > 0 {
            let t = records[upper - 1].time;
            let first = records[..upper].partition_point(|r| r.time < t);
            Some((first, *at - t))
        } else {
            None
        };

        match (before, after) {
            (Some((b, db)), Some((a, da))) => Some(if db <= da { b } else { a }),
            (Some((b, _)), None) => Some(b),
            (None, Some((a, _))) => Some(a),
            (None, None) => None,
        }
    }

    /// Join `right` onto `left`, producing one record per left record
    /// (or fewer under `UnmatchedPolicy::Drop`)
    ///
    /// Right columns whose names collide with left columns are qualified as
    /// `<right>.<column>`; the matched right timestamp is kept as
    /// `<right>.<time_column>`.
    pub fn join(
        left: &Stream,
        right: &Stream,
        options: &JoinOptions,
    ) -> Result<(Stream, JoinReport), FusionError> {
        if options.tolerance < Duration::zero() {
            return Err(FusionError::InvalidConfig(format!(
                "join tolerance must be non-negative, got {} ms",
                options.tolerance.num_milliseconds()
            )));
        }

        let mut report = JoinReport {
            left: left.name().to_string(),
            right: right.name().to_string(),
            left_records: left.len(),
            right_records: right.len(),
            ..Default::default()
        };

        if left.is_empty() {
            warn!(left = left.name(), right = right.name(), "join against empty left stream");
            return Ok((left.derive(Vec::new()), report));
        }
        if right.is_empty() {
            warn!(left = left.name(), right = right.name(), "join against empty right stream");
        }

        let shifted;
        let right = if options.right_skew == Duration::zero() {
            right
        } else {
            shifted = apply_skew(right, options.right_skew)?;
            &shifted
        };

        let right_columns = right.column_names();
        for column in &right_columns {
            right.require_column(column)?;
        }

        let left_columns: BTreeSet<String> = left.column_names().into_iter().collect();
        let qualify = |column: &str| format!("{}.{}", right.name(), column);
        let output_names: Vec<(String, String)> = right_columns
            .iter()
            .map(|c| {
                let name = if left_columns.contains(c) || c == left.time_column() {
                    qualify(c.as_str())
                } else {
                    c.clone()
                };
                (c.clone(), name)
            })
            .collect();
        let time_name = qualify(right.time_column());

        let mut records = Vec::with_capacity(left.len());
        for l in left.iter() {
            let matched = Self::nearest(right.records(), &l.time)
                .map(|idx| &right.records()[idx])
                .filter(|r| gap(&r.time, &l.time) <= options.tolerance);

            let mut out = l.clone();
            match matched {
                Some(r) => {
                    report.matched += 1;
                    for (source, target) in &output_names {
                        let value = r.get(source).cloned().unwrap_or(Value::Unmatched);
                        out.columns.insert(target.clone(), value);
                    }
                    out.columns.insert(time_name.clone(), Value::Time(r.time));
                }
                None => {
                    report.unmatched += 1;
                    if options.unmatched == UnmatchedPolicy::Drop {
                        report.dropped += 1;
                        continue;
                    }
                    for (_, target) in &output_names {
                        out.columns.insert(target.clone(), Value::Unmatched);
                    }
                    out.columns.insert(time_name.clone(), Value::Unmatched);
                }
            }
            records.push(out);
        }

        debug!(
            left = left.name(),
            right = right.name(),
            matched = report.matched,
            unmatched = report.unmatched,
            tolerance_ms = options.tolerance.num_milliseconds(),
            "joined streams"
        );

        Ok((left.derive(records), report))
    }

    /// Repeated pairwise joins; each output becomes the next left stream
    pub fn join_chain(
        left: &Stream,
        rights: &[(&Stream, JoinOptions)],
    ) -> Result<(Stream, Vec<JoinReport>), FusionError> {
        let mut current = left.clone();
        let mut reports = Vec::with_capacity(rights.len());
        for (right, options) in rights {
            let (joined, report) = Self::join(&current, right, options)?;
            reports.push(report);
            current = joined;
        }
        Ok((current, reports))
    }
}
