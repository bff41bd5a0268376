//! Run configuration
//!
//! Everything the fusion core needs to know about a run is supplied through a
//! single immutable [`FusionConfig`]: per-stream timestamp encodings and
//! validity bounds, per-join tolerance and clock skew, per-normalization
//! column pairs, and the category weight/multiplier tables. Nothing in the
//! core reads paths, offsets, or calibration constants from anywhere else.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::clock::{parse_offset, TimestampCodec};
use crate::composite::CompositeSpec;
use crate::derive::{DeriveSpec, LabelSpec};
use crate::error::FusionError;
use crate::join::UnmatchedPolicy;
use crate::normalize::MultiplierTable;
use crate::outlier::Bounds;
use crate::window::TimeWindow;

fn default_true() -> bool {
    true
}

fn default_reference_offset() -> String {
    "+00:00".to_string()
}

/// Largest accepted join tolerance or clock skew, in milliseconds (one day)
pub const MAX_JOIN_OFFSET_MS: i64 = 86_400_000;

fn default_utc() -> String {
    "+00:00".to_string()
}

/// How a stream encodes its native timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimestampEncoding {
    /// Integer epoch count; `units_per_second` is the divisor to seconds
    /// (1000 for milliseconds, 10000 for Babolat ticks, 10^9 for nanoseconds)
    Epoch { units_per_second: i64 },
    /// Wall-clock text in a chrono `strftime` format (or `rfc3339`),
    /// interpreted at the given source UTC offset
    Text {
        format: String,
        #[serde(default = "default_utc")]
        utc_offset: String,
    },
}

/// Per-stream preparation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stable stream name used by steps to refer to it
    pub name: String,
    /// Row field holding the native timestamp
    pub time_column: String,
    /// Native timestamp encoding
    pub encoding: TimestampEncoding,
    /// Exclusive validity bounds applied before any join or normalization
    #[serde(default)]
    pub bounds: Bounds,
    /// Inclusive session window; rows outside are discarded
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Numeric code to label tables
    #[serde(default)]
    pub labels: Vec<LabelSpec>,
    /// Derived columns computed at load time
    #[serde(default)]
    pub derive: Vec<DeriveSpec>,
    /// Drop rows carrying a null field
    #[serde(default = "default_true")]
    pub drop_incomplete: bool,
    /// Drop exact duplicate rows
    #[serde(default)]
    pub dedupe: bool,
}

/// Reference to a column of a named stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub stream: String,
    pub column: String,
}

/// Pairwise nearest-time join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinStep {
    pub left: String,
    pub right: String,
    /// Name under which the joined stream is registered
    pub output: String,
    /// Maximum allowed time gap for a match (inclusive)
    pub tolerance_ms: i64,
    /// Clock skew of the left stream for this join; corrected = decoded - skew
    #[serde(default)]
    pub left_skew_ms: i64,
    /// Clock skew of the right stream for this join
    #[serde(default)]
    pub right_skew_ms: i64,
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,
    /// Right-side columns to carry into the output; all of them when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

impl JoinStep {
    fn validate(&self, idx: usize) -> Result<(), FusionError> {
        if !(0..=MAX_JOIN_OFFSET_MS).contains(&self.tolerance_ms) {
            return Err(FusionError::InvalidConfig(format!(
                "step {}: tolerance_ms must be within [0, {}], got {}",
                idx, MAX_JOIN_OFFSET_MS, self.tolerance_ms
            )));
        }
        for (field, skew) in [("left_skew_ms", self.left_skew_ms), ("right_skew_ms", self.right_skew_ms)] {
            if !(-MAX_JOIN_OFFSET_MS..=MAX_JOIN_OFFSET_MS).contains(&skew) {
                return Err(FusionError::InvalidConfig(format!(
                    "step {}: {} must be within ±{}, got {}",
                    idx, field, MAX_JOIN_OFFSET_MS, skew
                )));
            }
        }
        Ok(())
    }

    pub fn tolerance(&self) -> Duration {
        Duration::milliseconds(self.tolerance_ms)
    }

    pub fn left_skew(&self) -> Duration {
        Duration::milliseconds(self.left_skew_ms)
    }

    pub fn right_skew(&self) -> Duration {
        Duration::milliseconds(self.right_skew_ms)
    }
}

/// Min-max mapping of `source` into the observed range of `reference`
///
/// The result is written back to the source stream as `output_column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeStep {
    pub reference: ColumnRef,
    pub source: ColumnRef,
    pub output_column: String,
    #[serde(default)]
    pub multipliers: Option<MultiplierTable>,
}

/// Rescale a column into [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitScaleStep {
    pub stream: String,
    pub column: String,
    pub output_column: String,
}

/// Add a composite score column to a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeStep {
    pub stream: String,
    #[serde(flatten)]
    pub spec: CompositeSpec,
}

/// Apply outlier bounds to an already-built stream (e.g. a derived score)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStep {
    pub stream: String,
    pub bounds: Bounds,
}

/// One pipeline step, executed in declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepConfig {
    Join(JoinStep),
    Normalize(NormalizeStep),
    UnitScale(UnitScaleStep),
    Composite(CompositeStep),
    Filter(FilterStep),
}

impl StepConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Join(_) => "join",
            StepConfig::Normalize(_) => "normalize",
            StepConfig::UnitScale(_) => "unit_scale",
            StepConfig::Composite(_) => "composite",
            StepConfig::Filter(_) => "filter",
        }
    }

    /// Streams read by this step
    fn inputs(&self) -> Vec<&str> {
        match self {
            StepConfig::Join(j) => vec![j.left.as_str(), j.right.as_str()],
            StepConfig::Normalize(n) => vec![n.reference.stream.as_str(), n.source.stream.as_str()],
            StepConfig::UnitScale(u) => vec![u.stream.as_str()],
            StepConfig::Composite(c) => vec![c.stream.as_str()],
            StepConfig::Filter(f) => vec![f.stream.as_str()],
        }
    }
}

/// Immutable configuration for one fusion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Reference UTC offset every canonical timestamp is expressed in
    #[serde(default = "default_reference_offset")]
    pub reference_offset: String,
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// Stream handed to the consumer once all steps have run
    pub output: String,
}

impl FusionConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, FusionError> {
        let config: FusionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, FusionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Check the configuration before any data is touched
    pub fn validate(&self) -> Result<(), FusionError> {
        parse_offset(&self.reference_offset)?;

        let mut known: BTreeSet<&str> = BTreeSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() {
                return Err(FusionError::InvalidConfig("stream name must not be empty".into()));
            }
            if !known.insert(stream.name.as_str()) {
                return Err(FusionError::InvalidConfig(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
            TimestampCodec::from_encoding(&stream.encoding)?;
            for (column, bound) in &stream.bounds {
                bound.validate(column)?;
            }
            if let Some(window) = &stream.window {
                window.validate()?;
            }
        }

        for (idx, step) in self.steps.iter().enumerate() {
            for input in step.inputs() {
                if !known.contains(input) {
                    return Err(FusionError::UnknownStream(format!(
                        "step {} ({}) reads '{}' before it is defined",
                        idx,
                        step.kind(),
                        input
                    )));
                }
            }
            match step {
                StepConfig::Join(join) => {
                    join.validate(idx)?;
                    known.insert(join.output.as_str());
                }
                StepConfig::Filter(filter) => {
                    for (column, bound) in &filter.bounds {
                        bound.validate(column)?;
                    }
                }
                StepConfig::Composite(composite) => {
                    if composite.spec.terms.is_empty() {
                        return Err(FusionError::InvalidConfig(format!(
                            "step {}: composite '{}' has no terms",
                            idx, composite.spec.name
                        )));
                    }
                }
                StepConfig::Normalize(_) | StepConfig::UnitScale(_) => {}
            }
        }

        if !known.contains(self.output.as_str()) {
            return Err(FusionError::UnknownStream(format!(
                "output stream '{}' is never produced",
                self.output
            )));
        }

        Ok(())
    }

    /// Example configuration covering the three-sensor tennis setup
    pub fn example() -> Result<Self, FusionError> {
        let example = r#"{
            "reference_offset": "-07:00",
            "streams": [
                {
                    "name": "zepp",
                    "time_column": "l_id",
                    "encoding": { "kind": "epoch", "units_per_second": 1000 },
                    "bounds": { "dbg_acc_1": { "max": 10000 }, "dbg_acc_3": { "max": 10000 } },
                    "labels": [
                        { "column": "swing_type", "codes": { "0": "SLICE", "1": "FLAT", "2": "TOPSPIN", "3": "SERVE", "4": "VOLLEY", "5": "SMASH" } },
                        { "column": "swing_side", "output": "hand_type", "codes": { "0": "FH", "1": "BH" } }
                    ],
                    "derive": [
                        { "kind": "concat", "name": "stroke", "columns": ["swing_type", "hand_type"] },
                        { "kind": "linear", "name": "abs_imp", "terms": [
                            { "column": "impact_position_x", "coefficient": -1, "abs": true },
                            { "column": "impact_position_y", "coefficient": -1, "abs": true }
                        ] }
                    ]
                },
                {
                    "name": "babolat",
                    "time_column": "time",
                    "encoding": { "kind": "epoch", "units_per_second": 10000 },
                    "dedupe": true,
                    "derive": [
                        { "kind": "linear", "name": "PIQ", "terms": [
                            { "column": "SpeedScore" }, { "column": "StyleScore" }, { "column": "EffectScore" }
                        ] }
                    ]
                },
                {
                    "name": "watch",
                    "time_column": "time",
                    "encoding": { "kind": "epoch", "units_per_second": 1000000000 }
                }
            ],
            "steps": [
                { "step": "normalize", "reference": { "stream": "babolat", "column": "EffectScore" },
                  "source": { "stream": "zepp", "column": "ball_spin" }, "output_column": "ZIQspin",
                  "multipliers": { "column": "stroke", "table": { "SERVEFH": 1.0 }, "default": 2.0 } },
                { "step": "normalize", "reference": { "stream": "babolat", "column": "SpeedScore" },
                  "source": { "stream": "zepp", "column": "racket_speed" }, "output_column": "ZIQspeed",
                  "multipliers": { "column": "stroke", "table": { "SERVEFH": 1.0 }, "default": 1.6 } },
                { "step": "normalize", "reference": { "stream": "babolat", "column": "StyleScore" },
                  "source": { "stream": "zepp", "column": "abs_imp" }, "output_column": "ZIQpos" },
                { "step": "composite", "stream": "zepp", "name": "ZIQ",
                  "terms": [ { "column": "ZIQspeed" }, { "column": "ZIQspin" }, { "column": "ZIQpos" } ],
                  "category_column": "stroke", "weights": { "SERVEFH": 0.9 } },
                { "step": "filter", "stream": "zepp", "bounds": { "ZIQ": { "max": 10000 } } },
                { "step": "join", "left": "zepp", "right": "babolat", "output": "racket",
                  "tolerance_ms": 5000, "right_skew_ms": 5000 },
                { "step": "join", "left": "watch", "right": "racket", "output": "merged",
                  "tolerance_ms": 5000, "left_skew_ms": -1000 },
                { "step": "normalize", "reference": { "stream": "zepp", "column": "dbg_acc_1" },
                  "source": { "stream": "merged", "column": "accelerationX" }, "output_column": "AccXNorm1" },
                { "step": "normalize", "reference": { "stream": "zepp", "column": "dbg_gyro_1" },
                  "source": { "stream": "merged", "column": "accelerationX" }, "output_column": "Gyro1Norm1" }
            ],
            "output": "merged"
        }"#;
        Self::from_json(example)
    }

    /// Names of all streams defined by the configuration, including join outputs
    pub fn stream_names(&self) -> BTreeMap<String, &'static str> {
        let mut names = BTreeMap::new();
        for stream in &self.streams {
            names.insert(stream.name.clone(), "input");
        }
        for step in &self.steps {
            if let StepConfig::Join(join) = step {
                names.insert(join.output.clone(), "join");
            }
        }
        names
    }
}
