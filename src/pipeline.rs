//! Pipeline orchestration
//!
//! This module provides the public API for Swing Fusion.
//! It runs a configured fusion from raw JSON rows to one joined, normalized
//! and scored output stream.
//!
//! Per-stream preparation:
//! 1. StreamLoader - drop incomplete and duplicate rows, type the cells
//! 2. ClockNormalizer - decode native timestamps into the reference offset
//! 3. ColumnDeriver - code relabelling and derived columns
//! 4. TimeWindow - session selection
//! 5. OutlierFilter - validity bounds
//!
//! Then the configured steps run in declaration order over a registry of
//! named streams: joins register their output under a new name, the other
//! steps replace the stream they write.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{apply_skew, ClockNormalizer, DecodeReport, TimestampCodec};
use crate::composite::CompositeScoreBuilder;
use crate::config::{FusionConfig, StepConfig, StreamConfig};
use crate::derive::ColumnDeriver;
use crate::encoder::RowEncoder;
use crate::error::FusionError;
use crate::join::{JoinOptions, JoinReport, TemporalJoiner};
use crate::loader::{JsonRow, LoadReport, StreamLoader};
use crate::normalize::{NormalizationMapping, RangeNormalizer};
use crate::outlier::{FilterReport, OutlierFilter};
use crate::types::Stream;
use crate::{FUSION_VERSION, PRODUCER_NAME};

/// Preparation accounting for one input stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamReport {
    pub load: LoadReport,
    pub decode: DecodeReport,
    /// Records outside the session window
    pub windowed_out: usize,
    pub filter: FilterReport,
    /// Records left after preparation
    pub records: usize,
}

/// What one step did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Joined(JoinReport),
    Mapped {
        column: String,
        mapping: Option<NormalizationMapping>,
    },
    Scored {
        column: String,
        unmatched: usize,
    },
    Filtered(FilterReport),
    /// The step failed without aborting the run; its output column is absent
    Failed {
        code: &'static str,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step: &'static str,
    /// Stream written by the step
    pub stream: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Run report delivered next to the output rows
#[derive(Debug, Clone, Serialize)]
pub struct FusionReport {
    pub run_id: Uuid,
    pub producer: String,
    pub version: String,
    pub computed_at: DateTime<Utc>,
    pub reference_offset: String,
    pub output: String,
    pub output_records: usize,
    pub streams: BTreeMap<String, StreamReport>,
    pub steps: Vec<StepReport>,
    pub warnings: Vec<String>,
}

impl FusionReport {
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }
}

/// Output of one fusion run
#[derive(Debug, Clone)]
pub struct FusionOutput {
    pub stream: Stream,
    pub report: FusionReport,
}

impl FusionOutput {
    /// `{ "rows": [...], "report": {...} }`
    pub fn to_json_value(&self) -> Result<serde_json::Value, FusionError> {
        Ok(serde_json::json!({
            "rows": RowEncoder::to_rows(&self.stream),
            "report": serde_json::to_value(&self.report)?,
        }))
    }
}

/// Configured fusion pipeline
///
/// Holds only the validated configuration; every run starts from fresh inputs.
pub struct FusionPipeline {
    config: FusionConfig,
    clock: ClockNormalizer,
}

impl FusionPipeline {
    /// Validate the configuration and build a pipeline
    pub fn new(config: FusionConfig) -> Result<Self, FusionError> {
        config.validate()?;
        let clock = ClockNormalizer::from_offset(&config.reference_offset)?;
        Ok(Self { config, clock })
    }

    pub fn from_json(json: &str) -> Result<Self, FusionError> {
        Self::new(FusionConfig::from_json(json)?)
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Load, decode, derive, window and filter one input stream
    pub fn prepare_stream(
        &self,
        config: &StreamConfig,
        rows: Vec<JsonRow>,
    ) -> Result<(Stream, StreamReport), FusionError> {
        let codec = TimestampCodec::from_encoding(&config.encoding)?;

        let (raw_rows, load) = StreamLoader::to_raw_rows(rows, config)?;
        let (stream, decode) = self
            .clock
            .canonicalize(&config.name, &config.time_column, raw_rows, &codec);

        let stream = ColumnDeriver::apply(&stream, &config.labels, &config.derive)?;

        let (stream, windowed_out) = match &config.window {
            Some(window) => window.select(&stream),
            None => (stream, 0),
        };

        let (stream, filter) = OutlierFilter::apply(&stream, &config.bounds)?;

        let report = StreamReport {
            load,
            decode,
            windowed_out,
            filter,
            records: stream.len(),
        };
        Ok((stream, report))
    }

    /// Run the full pipeline over raw rows keyed by stream name
    pub fn run(&self, mut inputs: BTreeMap<String, Vec<JsonRow>>) -> Result<FusionOutput, FusionError> {
        let run_id = Uuid::new_v4();
        let mut registry: BTreeMap<String, Stream> = BTreeMap::new();
        let mut streams = BTreeMap::new();
        let mut warnings = Vec::new();

        for config in &self.config.streams {
            let rows = inputs
                .remove(&config.name)
                .ok_or_else(|| FusionError::MissingInput(config.name.clone()))?;
            let (stream, report) = self.prepare_stream(config, rows)?;
            if stream.is_empty() {
                warn!(%run_id, stream = %config.name, "stream is empty after preparation");
                let empty = FusionError::EmptyStream(config.name.clone());
                warnings.push(format!("{}: {}", empty.code(), empty));
            }
            streams.insert(config.name.clone(), report);
            registry.insert(config.name.clone(), stream);
        }

        for name in inputs.keys() {
            warn!(%run_id, stream = %name, "ignoring input for unconfigured stream");
            warnings.push(format!("input '{}' does not match any configured stream", name));
        }

        let mut steps = Vec::with_capacity(self.config.steps.len());
        for (index, step) in self.config.steps.iter().enumerate() {
            let report = run_step(&mut registry, index, step, &mut warnings)?;
            if let StepOutcome::Failed { error, .. } = &report.outcome {
                warn!(%run_id, index, step = report.step, %error, "step failed, continuing");
            }
            steps.push(report);
        }

        let stream = registry
            .remove(&self.config.output)
            .ok_or_else(|| FusionError::UnknownStream(self.config.output.clone()))?;

        info!(
            %run_id,
            output = %self.config.output,
            records = stream.len(),
            steps = steps.len(),
            "fusion run complete"
        );

        let report = FusionReport {
            run_id,
            producer: PRODUCER_NAME.to_string(),
            version: FUSION_VERSION.to_string(),
            computed_at: Utc::now(),
            reference_offset: self.config.reference_offset.clone(),
            output: self.config.output.clone(),
            output_records: stream.len(),
            streams,
            steps,
            warnings,
        };
        Ok(FusionOutput { stream, report })
    }
}

fn lookup<'a>(registry: &'a BTreeMap<String, Stream>, name: &str) -> Result<&'a Stream, FusionError> {
    registry
        .get(name)
        .ok_or_else(|| FusionError::UnknownStream(name.to_string()))
}

/// Turn a recoverable numeric failure into a `Failed` outcome; anything else aborts the run
fn recover(err: FusionError) -> Result<StepOutcome, FusionError> {
    match err {
        FusionError::DegenerateRange { .. } => Ok(StepOutcome::Failed {
            code: err.code(),
            error: err.to_string(),
        }),
        other => Err(other),
    }
}

fn run_step(
    registry: &mut BTreeMap<String, Stream>,
    index: usize,
    step: &StepConfig,
    warnings: &mut Vec<String>,
) -> Result<StepReport, FusionError> {
    let (stream, outcome) = match step {
        StepConfig::Join(join) => {
            let left = apply_skew(lookup(registry, &join.left)?, join.left_skew())?;
            let selected;
            let right = match &join.columns {
                Some(columns) => {
                    selected = lookup(registry, &join.right)?.select(columns)?;
                    &selected
                }
                None => lookup(registry, &join.right)?,
            };
            if left.is_empty() || right.is_empty() {
                warnings.push(format!(
                    "join {} <- {}: {} is empty",
                    join.left,
                    join.right,
                    if left.is_empty() { &join.left } else { &join.right }
                ));
            }
            let options = JoinOptions::new(join.tolerance())
                .with_right_skew(join.right_skew())
                .with_policy(join.unmatched);
            let (joined, report) = TemporalJoiner::join(&left, right, &options)?;
            registry.insert(join.output.clone(), joined.renamed(join.output.clone()));
            (join.output.clone(), StepOutcome::Joined(report))
        }
        StepConfig::Normalize(normalize) => {
            let reference = lookup(registry, &normalize.reference.stream)?;
            let source = lookup(registry, &normalize.source.stream)?;
            let outcome = match RangeNormalizer::normalize_column(
                reference,
                &normalize.reference.column,
                source,
                &normalize.source.column,
                &normalize.output_column,
                normalize.multipliers.as_ref(),
            ) {
                Ok((normalized, mapping)) => {
                    if mapping.is_none() {
                        warnings.push(format!(
                            "'{}' on '{}' has no range to map from; filled with null",
                            normalize.output_column, normalize.source.stream
                        ));
                    }
                    registry.insert(normalize.source.stream.clone(), normalized);
                    StepOutcome::Mapped {
                        column: normalize.output_column.clone(),
                        mapping,
                    }
                }
                Err(err) => recover(err)?,
            };
            (normalize.source.stream.clone(), outcome)
        }
        StepConfig::UnitScale(scale) => {
            let source = lookup(registry, &scale.stream)?;
            let outcome = match RangeNormalizer::unit_scale(source, &scale.column, &scale.output_column) {
                Ok((scaled, mapping)) => {
                    registry.insert(scale.stream.clone(), scaled);
                    StepOutcome::Mapped {
                        column: scale.output_column.clone(),
                        mapping,
                    }
                }
                Err(err) => recover(err)?,
            };
            (scale.stream.clone(), outcome)
        }
        StepConfig::Composite(composite) => {
            let scored = CompositeScoreBuilder::apply(lookup(registry, &composite.stream)?, &composite.spec)?;
            let unmatched = scored
                .iter()
                .filter(|r| r.get(&composite.spec.name).map_or(false, |v| v.is_unmatched()))
                .count();
            registry.insert(composite.stream.clone(), scored);
            (
                composite.stream.clone(),
                StepOutcome::Scored {
                    column: composite.spec.name.clone(),
                    unmatched,
                },
            )
        }
        StepConfig::Filter(filter) => {
            let (filtered, report) = OutlierFilter::apply(lookup(registry, &filter.stream)?, &filter.bounds)?;
            registry.insert(filter.stream.clone(), filtered);
            (filter.stream.clone(), StepOutcome::Filtered(report))
        }
    };

    Ok(StepReport {
        index,
        step: step.kind(),
        stream,
        outcome,
    })
}

/// Run a fusion from a JSON configuration and a JSON object of input rows
/// keyed by stream name, returning `{ "rows": [...], "report": {...} }`
///
/// # Example
/// ```ignore
/// let output = fuse_json(config_json, r#"{ "zepp": [...], "babolat": [...] }"#)?;
/// ```
pub fn fuse_json(config_json: &str, inputs_json: &str) -> Result<String, FusionError> {
    let pipeline = FusionPipeline::from_json(config_json)?;
    let inputs: BTreeMap<String, Vec<JsonRow>> = serde_json::from_str(inputs_json)?;
    let output = pipeline.run(inputs)?;
    Ok(serde_json::to_string(&output.to_json_value()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rows(value: serde_json::Value) -> Vec<JsonRow> {
        serde_json::from_value(value).unwrap()
    }

    fn two_stream_config(steps: serde_json::Value, output: &str) -> FusionConfig {
        let config = json!({
            "streams": [
                {
                    "name": "racket",
                    "time_column": "ms",
                    "encoding": { "kind": "epoch", "units_per_second": 1000 },
                    "bounds": { "acc": { "max": 10000 } }
                },
                {
                    "name": "sensor",
                    "time_column": "ts",
                    "encoding": { "kind": "text", "format": "rfc3339" }
                }
            ],
            "steps": steps,
            "output": output
        });
        serde_json::from_value(config).unwrap()
    }

    fn inputs() -> BTreeMap<String, Vec<JsonRow>> {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "racket".to_string(),
            rows(json!([
                { "ms": 10000, "acc": 1.0, "spin": 0.0 },
                { "ms": 20000, "acc": 2.0, "spin": 100.0 },
                { "ms": 30000, "acc": 3.0, "spin": 50.0 },
                { "ms": 35000, "acc": 20000.0, "spin": 10.0 },
                { "ms": "bogus", "acc": 1.0, "spin": 1.0 }
            ])),
        );
        inputs.insert(
            "sensor".to_string(),
            rows(json!([
                { "ts": "1970-01-01T00:00:11Z", "score": 0.0 },
                { "ts": "1970-01-01T00:00:19Z", "score": 10.0 },
                { "ts": "1970-01-01T00:00:45Z", "score": 5.0 },
                { "ts": "1970-01-01T00:00:50Z", "score": null }
            ])),
        );
        inputs
    }

    #[test]
    fn test_prepare_stream_reports_each_stage() {
        let config = two_stream_config(json!([]), "racket");
        let pipeline = FusionPipeline::new(config.clone()).unwrap();

        let (stream, report) = pipeline
            .prepare_stream(&config.streams[0], inputs().remove("racket").unwrap())
            .unwrap();

        assert_eq!(stream.len(), 3);
        assert_eq!(report.load.rows, 5);
        assert_eq!(report.decode.malformed, 1);
        assert_eq!(report.filter.removed, 1);
        assert_eq!(report.records, 3);
    }

    #[test]
    fn test_run_join_normalize_composite() {
        let config = two_stream_config(
            json!([
                { "step": "normalize",
                  "reference": { "stream": "sensor", "column": "score" },
                  "source": { "stream": "racket", "column": "spin" },
                  "output_column": "spin_norm" },
                { "step": "composite", "stream": "racket", "name": "total",
                  "terms": [ { "column": "spin_norm" }, { "column": "acc" } ] },
                { "step": "join", "left": "racket", "right": "sensor", "output": "merged",
                  "tolerance_ms": 3000 }
            ]),
            "merged",
        );
        let output = FusionPipeline::new(config).unwrap().run(inputs()).unwrap();

        assert_eq!(output.stream.name(), "merged");
        assert_eq!(output.stream.len(), 3);
        let scores: Vec<Option<f64>> = output.stream.iter().map(|r| r.number("score")).collect();
        assert_eq!(scores, vec![Some(0.0), Some(10.0), None]);
        assert_eq!(output.stream.records()[2].get("score"), Some(&Value::Unmatched));
        let norm: Vec<f64> = output.stream.iter().map(|r| r.number("spin_norm").unwrap()).collect();
        assert_eq!(norm, vec![0.0, 10.0, 5.0]);
        assert_eq!(output.stream.records()[1].number("total"), Some(12.0));

        assert_eq!(output.report.streams["sensor"].load.incomplete, 1);
        assert_eq!(output.report.steps.len(), 3);
        match &output.report.steps[2].outcome {
            StepOutcome::Joined(join) => {
                assert_eq!(join.matched, 2);
                assert_eq!(join.unmatched, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(output.report.failed_steps().count(), 0);
    }

    #[test]
    fn test_degenerate_normalization_is_recorded_and_run_continues() {
        let config = two_stream_config(
            json!([
                { "step": "normalize",
                  "reference": { "stream": "sensor", "column": "score" },
                  "source": { "stream": "racket", "column": "spin" },
                  "output_column": "spin_norm" },
                { "step": "filter", "stream": "racket", "bounds": { "spin": { "max": 50 } } }
            ]),
            "racket",
        );
        // flat spin column
        let mut inputs = inputs();
        inputs.insert(
            "racket".to_string(),
            rows(json!([
                { "ms": 1000, "acc": 1.0, "spin": 7.0 },
                { "ms": 2000, "acc": 1.0, "spin": 7.0 }
            ])),
        );

        let output = FusionPipeline::new(config).unwrap().run(inputs).unwrap();

        let failed: Vec<&StepReport> = output.report.failed_steps().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].index, 0);
        match &failed[0].outcome {
            StepOutcome::Failed { code, .. } => assert_eq!(*code, "DEGENERATE_RANGE"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(output.stream.iter().all(|r| r.get("spin_norm").is_none()));
        assert_eq!(output.stream.len(), 2);
    }

    #[test]
    fn test_null_cells_kept_when_incomplete_rows_are_allowed() {
        let mut config = two_stream_config(
            json!([{ "step": "join", "left": "racket", "right": "sensor", "output": "merged", "tolerance_ms": 2000 }]),
            "merged",
        );
        config.streams[1].drop_incomplete = false;
        let mut inputs = inputs();
        inputs.insert(
            "sensor".to_string(),
            rows(json!([
                { "ts": "1970-01-01T00:00:11Z", "score": 0.0 },
                { "ts": "1970-01-01T00:00:29Z", "score": null }
            ])),
        );

        let output = FusionPipeline::new(config).unwrap().run(inputs).unwrap();

        assert_eq!(output.report.streams["sensor"].load.incomplete, 0);
        assert_eq!(output.stream.len(), 3);
        let records = output.stream.records();
        assert_eq!(records[0].number("score"), Some(0.0));
        // nothing within 2 s of 00:20
        assert_eq!(records[1].get("sensor.ts"), Some(&Value::Unmatched));
        // matched, but the sensor row had no score
        assert!(matches!(records[2].get("sensor.ts"), Some(Value::Time(t)) if t.timestamp() == 29));
        assert_eq!(records[2].get("score"), Some(&Value::Unmatched));
        match &output.report.steps[0].outcome {
            StepOutcome::Joined(join) => assert_eq!((join.matched, join.unmatched), (2, 1)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_join_carries_only_selected_right_columns() {
        let config = two_stream_config(
            json!([{ "step": "join", "left": "racket", "right": "sensor", "output": "merged",
                     "tolerance_ms": 2000, "columns": ["score"] }]),
            "merged",
        );
        let mut inputs = inputs();
        inputs.insert(
            "sensor".to_string(),
            rows(json!([
                { "ts": "1970-01-01T00:00:11Z", "score": 4.0, "battery": 80.0 },
                { "ts": "1970-01-01T00:00:19Z", "score": 6.0, "battery": 79.0 }
            ])),
        );

        let output = FusionPipeline::new(config).unwrap().run(inputs).unwrap();

        let first = &output.stream.records()[0];
        assert_eq!(first.number("score"), Some(4.0));
        assert!(first.get("sensor.ts").is_some());
        assert!(output.stream.iter().all(|r| r.get("battery").is_none()));
    }

    #[test]
    fn test_selecting_absent_right_column_is_fatal() {
        let config = two_stream_config(
            json!([{ "step": "join", "left": "racket", "right": "sensor", "output": "merged",
                     "tolerance_ms": 2000, "columns": ["battery"] }]),
            "merged",
        );
        let err = FusionPipeline::new(config).unwrap().run(inputs()).unwrap_err();
        assert!(matches!(err, FusionError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let config = two_stream_config(json!([]), "racket");
        let mut inputs = inputs();
        inputs.remove("sensor");
        let err = FusionPipeline::new(config).unwrap().run(inputs).unwrap_err();
        assert!(matches!(err, FusionError::MissingInput(name) if name == "sensor"));
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let config = two_stream_config(
            json!([{ "step": "composite", "stream": "sensor", "name": "x", "terms": [ { "column": "nope" } ] }]),
            "sensor",
        );
        let err = FusionPipeline::new(config).unwrap().run(inputs()).unwrap_err();
        assert!(matches!(err, FusionError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_empty_stream_warns() {
        let config = two_stream_config(
            json!([{ "step": "join", "left": "racket", "right": "sensor", "output": "merged", "tolerance_ms": 1000 }]),
            "merged",
        );
        let mut inputs = inputs();
        inputs.insert("sensor".to_string(), Vec::new());

        let output = FusionPipeline::new(config).unwrap().run(inputs).unwrap();
        assert_eq!(output.stream.len(), 3);
        assert!(output.report.warnings.iter().any(|w| w == "EMPTY_STREAM: Empty stream: sensor"));
        assert!(output.report.warnings.iter().any(|w| w == "join racket <- sensor: sensor is empty"));
    }

    #[test]
    fn test_fuse_json_output_shape() {
        let config = serde_json::to_string(&two_stream_config(json!([]), "racket")).unwrap();
        let inputs = serde_json::to_string(&inputs()).unwrap();

        let output = fuse_json(&config, &inputs).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["rows"].as_array().unwrap().len(), 3);
        assert_eq!(value["rows"][0]["ms"], "1970-01-01T00:00:10+00:00");
        assert_eq!(value["report"]["producer"], "swing-fusion");
        assert!(value["report"]["run_id"].as_str().is_some());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(FusionPipeline::from_json("not valid json").is_err());
    }
}
