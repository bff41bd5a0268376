use chrono::{Duration, TimeZone};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;

use swing_fusion::encoder::RowEncoder;
use swing_fusion::loader::JsonRow;
use swing_fusion::pipeline::StepOutcome;
use swing_fusion::{fuse_json, FusionConfig, FusionPipeline, Value};

const T0: i64 = 1_718_200_000;

fn rows(value: serde_json::Value) -> Vec<JsonRow> {
    serde_json::from_value(value).unwrap()
}

fn close(actual: Option<f64>, expected: f64) -> bool {
    actual.map_or(false, |v| (v - expected).abs() < 1e-9)
}

fn zepp_row(k: i64, swing_type: i64, side: i64, spin: f64, speed: f64, x: f64, y: f64, acc: f64, gyro: f64) -> serde_json::Value {
    json!({
        "l_id": (T0 + 10 * k) * 1000,
        "swing_type": swing_type,
        "swing_side": side,
        "ball_spin": spin,
        "racket_speed": speed,
        "impact_position_x": x,
        "impact_position_y": y,
        "dbg_acc_1": acc,
        "dbg_acc_3": 150.0,
        "dbg_gyro_1": gyro
    })
}

/// Racket sensor in epoch ms, smart racket in 1/10000 s running 5 s ahead,
/// watch in epoch ns running 1 s behind.
fn inputs() -> BTreeMap<String, Vec<JsonRow>> {
    let mut zepp = vec![
        zepp_row(0, 3, 0, 10.0, 50.0, 0.5, -1.0, 100.0, 1000.0),
        zepp_row(1, 2, 0, 30.0, 70.0, 1.0, 1.0, 300.0, 3000.0),
        zepp_row(2, 1, 1, 20.0, 60.0, 0.0, 0.0, 200.0, 2000.0),
        // accelerometer glitch
        zepp_row(3, 2, 1, 25.0, 65.0, 0.2, 0.1, 15000.0, 2500.0),
    ];
    let mut incomplete = zepp_row(4, 2, 0, 0.0, 55.0, 0.0, 0.0, 120.0, 1200.0);
    incomplete["ball_spin"] = serde_json::Value::Null;
    zepp.push(incomplete);

    let babolat_row = |k: i64, speed: f64, style: f64, effect: f64| {
        json!({
            "time": (T0 + 10 * k + 5) * 10_000 + 2_000,
            "SpeedScore": speed,
            "StyleScore": style,
            "EffectScore": effect
        })
    };
    let babolat = vec![
        babolat_row(0, 6.0, 5.0, 4.0),
        babolat_row(0, 6.0, 5.0, 4.0),
        babolat_row(1, 8.0, 3.0, 9.0),
        babolat_row(2, 7.0, 4.0, 6.0),
    ];

    let watch: Vec<serde_json::Value> = [-1.0, 0.5, 2.0, 1.0]
        .iter()
        .enumerate()
        .map(|(k, ax)| {
            json!({
                "time": (T0 + 10 * k as i64 - 1) * 1_000_000_000 + 300_000_000,
                "accelerationX": ax,
                "AVGHR": 120.0 + k as f64
            })
        })
        .collect();

    let mut inputs = BTreeMap::new();
    inputs.insert("zepp".to_string(), rows(json!(zepp)));
    inputs.insert("babolat".to_string(), rows(json!(babolat)));
    inputs.insert("watch".to_string(), rows(json!(watch)));
    inputs
}

#[test]
fn test_example_config_fuses_three_sensors() {
    let pipeline = FusionPipeline::new(FusionConfig::example().unwrap()).unwrap();
    let output = pipeline.run(inputs()).unwrap();

    // one output record per watch sample
    assert_eq!(output.stream.name(), "merged");
    assert_eq!(output.stream.len(), 4);

    let reference = chrono::FixedOffset::west_opt(7 * 3600).unwrap();
    let first = &output.stream.records()[0];
    assert_eq!(
        first.time,
        reference.timestamp_opt(T0, 0).unwrap() + Duration::milliseconds(300)
    );
    assert_eq!(first.time.offset().local_minus_utc(), -7 * 3600);

    // racket side: labels, derived columns, normalization and score
    assert_eq!(first.category("stroke"), Some("SERVEFH"));
    assert_eq!(first.number("PIQ"), Some(15.0));
    assert_eq!(first.number("ZIQspin"), Some(4.0));
    assert_eq!(first.number("ZIQspeed"), Some(6.0));
    assert!(close(first.number("ZIQpos"), 3.5));
    assert!(close(first.number("ZIQ"), 13.5 * 0.9));
    assert!(matches!(first.get("racket.l_id"), Some(Value::Time(_))));
    assert!(matches!(first.get("babolat.time"), Some(Value::Time(_))));

    let second = &output.stream.records()[1];
    assert_eq!(second.category("stroke"), Some("TOPSPINFH"));
    assert_eq!(second.number("ZIQspin"), Some(18.0));
    assert!(close(second.number("ZIQ"), 8.0 * 1.6 + 18.0 + 3.0));

    // the last watch sample is 10.3 s from the nearest surviving swing
    let last = &output.stream.records()[3];
    assert_eq!(last.get("ZIQ"), Some(&Value::Unmatched));
    assert_eq!(last.get("stroke"), Some(&Value::Unmatched));
    assert_eq!(last.number("AVGHR"), Some(123.0));

    // watch acceleration in the racket accelerometer and gyro ranges
    let acc: Vec<Option<f64>> = output.stream.iter().map(|r| r.number("AccXNorm1")).collect();
    assert_eq!(acc[0], Some(100.0));
    assert_eq!(acc[2], Some(300.0));
    let gyro: Vec<Option<f64>> = output.stream.iter().map(|r| r.number("Gyro1Norm1")).collect();
    assert_eq!(gyro[0], Some(1000.0));
    assert_eq!(gyro[2], Some(3000.0));

    let report = &output.report;
    assert_eq!(report.streams["zepp"].load.incomplete, 1);
    assert_eq!(report.streams["zepp"].filter.removed, 1);
    assert_eq!(report.streams["zepp"].records, 3);
    assert_eq!(report.streams["babolat"].load.duplicates, 1);
    assert_eq!(report.streams["watch"].decode.malformed, 0);
    assert_eq!(report.steps.len(), 9);
    assert_eq!(report.failed_steps().count(), 0);
    assert!(report.warnings.is_empty());

    let joins: Vec<(usize, usize)> = report
        .steps
        .iter()
        .filter_map(|s| match &s.outcome {
            StepOutcome::Joined(j) => Some((j.matched, j.unmatched)),
            _ => None,
        })
        .collect();
    assert_eq!(joins, vec![(3, 0), (3, 1)]);
}

#[test]
fn test_encoded_rows_use_reference_offset_and_null() {
    let pipeline = FusionPipeline::new(FusionConfig::example().unwrap()).unwrap();
    let output = pipeline.run(inputs()).unwrap();

    let rows = RowEncoder::to_rows(&output.stream);
    assert_eq!(rows[0]["time"], "2024-06-12T06:46:40.300-07:00");
    assert!(rows[3]["ZIQ"].is_null());
    assert_eq!(rows[0]["stroke"], "SERVEFH");
}

#[test]
fn test_fuse_json_matches_pipeline_run() {
    let config = FusionConfig::example().unwrap().to_json_pretty().unwrap();
    let inputs_json = serde_json::to_string(&inputs()).unwrap();

    let output: serde_json::Value = serde_json::from_str(&fuse_json(&config, &inputs_json).unwrap()).unwrap();
    let direct = FusionPipeline::new(FusionConfig::example().unwrap())
        .unwrap()
        .run(inputs())
        .unwrap();

    let rows = output["rows"].as_array().unwrap();
    assert_eq!(rows.len(), direct.stream.len());
    assert_eq!(
        serde_json::Value::Array(rows.clone()),
        serde_json::to_value(RowEncoder::to_rows(&direct.stream)).unwrap()
    );
    assert_eq!(output["report"]["output"], "merged");
    assert_eq!(output["report"]["reference_offset"], "-07:00");
}

#[test]
fn test_unknown_step_stream_rejected_before_data() {
    let mut config = FusionConfig::example().unwrap();
    config.output = "nowhere".to_string();
    assert!(FusionPipeline::new(config).is_err());
}
