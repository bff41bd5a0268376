//! Clock normalization
//!
//! Decodes each stream's native timestamps into canonical instants expressed
//! in the run's reference UTC offset, and applies per-join clock skew.
//! - Integer epochs with a stream-specific divisor (ms, ns, 1/10000 s ticks)
//! - Wall-clock text with a known source offset
//! - Skew correction kept separate from decoding

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::TimestampEncoding;
use crate::error::FusionError;
use crate::loader::RawRow;
use crate::types::{Record, Stream, Timestamp};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Format keyword selecting RFC 3339 parsing for text timestamps
pub const RFC3339_FORMAT: &str = "rfc3339";

/// Parse a UTC offset such as `UTC`, `Z`, `+00:00`, `-07:00` or `-0700`
pub fn parse_offset(text: &str) -> Result<FixedOffset, FusionError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| FusionError::InvalidTimezone(text.into()));
    }

    let invalid = || FusionError::InvalidTimezone(text.to_string());
    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Validated timestamp decoder/encoder for one stream
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampCodec {
    Epoch {
        units_per_second: i64,
        nanos_per_unit: i64,
    },
    Rfc3339 {
        source: FixedOffset,
    },
    Pattern {
        format: String,
        source: FixedOffset,
    },
}

impl TimestampCodec {
    /// Build a codec from its configuration, rejecting encodings that cannot
    /// decode to an exact nanosecond instant
    pub fn from_encoding(encoding: &TimestampEncoding) -> Result<Self, FusionError> {
        match encoding {
            TimestampEncoding::Epoch { units_per_second } => {
                let units = *units_per_second;
                if units <= 0 || NANOS_PER_SECOND % units != 0 {
                    return Err(FusionError::InvalidConfig(format!(
                        "units_per_second must be a positive divisor of 10^9, got {}",
                        units
                    )));
                }
                Ok(TimestampCodec::Epoch {
                    units_per_second: units,
                    nanos_per_unit: NANOS_PER_SECOND / units,
                })
            }
            TimestampEncoding::Text { format, utc_offset } => {
                let source = parse_offset(utc_offset)?;
                if format.eq_ignore_ascii_case(RFC3339_FORMAT) {
                    Ok(TimestampCodec::Rfc3339 { source })
                } else if format.is_empty() {
                    Err(FusionError::InvalidConfig("text timestamp format must not be empty".into()))
                } else {
                    Ok(TimestampCodec::Pattern {
                        format: format.clone(),
                        source,
                    })
                }
            }
        }
    }

    /// Decode a raw timestamp cell into an instant in `reference`
    pub fn decode(
        &self,
        raw: &serde_json::Value,
        reference: &FixedOffset,
    ) -> Result<Timestamp, FusionError> {
        match self {
            TimestampCodec::Epoch {
                units_per_second,
                nanos_per_unit,
            } => {
                let count = epoch_count(raw)?;
                let seconds = count.div_euclid(*units_per_second);
                let nanos = count.rem_euclid(*units_per_second) * nanos_per_unit;
                DateTime::from_timestamp(seconds, nanos as u32)
                    .map(|dt| dt.with_timezone(reference))
                    .ok_or_else(|| {
                        FusionError::MalformedTimestamp(format!("epoch value {} out of range", count))
                    })
            }
            TimestampCodec::Rfc3339 { .. } => {
                let text = text_value(raw)?;
                DateTime::parse_from_rfc3339(text)
                    .map(|dt| dt.with_timezone(reference))
                    .map_err(|e| FusionError::MalformedTimestamp(format!("'{}': {}", text, e)))
            }
            TimestampCodec::Pattern { format, source } => {
                let text = text_value(raw)?;
                let naive = NaiveDateTime::parse_from_str(text, format).map_err(|e| {
                    FusionError::MalformedTimestamp(format!("'{}' does not match '{}': {}", text, format, e))
                })?;
                source
                    .from_local_datetime(&naive)
                    .single()
                    .map(|dt| dt.with_timezone(reference))
                    .ok_or_else(|| FusionError::MalformedTimestamp(format!("'{}' is not a valid local time", text)))
            }
        }
    }

    /// Re-encode a canonical instant into this codec's native representation
    ///
    /// Fails when the instant does not fit in an `i64` count of epoch units.
    pub fn encode(&self, timestamp: &Timestamp) -> Result<serde_json::Value, FusionError> {
        match self {
            TimestampCodec::Epoch {
                units_per_second,
                nanos_per_unit,
            } => timestamp
                .timestamp()
                .checked_mul(*units_per_second)
                .and_then(|units| {
                    units.checked_add(i64::from(timestamp.timestamp_subsec_nanos()) / nanos_per_unit)
                })
                .map(serde_json::Value::from)
                .ok_or_else(|| {
                    FusionError::MalformedTimestamp(format!(
                        "{} does not fit in an epoch of {} units per second",
                        timestamp.to_rfc3339(),
                        units_per_second
                    ))
                }),
            TimestampCodec::Rfc3339 { source } => {
                Ok(serde_json::Value::from(timestamp.with_timezone(source).to_rfc3339()))
            }
            TimestampCodec::Pattern { format, source } => Ok(serde_json::Value::from(
                timestamp.with_timezone(source).format(format).to_string(),
            )),
        }
    }
}

fn epoch_count(raw: &serde_json::Value) -> Result<i64, FusionError> {
    match raw {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                _ => Err(FusionError::MalformedTimestamp(format!("{} is not an integer epoch", n))),
            }
        }
        serde_json::Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| FusionError::MalformedTimestamp(format!("'{}' is not an integer epoch", s))),
        other => Err(FusionError::MalformedTimestamp(format!("{} is not an integer epoch", other))),
    }
}

fn text_value(raw: &serde_json::Value) -> Result<&str, FusionError> {
    raw.as_str()
        .ok_or_else(|| FusionError::MalformedTimestamp(format!("{} is not a text timestamp", raw)))
}

/// Decode outcome for one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeReport {
    pub decoded: usize,
    pub malformed: usize,
}

/// Converts raw rows into canonical, time-ordered streams
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockNormalizer {
    reference: FixedOffset,
}

impl ClockNormalizer {
    pub fn new(reference: FixedOffset) -> Self {
        Self { reference }
    }

    pub fn from_offset(offset: &str) -> Result<Self, FusionError> {
        Ok(Self::new(parse_offset(offset)?))
    }

    pub fn reference(&self) -> FixedOffset {
        self.reference
    }

    pub fn decode(&self, raw: &serde_json::Value, codec: &TimestampCodec) -> Result<Timestamp, FusionError> {
        codec.decode(raw, &self.reference)
    }

    /// Decode every row, dropping (and counting) rows whose timestamp fails
    ///
    /// The resulting stream is sorted ascending; ties keep input order.
    pub fn canonicalize(
        &self,
        name: &str,
        time_column: &str,
        rows: Vec<RawRow>,
        codec: &TimestampCodec,
    ) -> (Stream, DecodeReport) {
        let mut report = DecodeReport::default();
        let mut records = Vec::with_capacity(rows.len());

        for row in rows {
            match codec.decode(&row.time, &self.reference) {
                Ok(time) => {
                    report.decoded += 1;
                    records.push(Record {
                        time,
                        columns: row.columns,
                    });
                }
                Err(e) => {
                    report.malformed += 1;
                    debug!(stream = name, error = %e, "dropping row with undecodable timestamp");
                }
            }
        }

        if report.malformed > 0 {
            warn!(
                stream = name,
                malformed = report.malformed,
                decoded = report.decoded,
                "rows dropped for malformed timestamps"
            );
        }

        (Stream::new(name, time_column, records), report)
    }
}

/// Shift every timestamp of a stream by a clock-skew correction
///
/// `corrected = decoded - skew`: a sensor whose clock runs 5 s ahead has a
/// skew of +5 s. Ordering is preserved since every record moves equally.
/// Fails when a corrected instant falls outside the representable range.
pub fn apply_skew(stream: &Stream, skew: Duration) -> Result<Stream, FusionError> {
    if skew == Duration::zero() {
        return Ok(stream.clone());
    }
    let records = stream
        .iter()
        .map(|r| {
            let time = r.time.checked_sub_signed(skew).ok_or_else(|| {
                FusionError::InvalidConfig(format!(
                    "skew of {} ms moves {} out of range in stream '{}'",
                    skew.num_milliseconds(),
                    r.time.to_rfc3339(),
                    stream.name()
                ))
            })?;
            Ok(Record {
                time,
                columns: r.columns.clone(),
            })
        })
        .collect::<Result<Vec<_>, FusionError>>()?;
    Ok(stream.derive(records))
}
