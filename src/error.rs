//! Error types for Swing Fusion

use thiserror::Error;

/// Errors that can occur while aligning and normalizing sensor streams
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("Malformed timestamp: {0}")]
    MalformedTimestamp(String),

    #[error("Degenerate range for column '{column}': min == max == {value}")]
    DegenerateRange { column: String, value: f64 },

    #[error("Empty stream: {0}")]
    EmptyStream(String),

    #[error("Schema mismatch in stream '{stream}': {detail}")]
    SchemaMismatch { stream: String, detail: String },

    #[error("Invalid timezone offset: {0}")]
    InvalidTimezone(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("No input rows supplied for stream '{0}'")]
    MissingInput(String),

    #[error("Failed to parse stream rows: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl FusionError {
    pub(crate) fn schema(stream: &str, detail: impl Into<String>) -> Self {
        FusionError::SchemaMismatch {
            stream: stream.to_string(),
            detail: detail.into(),
        }
    }

    /// Short machine-readable code used by the CLI and FFI error payloads
    pub fn code(&self) -> &'static str {
        match self {
            FusionError::MalformedTimestamp(_) => "MALFORMED_TIMESTAMP",
            FusionError::DegenerateRange { .. } => "DEGENERATE_RANGE",
            FusionError::EmptyStream(_) => "EMPTY_STREAM",
            FusionError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            FusionError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            FusionError::InvalidConfig(_) => "INVALID_CONFIG",
            FusionError::UnknownStream(_) => "UNKNOWN_STREAM",
            FusionError::MissingInput(_) => "MISSING_INPUT",
            FusionError::ParseError(_) => "PARSE_ERROR",
            FusionError::JsonError(_) => "JSON_ERROR",
        }
    }
}
