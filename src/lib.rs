//! Swing Fusion - temporal alignment and cross-sensor normalization
//!
//! Swing Fusion aligns independently-clocked sensor streams (a racket sensor,
//! a smart racket, a wrist watch) and makes their measurements comparable
//! through a deterministic pipeline: loading → clock normalization → outlier
//! rejection → nearest-time joins → range normalization → composite scores.
//!
//! Every run is described by one immutable [`FusionConfig`]; see
//! [`FusionConfig::example`] for the three-sensor tennis setup.

pub mod clock;
pub mod composite;
pub mod config;
pub mod derive;
pub mod encoder;
pub mod error;
pub mod join;
pub mod loader;
pub mod normalize;
pub mod outlier;
pub mod pipeline;
pub mod types;
pub mod window;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use clock::{apply_skew, ClockNormalizer, TimestampCodec};
pub use composite::{CompositeScoreBuilder, CompositeSpec};
pub use config::FusionConfig;
pub use error::FusionError;
pub use join::{JoinOptions, TemporalJoiner, UnmatchedPolicy};
pub use normalize::{NormalizationMapping, RangeNormalizer};
pub use outlier::{Bound, Bounds, OutlierFilter};
pub use pipeline::{fuse_json, FusionOutput, FusionPipeline, FusionReport};
pub use types::{Record, Stream, Timestamp, Value};

/// Library version embedded in run reports
pub const FUSION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for run reports
pub const PRODUCER_NAME: &str = "swing-fusion";
