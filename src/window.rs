//! Session window selection

use serde::{Deserialize, Serialize};

use crate::error::FusionError;
use crate::types::{Stream, Timestamp};

/// Inclusive `[start, end]` time window, given as RFC 3339 instants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        if self.start > self.end {
            return Err(FusionError::InvalidConfig(format!(
                "window start {} is after end {}",
                self.start.to_rfc3339(),
                self.end.to_rfc3339()
            )));
        }
        Ok(())
    }

    pub fn contains(&self, t: &Timestamp) -> bool {
        *t >= self.start && *t <= self.end
    }

    /// Keep records inside the window; returns the selection and the number removed
    pub fn select(&self, stream: &Stream) -> (Stream, usize) {
        let lo = stream.records().partition_point(|r| r.time < self.start);
        let hi = stream.records().partition_point(|r| r.time <= self.end);
        let kept = stream.records()[lo..hi.max(lo)].to_vec();
        let removed = stream.len() - kept.len();
        (stream.derive(kept), removed)
    }
}
