//! On-demand transcoding relay.
//!
//! ```text
//!  request ─► AdmissionGate ─► Resolve ─► Transcode ─► bounded sink ─► response body
//!                 (slot)       (input)     (output)     (backpressure)
//! ```
//!
//! Each admitted request runs as one job task. The task owns every handle it
//! acquires and gives them back on every exit path; the gate only counts.

pub mod controller;
pub mod gate;
pub mod job;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{RelayController, RelayRequest, RelaySettings, RelayStatus};

/// Failures a relay can report before the response headers are committed.
/// After the headers, failures terminate the body instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid or missing `url` query parameter.")]
    InvalidLocator,
    #[error("Unsupported `bitrate` query parameter {0:?}; use one of 96, 128, 192, 256, 320.")]
    InvalidBitrate(String),
    #[error("Too many conversions in progress, retry shortly.")]
    AtCapacity,
    #[error("source could not be resolved: {0}")]
    Resolution(String),
    #[error("transcoder could not be started: {0}")]
    PipeStart(String),
    #[error("no audio was produced in time")]
    Timeout,
    #[error("transcode failed: {0}")]
    Transcode(String),
    #[error("request cancelled")]
    Cancelled,
}
