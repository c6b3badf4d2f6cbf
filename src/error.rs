//! Error taxonomy for the relay core.
//!
//! Per-connection upstream errors are recovered by the relay session (it switches
//! to fallback playback); they never reach the downstream client. Detection errors
//! are logged by the pipeline worker and never reach the frame path at all.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Connect, DNS, timeout or mid-stream I/O failure on the upstream camera.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered, but not with something we can relay.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Connection is alive but no complete frame arrived in time.
    #[error("upstream stalled: no frame within {0:?}")]
    StreamStalled(Duration),

    /// External detection capability failed; treated as "no detections this cycle".
    #[error("detection failed: {0}")]
    Detection(String),

    /// The process cannot serve (e.g. no fallback frames could be produced).
    #[error("fatal startup error: {0}")]
    FatalStartup(String),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("no detection model is available")]
    NoActiveModel,

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
