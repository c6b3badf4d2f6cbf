//! MJPEG relay
//!
//! Relays a camera's MJPEG stream to any number of HTTP clients. When the camera
//! is unreachable or stops producing frames, clients keep receiving a paced
//! fallback animation until the camera comes back. Live frames can optionally be
//! rotated/cropped/resized and overlaid with detection boxes computed
//! asynchronously off the frame path.
//!
//! # Module Structure
//!
//! - `frame`: JPEG frame type and the multipart part writer
//! - `ingest`: upstream connection and frame extraction from the byte stream
//! - `fallback`: fallback frames and drift-corrected pacing
//! - `transform`: rotation, landscape crop, resize
//! - `detect`: detection backends, model registry, background pipeline, annotation
//! - `relay`: per-client session state machine
//! - `api`: HTTP server (stream + detection control)
//! - `config`: file/env configuration

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod fallback;
pub mod frame;
pub mod ingest;
pub mod relay;
pub mod transform;

pub use error::RelayError;
pub use fallback::{FallbackBuffer, FramePacer};
pub use frame::Frame;
pub use relay::{Phase, RelayContext, RelaySession, SessionSettings, SessionStats};
pub use transform::{FrameTransformer, TransformConfig};
