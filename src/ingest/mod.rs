//! Upstream ingestion.
//!
//! - `upstream`: opening the camera byte stream (HTTP MJPEG or single JPEG)
//! - `mjpeg`: marker-based frame extraction with stall detection
//!
//! Ingestion produces encoded `Frame`s only; nothing here decodes pixels.

pub mod mjpeg;
pub mod upstream;

pub use mjpeg::{Extracted, FrameExtractor, MjpegParser, MAX_BUFFER_BYTES};
pub use upstream::{HttpUpstream, HttpUpstreamConfig, Upstream, UpstreamReader};
