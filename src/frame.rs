//! Encoded frames and the downstream multipart framing.
//!
//! - `Frame`: one immutable JPEG image. Cloning is cheap (shared bytes).
//! - `write_part`: writes one frame as a multipart part using the `frame` boundary.
//!
//! The part layout is fixed: `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
//! Viewers and proxies in front of the relay depend on it byte for byte.

use std::io::{self, Write};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

use crate::error::RelayError;

/// Multipart boundary token used on every downstream stream.
pub const MULTIPART_BOUNDARY: &str = "frame";

/// Content type announced to downstream viewers.
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// One encoded JPEG image. Never mutated; transforms produce new frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Arc<[u8]>,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode to packed RGB.
    pub fn decode(&self) -> Result<RgbImage, RelayError> {
        let image = image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)?;
        Ok(image.into_rgb8())
    }

    /// Encode packed RGB as a new JPEG frame.
    pub fn encode(image: &RgbImage, quality: u8) -> Result<Self, RelayError> {
        let mut bytes = Vec::with_capacity(image.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100)).encode_image(image)?;
        Ok(Self::new(bytes))
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Self { data: bytes.into() }
    }
}

/// Write `frame` as one multipart part and flush it to the client.
pub fn write_part<W: Write>(out: &mut W, frame: &Frame) -> io::Result<()> {
    out.write_all(PART_HEADER)?;
    out.write_all(frame.as_bytes())?;
    out.write_all(PART_TRAILER)?;
    out.flush()
}
