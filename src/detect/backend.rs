use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Object-detection capability.
///
/// Backends receive the letterboxed model input (square, zero padded) and report
/// boxes in that image's pixel space. Calls may be slow; they only ever run on
/// the detection worker thread, never on a relay session.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection for `model` on `image`.
    fn detect(&mut self, image: &RgbImage, model: &str) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
