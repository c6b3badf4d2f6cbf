//! Deterministic geometric transforms applied to decoded live frames.
//!
//! Order is fixed: rotate, then landscape crop, then resize. Detection and
//! annotation both work in the post-transform pixel space.

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};

const DEFAULT_LANDSCAPE_ASPECT: f32 = 16.0 / 9.0;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Clockwise rotation in degrees: 0, 90, 180 or 270.
    pub rotate_degrees: u16,
    /// Center-crop portrait frames vertically into landscape.
    pub force_landscape: bool,
    pub output_width: Option<u32>,
    pub output_height: Option<u32>,
}

impl TransformConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rotate_degrees % 90 != 0 || self.rotate_degrees >= 360 {
            anyhow::bail!(
                "rotate_degrees must be one of 0, 90, 180, 270 (got {})",
                self.rotate_degrees
            );
        }
        if self.output_width == Some(0) || self.output_height == Some(0) {
            anyhow::bail!("output dimensions must be greater than zero");
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        self.rotate_degrees == 0
            && !self.force_landscape
            && self.output_width.is_none()
            && self.output_height.is_none()
    }

    fn target_aspect(&self) -> f32 {
        match (self.output_width, self.output_height) {
            (Some(w), Some(h)) if w >= h => w as f32 / h as f32,
            _ => DEFAULT_LANDSCAPE_ASPECT,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FrameTransformer {
    config: TransformConfig,
}

impl FrameTransformer {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    pub fn is_identity(&self) -> bool {
        self.config.is_identity()
    }

    /// Apply the configured transforms, producing a new image.
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let rotated = match self.config.rotate_degrees {
            90 => imageops::rotate90(image),
            180 => imageops::rotate180(image),
            270 => imageops::rotate270(image),
            _ => image.clone(),
        };

        let cropped = if self.config.force_landscape && rotated.height() > rotated.width() {
            landscape_crop(&rotated, self.config.target_aspect())
        } else {
            rotated
        };

        match self.output_size(cropped.width(), cropped.height()) {
            Some((w, h)) if (w, h) != cropped.dimensions() => {
                imageops::resize(&cropped, w, h, FilterType::Triangle)
            }
            _ => cropped,
        }
    }

    fn output_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let scaled = |num: u32, den: u32, by: u32| -> u32 {
            ((by as f64 * num as f64 / den as f64).round() as u32).max(1)
        };
        match (self.config.output_width, self.config.output_height) {
            (Some(w), Some(h)) => Some((w, h)),
            (Some(w), None) => Some((w, scaled(height, width, w))),
            (None, Some(h)) => Some((scaled(width, height, h), h)),
            (None, None) => None,
        }
    }
}

/// Keep the full width and the vertically centered band matching `aspect`.
fn landscape_crop(image: &RgbImage, aspect: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let target_height = ((width as f32 / aspect).round() as u32).clamp(1, height);
    let top = (height - target_height) / 2;
    imageops::crop_imm(image, 0, top, width, target_height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn marked(width: u32, height: u32) -> RgbImage {
        let mut image = RgbImage::new(width, height);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image
    }

    #[test]
    fn identity_is_a_noop() {
        let transformer = FrameTransformer::default();
        let image = marked(8, 4);
        assert!(transformer.is_identity());
        assert_eq!(transformer.apply(&image), image);
    }

    #[test]
    fn rotation_moves_corner_clockwise() {
        let image = marked(8, 4);
        let rotated = FrameTransformer::new(TransformConfig {
            rotate_degrees: 90,
            ..TransformConfig::default()
        })
        .apply(&image);
        assert_eq!(rotated.dimensions(), (4, 8));
        assert_eq!(*rotated.get_pixel(3, 0), Rgb([255, 0, 0]));
    }

    #[test]
    fn portrait_frames_are_cropped_to_landscape() {
        let transformer = FrameTransformer::new(TransformConfig {
            force_landscape: true,
            ..TransformConfig::default()
        });
        let out = transformer.apply(&RgbImage::new(160, 320));
        assert_eq!(out.dimensions(), (160, 90));

        // Landscape input is untouched.
        let out = transformer.apply(&RgbImage::new(320, 160));
        assert_eq!(out.dimensions(), (320, 160));
    }

    #[test]
    fn crop_uses_output_aspect_then_resizes() {
        let transformer = FrameTransformer::new(TransformConfig {
            rotate_degrees: 90,
            force_landscape: true,
            output_width: Some(400),
            output_height: Some(300),
        });
        // 480x640 after rotation, cropped to 480x360, resized to 400x300.
        let out = transformer.apply(&RgbImage::new(640, 480));
        assert_eq!(out.dimensions(), (400, 300));
    }

    #[test]
    fn single_output_dimension_keeps_aspect() {
        let transformer = FrameTransformer::new(TransformConfig {
            output_width: Some(320),
            ..TransformConfig::default()
        });
        assert_eq!(transformer.apply(&RgbImage::new(640, 480)).dimensions(), (320, 240));
    }

    #[test]
    fn invalid_rotation_is_rejected() {
        let config = TransformConfig {
            rotate_degrees: 45,
            ..TransformConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
