use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

const DEFAULT_PIXEL_THRESHOLD: u8 = 30;
const DEFAULT_MIN_CHANGED_FRACTION: f32 = 0.002;

/// CPU motion backend: differences consecutive inputs and boxes the changed region.
pub struct MotionBackend {
    previous: Option<Vec<u8>>,
    pixel_threshold: u8,
    min_changed_fraction: f32,
}

impl MotionBackend {
    pub fn new() -> Self {
        Self {
            previous: None,
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
            min_changed_fraction: DEFAULT_MIN_CHANGED_FRACTION,
        }
    }
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn luma(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .map(|p| ((p[0] as u32 * 77 + p[1] as u32 * 150 + p[2] as u32 * 29) >> 8) as u8)
        .collect()
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, image: &RgbImage, _model: &str) -> Result<Vec<RawDetection>> {
        let current = luma(image);
        let previous = self.previous.replace(current);
        let (Some(previous), Some(current)) = (previous, self.previous.as_ref()) else {
            return Ok(Vec::new());
        };
        if previous.len() != current.len() {
            return Ok(Vec::new());
        }

        let width = image.width() as usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        let mut changed = 0usize;
        for (index, (a, b)) in previous.iter().zip(current.iter()).enumerate() {
            if a.abs_diff(*b) < self.pixel_threshold {
                continue;
            }
            changed += 1;
            let (x, y) = (index % width, index / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let fraction = changed as f32 / current.len().max(1) as f32;
        if changed == 0 || fraction < self.min_changed_fraction {
            return Ok(Vec::new());
        }
        let area = ((max_x - min_x + 1) * (max_y - min_y + 1)) as f32;
        Ok(vec![RawDetection {
            x1: min_x as f32,
            y1: min_y as f32,
            x2: (max_x + 1) as f32,
            y2: (max_y + 1) as f32,
            // Density of change inside the box.
            confidence: (changed as f32 / area).clamp(0.0, 1.0),
            class: "motion".to_string(),
        }])
    }
}
