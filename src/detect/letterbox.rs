//! Aspect-preserving scale-and-pad into a square model input, and the inverse
//! mapping for detections.

use image::imageops::{self, FilterType};
use image::RgbImage;

use super::result::{Detection, RawDetection};

/// Geometry of one letterbox operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl Letterbox {
    /// Compute the geometry for fitting `width`x`height` into a `size`x`size` square.
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let w = width.max(1);
        let h = height.max(1);
        let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
        let (new_w, new_h) = scaled_dims(w, h, scale, size);
        Self {
            scale,
            offset_x: (size - new_w) / 2,
            offset_y: (size - new_h) / 2,
            source_width: width,
            source_height: height,
        }
    }

    /// Map a box from padded input space back to source space.
    ///
    /// Coordinates are clamped to the source bounds; boxes that collapse are dropped.
    pub fn restore(&self, raw: &RawDetection) -> Option<Detection> {
        let w = self.source_width as f32;
        let h = self.source_height as f32;
        let x = |v: f32| ((v - self.offset_x as f32) / self.scale).clamp(0.0, w);
        let y = |v: f32| ((v - self.offset_y as f32) / self.scale).clamp(0.0, h);
        let (x1, y1, x2, y2) = (x(raw.x1), y(raw.y1), x(raw.x2), y(raw.y2));
        if !(x2 > x1 && y2 > y1) {
            return None;
        }
        Some(Detection {
            x1,
            y1,
            x2,
            y2,
            confidence: raw.confidence.clamp(0.0, 1.0),
            class: raw.class.clone(),
        })
    }

    pub fn restore_all(&self, raw: &[RawDetection]) -> Vec<Detection> {
        raw.iter().filter_map(|d| self.restore(d)).collect()
    }
}

fn scaled_dims(width: u32, height: u32, scale: f32, size: u32) -> (u32, u32) {
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    (new_w, new_h)
}

/// Resize `image` into a zero-filled `size`x`size` canvas, centered.
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let geometry = Letterbox::fit(image.width(), image.height(), size);
    let (new_w, new_h) = scaled_dims(
        image.width().max(1),
        image.height().max(1),
        geometry.scale,
        size,
    );
    let mut canvas = RgbImage::new(size, size);
    if (new_w, new_h) == image.dimensions() {
        imageops::replace(
            &mut canvas,
            image,
            geometry.offset_x as i64,
            geometry.offset_y as i64,
        );
    } else {
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
        imageops::replace(
            &mut canvas,
            &resized,
            geometry.offset_x as i64,
            geometry.offset_y as i64,
        );
    }
    (canvas, geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
        RawDetection {
            x1,
            y1,
            x2,
            y2,
            confidence: 0.9,
            class: "person".to_string(),
        }
    }

    /// Forward-map a source box into padded space the way the model would see it.
    fn forward(geometry: &Letterbox, b: (f32, f32, f32, f32)) -> RawDetection {
        let s = geometry.scale;
        let ox = geometry.offset_x as f32;
        let oy = geometry.offset_y as f32;
        raw(b.0 * s + ox, b.1 * s + oy, b.2 * s + ox, b.3 * s + oy)
    }

    #[test]
    fn round_trip_within_a_pixel() {
        let cases = [
            ((640, 480), 320, (100.0, 120.0, 300.0, 360.0)),
            ((1280, 720), 416, (200.0, 100.0, 600.0, 500.0)),
            ((480, 640), 640, (10.0, 33.0, 470.0, 610.0)),
            ((333, 101), 224, (1.0, 2.0, 300.0, 99.0)),
        ];
        for ((w, h), size, b) in cases {
            let geometry = Letterbox::fit(w, h, size);
            let restored = geometry.restore(&forward(&geometry, b)).unwrap();
            for (got, want) in [
                (restored.x1, b.0),
                (restored.y1, b.1),
                (restored.x2, b.2),
                (restored.y2, b.3),
            ] {
                assert!(
                    (got - want).abs() <= 1.0,
                    "{}x{} -> {}: got {} want {}",
                    w,
                    h,
                    size,
                    got,
                    want
                );
            }
        }
    }

    #[test]
    fn geometry_centers_the_short_side() {
        let geometry = Letterbox::fit(640, 480, 320);
        assert_eq!(geometry.scale, 0.5);
        assert_eq!((geometry.offset_x, geometry.offset_y), (0, 40));
    }

    #[test]
    fn boxes_in_padding_are_dropped_and_overflow_is_clamped() {
        let geometry = Letterbox::fit(640, 480, 320);
        // Entirely inside the top padding band.
        assert!(geometry.restore(&raw(10.0, 0.0, 50.0, 30.0)).is_none());
        // Spills past the right and bottom edges.
        let clamped = geometry.restore(&raw(300.0, 200.0, 400.0, 400.0)).unwrap();
        assert_eq!(clamped.x2, 640.0);
        assert_eq!(clamped.y2, 480.0);
        // Inverted box.
        assert!(geometry.restore(&raw(100.0, 100.0, 50.0, 150.0)).is_none());
    }

    #[test]
    fn letterboxed_image_is_padded_with_zeros() {
        let image = RgbImage::from_pixel(64, 32, Rgb([200, 200, 200]));
        let (padded, geometry) = letterbox(&image, 32);
        assert_eq!(padded.dimensions(), (32, 32));
        assert_eq!(geometry.offset_y, 8);
        assert_eq!(*padded.get_pixel(16, 0), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(16, 16), Rgb([200, 200, 200]));
    }
}
