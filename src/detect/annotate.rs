//! Drawing detection boxes onto live frames.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use super::glyphs;
use super::result::DetectionSnapshot;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 64]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_HEIGHT: u32 = 16;
const LABEL_SCALE: f32 = 14.0;

/// Renders `model: confidence` labelled boxes. Holds no per-frame state.
///
/// Labels use the built-in bitmap glyphs unless a TTF/OTF font is loaded.
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new() -> Self {
        Self { font: None }
    }

    /// Boxes with text labels rendered in the TTF/OTF font at `path`.
    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read label font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow::anyhow!("invalid label font {}", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    /// Draw every detection in `snapshot` onto a copy of `image`.
    pub fn annotate(&self, image: &RgbImage, snapshot: &DetectionSnapshot) -> RgbImage {
        let mut canvas = image.clone();
        let (width, height) = canvas.dimensions();
        if width == 0 || height == 0 {
            return canvas;
        }
        for detection in &snapshot.detections {
            let x1 = (detection.x1.floor() as u32).min(width - 1);
            let y1 = (detection.y1.floor() as u32).min(height - 1);
            let x2 = (detection.x2.ceil() as u32).clamp(x1 + 1, width);
            let y2 = (detection.y2.ceil() as u32).clamp(y1 + 1, height);
            let rect = Rect::at(x1 as i32, y1 as i32).of_size(x2 - x1, y2 - y1);
            draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
            let label = format!("{}: {:.2}", snapshot.model, detection.confidence);
            match &self.font {
                Some(font) => {
                    // Label tab sits above the box, or inside it at the top edge.
                    let label_y = y1.saturating_sub(LABEL_HEIGHT);
                    let tab_width = (label.len() as u32 * 8).clamp(1, width - x1);
                    let tab = Rect::at(x1 as i32, label_y as i32).of_size(tab_width, LABEL_HEIGHT);
                    draw_filled_rect_mut(&mut canvas, tab, BOX_COLOR);
                    draw_text_mut(
                        &mut canvas,
                        LABEL_TEXT_COLOR,
                        x1 as i32 + 2,
                        label_y as i32 + 1,
                        PxScale::from(LABEL_SCALE),
                        font,
                        &label,
                    );
                }
                None => {
                    let tab_height = glyphs::GLYPH_HEIGHT + 2;
                    let label_y = y1.saturating_sub(tab_height);
                    let tab_width = (glyphs::text_width(&label) + 2).min(width - x1);
                    let tab = Rect::at(x1 as i32, label_y as i32).of_size(tab_width, tab_height);
                    draw_filled_rect_mut(&mut canvas, tab, BOX_COLOR);
                    glyphs::draw_text(&mut canvas, x1 + 1, label_y + 1, &label, LABEL_TEXT_COLOR);
                }
            }
        }
        canvas
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}
