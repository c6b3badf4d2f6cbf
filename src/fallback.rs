//! Synthetic fallback playback.
//!
//! - `FallbackBuffer`: placeholder frames generated once at startup, shared read-only.
//! - `FramePacer`: drift-corrected scheduling for fallback playback.

use std::path::Path;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use rand::RngCore;

use crate::error::RelayError;
use crate::frame::Frame;

/// Pre-rendered placeholder frames. Never empty.
#[derive(Debug)]
pub struct FallbackBuffer {
    frames: Vec<Frame>,
}

impl FallbackBuffer {
    /// Render `count` frames of grey static at `width`x`height`.
    ///
    /// Frames that fail to encode are skipped; producing none at all is fatal.
    pub fn generate(count: usize, width: u32, height: u32, quality: u8) -> Result<Self, RelayError> {
        if count == 0 || width == 0 || height == 0 {
            return Err(RelayError::FatalStartup(format!(
                "fallback geometry {}x{} x{} frames is empty",
                width, height, count
            )));
        }
        let mut rng = rand::thread_rng();
        let mut noise = vec![0u8; width as usize * height as usize];
        let mut frames = Vec::with_capacity(count);
        for index in 0..count {
            rng.fill_bytes(&mut noise);
            let image = RgbImage::from_fn(width, height, |x, y| {
                let v = noise[y as usize * width as usize + x as usize];
                Rgb([v, v, v])
            });
            match Frame::encode(&image, quality) {
                Ok(frame) => frames.push(frame),
                Err(err) => log::warn!("fallback frame {} failed to encode: {}", index, err),
            }
        }
        Self::from_frames(frames)
    }

    /// Load a single placeholder JPEG from disk.
    pub fn from_image_file(path: &Path) -> Result<Self, RelayError> {
        let bytes = std::fs::read(path).map_err(|e| {
            RelayError::FatalStartup(format!(
                "fallback image not readable at {}: {}",
                path.display(),
                e
            ))
        })?;
        let frame = Frame::new(bytes);
        frame.decode().map_err(|e| {
            RelayError::FatalStartup(format!(
                "fallback image {} is not a usable JPEG: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_frames(vec![frame])
    }

    pub fn from_frames(frames: Vec<Frame>) -> Result<Self, RelayError> {
        if frames.is_empty() {
            return Err(RelayError::FatalStartup(
                "no fallback frames could be produced".to_string(),
            ));
        }
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame at `cursor mod len`, and the cursor to use next time.
    pub fn next(&self, cursor: usize) -> (&Frame, usize) {
        let index = cursor % self.frames.len();
        (&self.frames[index], (index + 1) % self.frames.len())
    }
}

/// Maximum lag, in frame intervals, before the pacer gives up catching up.
const MAX_LAG_INTERVALS: u32 = 4;

/// Schedules frames at a fixed rate against ideal send times.
///
/// Each due time is the previous due time plus one interval, so time spent
/// encoding or writing a frame does not push later frames back.
#[derive(Clone, Debug)]
pub struct FramePacer {
    interval: Duration,
    next_due: Instant,
}

impl FramePacer {
    /// First frame is due at `start`.
    pub fn new(fps: f32, start: Instant) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 1.0 };
        Self {
            interval: Duration::from_secs_f32(1.0 / fps),
            next_due: start,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long to wait from `now` until the next frame is due. Advances the schedule.
    pub fn wait(&mut self, now: Instant) -> Duration {
        let due = self.next_due;
        if now > due + self.interval * MAX_LAG_INTERVALS {
            self.next_due = now + self.interval;
            return Duration::ZERO;
        }
        self.next_due = due + self.interval;
        due.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_decodable_frames() {
        let buffer = FallbackBuffer::generate(3, 32, 24, 70).unwrap();
        assert_eq!(buffer.len(), 3);
        let (first, _) = buffer.next(0);
        let (second, _) = buffer.next(1);
        assert_ne!(first, second);
        assert_eq!(first.decode().unwrap().dimensions(), (32, 24));
    }

    #[test]
    fn empty_geometry_is_fatal() {
        assert!(matches!(
            FallbackBuffer::generate(0, 32, 24, 70),
            Err(RelayError::FatalStartup(_))
        ));
        assert!(matches!(
            FallbackBuffer::from_frames(Vec::new()),
            Err(RelayError::FatalStartup(_))
        ));
    }

    #[test]
    fn cursor_wraps() {
        let frames = (0..3u8).map(|i| Frame::new(vec![i])).collect();
        let buffer = FallbackBuffer::from_frames(frames).unwrap();
        let mut cursor = 0;
        let mut seen = Vec::new();
        for _ in 0..7 {
            let (frame, next) = buffer.next(cursor);
            seen.push(frame.as_bytes()[0]);
            cursor = next;
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(buffer.next(10).0.as_bytes(), &[1]);
    }

    #[test]
    fn unreadable_fallback_image_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("fallback.jpg");
        assert!(matches!(
            FallbackBuffer::from_image_file(&missing),
            Err(RelayError::FatalStartup(_))
        ));

        std::fs::write(&missing, b"not a jpeg").unwrap();
        assert!(matches!(
            FallbackBuffer::from_image_file(&missing),
            Err(RelayError::FatalStartup(_))
        ));
    }

    /// Simulated clock: emits frames while `now < start + window`, adding `jitter`
    /// after every sleep the way a busy scheduler would.
    fn frames_in_window(fps: f32, window: Duration, jitter: Duration) -> usize {
        let start = Instant::now();
        let end = start + window;
        let mut pacer = FramePacer::new(fps, start);
        let mut now = start;
        let mut emitted = 0;
        loop {
            let wait = pacer.wait(now);
            if now + wait >= end {
                break;
            }
            now += wait + jitter;
            emitted += 1;
        }
        emitted
    }

    #[test]
    fn pacing_holds_rate_under_jitter() {
        for fps in [5.0f32, 15.0, 30.0] {
            let interval = Duration::from_secs_f32(1.0 / fps);
            for jitter in [Duration::ZERO, interval / 4, interval / 2] {
                let window = Duration::from_secs(3);
                let expected = window.as_secs_f32() * fps;
                let emitted = frames_in_window(fps, window, jitter) as f32;
                assert!(
                    (emitted - expected).abs() <= 1.0,
                    "fps {} jitter {:?}: {} frames, expected {}",
                    fps,
                    jitter,
                    emitted,
                    expected
                );
            }
        }
    }

    #[test]
    fn pacer_resyncs_after_long_hiccup() {
        let start = Instant::now();
        let mut pacer = FramePacer::new(10.0, start);
        assert_eq!(pacer.wait(start), Duration::ZERO);
        let late = start + Duration::from_secs(2);
        assert_eq!(pacer.wait(late), Duration::ZERO);
        // No burst: the next frame is one interval after the hiccup.
        assert_eq!(pacer.wait(late), pacer.interval());
    }
}
