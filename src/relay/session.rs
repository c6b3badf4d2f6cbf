use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::{Annotator, DetectionPipeline};
use crate::error::RelayError;
use crate::fallback::{FallbackBuffer, FramePacer};
use crate::frame::{write_part, Frame};
use crate::ingest::{Extracted, FrameExtractor, Upstream, UpstreamReader};
use crate::transform::FrameTransformer;

/// Timing and encoding knobs shared by every session.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// No complete frame for this long means the upstream has stalled.
    pub stall_timeout: Duration,
    /// How long fallback plays before the next connection attempt.
    pub reconnect_delay: Duration,
    pub fallback_fps: f32,
    /// Quality for frames that had to be re-encoded (transformed or annotated).
    pub jpeg_quality: u8,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_millis(2500),
            reconnect_delay: Duration::from_secs(1),
            fallback_fps: 15.0,
            jpeg_quality: 80,
        }
    }
}

/// Everything sessions share. Read-only from a session's point of view.
pub struct RelayContext {
    pub upstream: Arc<dyn Upstream>,
    pub fallback: Arc<FallbackBuffer>,
    pub transformer: FrameTransformer,
    pub pipeline: Option<Arc<DetectionPipeline>>,
    pub annotator: Annotator,
    pub settings: SessionSettings,
    /// Process-wide stop signal.
    pub shutdown: Arc<AtomicBool>,
}

/// Observable session phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Streaming,
    Fallback,
    Closed,
}

/// Counters reported when a session closes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connect_attempts: u64,
    pub live_frames: u64,
    pub fallback_frames: u64,
    pub stalls: u64,
    pub upstream_failures: u64,
}

enum State {
    Connecting,
    Streaming(FrameExtractor<UpstreamReader>),
    Fallback,
    Closed,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Connecting => Phase::Connecting,
            State::Streaming(_) => Phase::Streaming,
            State::Fallback => Phase::Fallback,
            State::Closed => Phase::Closed,
        }
    }
}

type Observer = Box<dyn FnMut(Phase, Phase) + Send>;

/// One downstream client's relay state machine.
///
/// `Connecting -> Streaming -> Fallback -> Connecting -> ...`, with `Closed`
/// reachable from anywhere once the client goes away or the process stops.
pub struct RelaySession<W> {
    id: u64,
    ctx: Arc<RelayContext>,
    sink: W,
    cursor: usize,
    stats: SessionStats,
    observer: Option<Observer>,
}

impl<W: Write> RelaySession<W> {
    pub fn new(id: u64, ctx: Arc<RelayContext>, sink: W) -> Self {
        Self {
            id,
            ctx,
            sink,
            cursor: 0,
            stats: SessionStats::default(),
            observer: None,
        }
    }

    /// Called with `(from, to)` on every phase change.
    pub fn with_observer(mut self, observer: impl FnMut(Phase, Phase) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Drive the session until the client disconnects or the process stops.
    pub fn run(mut self) -> SessionStats {
        let mut state = State::Connecting;
        loop {
            let from = state.phase();
            let next = match state {
                State::Closed => break,
                _ if self.stopping() => State::Closed,
                State::Connecting => self.connect(),
                State::Streaming(extractor) => self.stream(extractor),
                State::Fallback => self.play_fallback(),
            };
            let to = next.phase();
            if from != to {
                log::debug!("session {}: {:?} -> {:?}", self.id, from, to);
                if let Some(observer) = self.observer.as_mut() {
                    observer(from, to);
                }
            }
            state = next;
        }
        log::info!(
            "session {}: closed (live={} fallback={} connects={} stalls={})",
            self.id,
            self.stats.live_frames,
            self.stats.fallback_frames,
            self.stats.connect_attempts,
            self.stats.stalls
        );
        self.stats
    }

    fn stopping(&self) -> bool {
        self.ctx.shutdown.load(Ordering::SeqCst)
    }

    fn connect(&mut self) -> State {
        self.stats.connect_attempts += 1;
        match self.ctx.upstream.open() {
            Ok(reader) => {
                log::info!(
                    "session {}: streaming from {}",
                    self.id,
                    self.ctx.upstream.describe()
                );
                State::Streaming(FrameExtractor::new(reader, self.ctx.settings.stall_timeout))
            }
            Err(err) => {
                self.stats.upstream_failures += 1;
                log::warn!(
                    "session {}: {} unavailable ({}); streaming fallback",
                    self.id,
                    self.ctx.upstream.describe(),
                    err
                );
                State::Fallback
            }
        }
    }

    fn stream(&mut self, mut extractor: FrameExtractor<UpstreamReader>) -> State {
        loop {
            if self.stopping() {
                return State::Closed;
            }
            match extractor.next_frame() {
                Extracted::Frame(frame) => {
                    let frame = match self.prepare_live(frame) {
                        Ok(frame) => frame,
                        Err(err) => {
                            log::debug!("session {}: dropping live frame: {}", self.id, err);
                            continue;
                        }
                    };
                    if !self.emit(&frame) {
                        return State::Closed;
                    }
                    extractor.mark_progress();
                    self.stats.live_frames += 1;
                }
                Extracted::Stalled => {
                    self.stats.stalls += 1;
                    log::warn!(
                        "session {}: {}; streaming fallback",
                        self.id,
                        RelayError::StreamStalled(self.ctx.settings.stall_timeout)
                    );
                    return State::Fallback;
                }
                Extracted::Failed(err) => {
                    self.stats.upstream_failures += 1;
                    log::warn!("session {}: {}; streaming fallback", self.id, err);
                    return State::Fallback;
                }
            }
        }
    }

    /// Transform, feed detection, and overlay the latest cached results.
    fn prepare_live(&self, frame: Frame) -> Result<Frame, RelayError> {
        let pipeline = self.ctx.pipeline.as_deref().filter(|p| p.is_enabled());
        let transformer = &self.ctx.transformer;
        if transformer.is_identity() && pipeline.is_none() {
            return Ok(frame);
        }

        let decoded = frame.decode()?;
        let image = if transformer.is_identity() {
            decoded
        } else {
            transformer.apply(&decoded)
        };
        let quality = self.ctx.settings.jpeg_quality;

        let Some(pipeline) = pipeline else {
            return Frame::encode(&image, quality);
        };
        pipeline.submit(&image);
        match pipeline.latest() {
            Some(snapshot) if !snapshot.detections.is_empty() => {
                Frame::encode(&self.ctx.annotator.annotate(&image, &snapshot), quality)
            }
            _ if transformer.is_identity() => Ok(frame),
            _ => Frame::encode(&image, quality),
        }
    }

    fn play_fallback(&mut self) -> State {
        let buffer = self.ctx.fallback.clone();
        let start = Instant::now();
        let window_end = start + self.ctx.settings.reconnect_delay;
        let mut pacer = FramePacer::new(self.ctx.settings.fallback_fps, start);
        loop {
            if self.stopping() {
                return State::Closed;
            }
            let now = Instant::now();
            let wait = pacer.wait(now);
            if now + wait >= window_end {
                return State::Connecting;
            }
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            let (frame, next) = buffer.next(self.cursor);
            self.cursor = next;
            if !self.emit(frame) {
                return State::Closed;
            }
            self.stats.fallback_frames += 1;
        }
    }

    /// Returns false once the client is gone.
    fn emit(&mut self, frame: &Frame) -> bool {
        match write_part(&mut self.sink, frame) {
            Ok(()) => true,
            Err(err) => {
                log::info!("session {}: client disconnected ({})", self.id, err);
                false
            }
        }
    }
}
