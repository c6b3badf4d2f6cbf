use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use mjpeg_relay::detect::{
    Annotator, DetectionPipeline, ModelConfig, ModelRegistry, RawDetection, StubBackend,
};
use mjpeg_relay::ingest::{Upstream, UpstreamReader};
use mjpeg_relay::{
    FallbackBuffer, Frame, FrameTransformer, Phase, RelayContext, RelayError, RelaySession,
    SessionSettings, TransformConfig,
};

/// How a scripted connection behaves once its chunks run out.
#[derive(Clone, Copy)]
enum Tail {
    /// Clean end of stream.
    Eof,
    /// Socket stays open and drips one garbage byte every few milliseconds.
    Trickle,
}

struct ScriptedReader {
    chunks: VecDeque<Vec<u8>>,
    tail: Tail,
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(mut chunk) = self.chunks.pop_front() {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            return Ok(n);
        }
        match self.tail {
            Tail::Eof => Ok(0),
            Tail::Trickle => {
                std::thread::sleep(Duration::from_millis(5));
                buf[0] = 0x42;
                Ok(1)
            }
        }
    }
}

/// Serves one scripted connection per entry, then refuses every later attempt.
struct ScriptedUpstream {
    connections: Mutex<VecDeque<(Vec<u8>, Tail)>>,
}

impl ScriptedUpstream {
    fn new(connections: Vec<(Vec<u8>, Tail)>) -> Self {
        Self {
            connections: Mutex::new(connections.into()),
        }
    }

    fn refusing() -> Self {
        Self::new(Vec::new())
    }
}

impl Upstream for ScriptedUpstream {
    fn open(&self) -> Result<UpstreamReader, RelayError> {
        match self.connections.lock().unwrap().pop_front() {
            Some((bytes, tail)) => {
                // Small chunks so frames straddle reads.
                let chunks = bytes.chunks(97).map(<[u8]>::to_vec).collect();
                Ok(Box::new(ScriptedReader { chunks, tail }))
            }
            None => Err(RelayError::UpstreamUnavailable(
                "connection refused".to_string(),
            )),
        }
    }

    fn describe(&self) -> String {
        "scripted camera".to_string()
    }
}

/// Records each flushed multipart part; fails writes once `limit` parts were delivered.
#[derive(Clone)]
struct RecordingSink {
    parts: Arc<Mutex<Vec<Vec<u8>>>>,
    current: Vec<u8>,
    limit: usize,
}

impl RecordingSink {
    fn new(limit: usize) -> Self {
        Self {
            parts: Arc::new(Mutex::new(Vec::new())),
            current: Vec::new(),
            limit,
        }
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        self.parts
            .lock()
            .unwrap()
            .iter()
            .map(|part| {
                assert!(part.starts_with(header), "malformed part header");
                assert!(part.ends_with(b"\r\n"), "malformed part trailer");
                part[header.len()..part.len() - 2].to_vec()
            })
            .collect()
    }
}

impl Write for RecordingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.parts.lock().unwrap().len() >= self.limit {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
        }
        self.current.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.current.is_empty() {
            self.parts.lock().unwrap().push(std::mem::take(&mut self.current));
        }
        Ok(())
    }
}

fn solid_frame(width: u32, height: u32, shade: u8) -> Frame {
    Frame::encode(&RgbImage::from_pixel(width, height, Rgb([shade, shade, shade])), 90).unwrap()
}

fn live_frames() -> Vec<Frame> {
    (0..3).map(|i| solid_frame(48, 32, 60 + i * 40)).collect()
}

fn camera_bytes(frames: &[Frame]) -> Vec<u8> {
    let mut bytes = b"--camera\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    for frame in frames {
        bytes.extend_from_slice(frame.as_bytes());
        bytes.extend_from_slice(b"\r\n--camera\r\nContent-Type: image/jpeg\r\n\r\n");
    }
    bytes
}

fn fast_settings() -> SessionSettings {
    SessionSettings {
        stall_timeout: Duration::from_millis(80),
        reconnect_delay: Duration::from_millis(100),
        fallback_fps: 50.0,
        jpeg_quality: 80,
    }
}

fn context(
    upstream: ScriptedUpstream,
    fallback: Frame,
    transform: TransformConfig,
    pipeline: Option<Arc<DetectionPipeline>>,
) -> Arc<RelayContext> {
    Arc::new(RelayContext {
        upstream: Arc::new(upstream),
        fallback: Arc::new(FallbackBuffer::from_frames(vec![fallback]).unwrap()),
        transformer: FrameTransformer::new(transform),
        pipeline,
        annotator: Annotator::new(),
        settings: fast_settings(),
        shutdown: Arc::new(AtomicBool::new(false)),
    })
}

fn recorded_transitions(
    session: RelaySession<RecordingSink>,
) -> (RelaySession<RecordingSink>, Arc<Mutex<Vec<(Phase, Phase)>>>) {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    let session = session.with_observer(move |from, to| sink.lock().unwrap().push((from, to)));
    (session, transitions)
}

#[test]
fn live_frames_then_fallback_then_reconnect() {
    let live = live_frames();
    let fallback = solid_frame(48, 32, 0);
    let ctx = context(
        ScriptedUpstream::new(vec![(camera_bytes(&live), Tail::Eof)]),
        fallback.clone(),
        TransformConfig::default(),
        None,
    );
    let sink = RecordingSink::new(12);
    let (session, transitions) = recorded_transitions(RelaySession::new(1, ctx, sink.clone()));

    let stats = session.run();

    let payloads = sink.payloads();
    assert_eq!(payloads.len(), 12);
    // Live frames pass through byte-identical and in order.
    for (payload, frame) in payloads.iter().zip(&live) {
        assert_eq!(payload.as_slice(), frame.as_bytes());
    }
    // Everything after the camera dropped is the fallback animation.
    assert!(payloads[3..].iter().all(|p| p.as_slice() == fallback.as_bytes()));

    assert_eq!(stats.live_frames, 3);
    assert_eq!(stats.fallback_frames, 9);
    assert!(stats.connect_attempts >= 2, "never retried the camera");

    let transitions = transitions.lock().unwrap();
    assert_eq!(transitions[0], (Phase::Connecting, Phase::Streaming));
    assert_eq!(transitions[1], (Phase::Streaming, Phase::Fallback));
    assert!(transitions.contains(&(Phase::Fallback, Phase::Connecting)));
    assert_eq!(transitions.last().map(|t| t.1), Some(Phase::Closed));
}

#[test]
fn stalled_camera_switches_to_fallback_once() {
    let live = live_frames();
    let fallback = solid_frame(48, 32, 0);
    let ctx = context(
        ScriptedUpstream::new(vec![(camera_bytes(&live[..1]), Tail::Trickle)]),
        fallback.clone(),
        TransformConfig::default(),
        None,
    );
    let sink = RecordingSink::new(4);
    let (session, transitions) = recorded_transitions(RelaySession::new(2, ctx, sink.clone()));

    let started = Instant::now();
    let stats = session.run();

    assert_eq!(stats.live_frames, 1);
    assert_eq!(stats.stalls, 1);
    assert!(started.elapsed() >= Duration::from_millis(80));

    let transitions = transitions.lock().unwrap();
    let into_fallback = transitions
        .iter()
        .filter(|t| **t == (Phase::Streaming, Phase::Fallback))
        .count();
    assert_eq!(into_fallback, 1);
    // Streaming is only ever entered from Connecting.
    assert!(transitions
        .iter()
        .filter(|t| t.1 == Phase::Streaming)
        .all(|t| t.0 == Phase::Connecting));
    assert!(transitions.iter().all(|(from, to)| from != to));

    let payloads = sink.payloads();
    assert_eq!(payloads[0].as_slice(), live[0].as_bytes());
    assert!(payloads[1..].iter().all(|p| p.as_slice() == fallback.as_bytes()));
}

#[test]
fn unreachable_camera_serves_paced_fallback() {
    let fallback = solid_frame(48, 32, 0);
    let ctx = context(
        ScriptedUpstream::refusing(),
        fallback,
        TransformConfig::default(),
        None,
    );
    let sink = RecordingSink::new(10);

    let started = Instant::now();
    let stats = RelaySession::new(3, ctx, sink).run();
    let elapsed = started.elapsed();

    assert_eq!(stats.live_frames, 0);
    assert_eq!(stats.fallback_frames, 10);
    assert!(stats.upstream_failures >= 1);
    // 10 frames at 50 fps cannot arrive in a burst.
    assert!(elapsed >= Duration::from_millis(140), "fallback not paced: {:?}", elapsed);
}

#[test]
fn shutdown_closes_a_running_session() {
    let ctx = context(
        ScriptedUpstream::refusing(),
        solid_frame(16, 16, 0),
        TransformConfig::default(),
        None,
    );
    let shutdown = ctx.shutdown.clone();
    let sink = RecordingSink::new(usize::MAX);
    let (session, transitions) = recorded_transitions(RelaySession::new(4, ctx, sink));

    let runner = std::thread::spawn(move || session.run());
    std::thread::sleep(Duration::from_millis(150));
    shutdown.store(true, Ordering::SeqCst);
    let stats = runner.join().unwrap();

    assert!(stats.fallback_frames > 0);
    assert_eq!(transitions.lock().unwrap().last().map(|t| t.1), Some(Phase::Closed));
}

#[test]
fn transformed_frames_feed_detection() {
    let live = live_frames();
    let mut registry = ModelRegistry::new();
    registry.register(
        ModelConfig::new("scripted", 32, 15.0, 1.0, 30.0).unwrap(),
        StubBackend::with_detections(vec![RawDetection {
            x1: 4.0,
            y1: 8.0,
            x2: 20.0,
            y2: 24.0,
            confidence: 0.9,
            class: "thing".to_string(),
        }]),
    );
    let pipeline = Arc::new(DetectionPipeline::new(registry, 2));
    pipeline.enable().unwrap();

    let transform = TransformConfig {
        rotate_degrees: 90,
        output_width: Some(24),
        ..TransformConfig::default()
    };
    let ctx = context(
        ScriptedUpstream::new(vec![(camera_bytes(&live), Tail::Eof)]),
        solid_frame(24, 36, 0),
        transform,
        Some(pipeline.clone()),
    );
    let sink = RecordingSink::new(3);
    let stats = RelaySession::new(5, ctx, sink.clone()).run();
    assert_eq!(stats.live_frames, 3);

    // 48x32 rotated to 32x48, then resized to width 24 keeping aspect.
    for payload in sink.payloads() {
        let decoded = Frame::new(payload).decode().unwrap();
        assert_eq!(decoded.dimensions(), (24, 36));
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    let snapshot = loop {
        if let Some(snapshot) = pipeline.latest() {
            break snapshot;
        }
        assert!(Instant::now() < deadline, "no detection results published");
        std::thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(snapshot.model, "scripted");
    assert_eq!(snapshot.detections.len(), 1);
    let detection = &snapshot.detections[0];
    assert!(detection.x2 <= 24.0 && detection.y2 <= 36.0);

    assert!(pipeline.shutdown(Duration::from_secs(2)));
}

#[test]
fn cached_results_are_drawn_in_output_coordinates() {
    let live = live_frames();
    let mut registry = ModelRegistry::new();
    registry.register(
        ModelConfig::new("scripted", 48, 15.0, 1.0, 30.0).unwrap(),
        StubBackend::with_detections(vec![RawDetection {
            x1: 12.0,
            y1: 8.0,
            x2: 36.0,
            y2: 40.0,
            confidence: 0.9,
            class: "thing".to_string(),
        }]),
    );
    let pipeline = Arc::new(DetectionPipeline::new(registry, 2));
    pipeline.enable().unwrap();
    assert!(pipeline.submit(&RgbImage::new(32, 48)));
    let deadline = Instant::now() + Duration::from_secs(2);
    while pipeline.latest().is_none() {
        assert!(Instant::now() < deadline, "no detection results published");
        std::thread::sleep(Duration::from_millis(10));
    }
    // 32x48 letterboxed into 48x48 sits at offset_x 8, so the box maps to (4,8)-(28,40).
    let snapshot = pipeline.latest().unwrap();
    let d = &snapshot.detections[0];
    assert_eq!((d.x1, d.y1, d.x2, d.y2), (4.0, 8.0, 28.0, 40.0));

    let transform = TransformConfig {
        rotate_degrees: 90,
        ..TransformConfig::default()
    };
    let ctx = context(
        ScriptedUpstream::new(vec![(camera_bytes(&live), Tail::Eof)]),
        solid_frame(32, 48, 0),
        transform,
        Some(pipeline.clone()),
    );
    let sink = RecordingSink::new(3);
    let stats = RelaySession::new(6, ctx, sink.clone()).run();
    assert_eq!(stats.live_frames, 3);

    // Green minus red is near zero on grey and strongly positive on the box outline.
    let greenness = |image: &RgbImage, x: u32, y: u32| {
        let p = image.get_pixel(x, y);
        i32::from(p[1]) - i32::from(p[0])
    };
    for payload in sink.payloads() {
        let decoded = Frame::new(payload).decode().unwrap();
        assert_eq!(decoded.dimensions(), (32, 48));
        for y in [16, 24, 32] {
            let left = (3..=5).map(|x| greenness(&decoded, x, y)).max().unwrap();
            let right = (26..=28).map(|x| greenness(&decoded, x, y)).max().unwrap();
            assert!(left > 40, "left edge missing at y={y}: {left}");
            assert!(right > 40, "right edge missing at y={y}: {right}");
            // Model-space x=12 is inside the output box and stays grey.
            assert!(greenness(&decoded, 12, y) < left / 2);
            assert!(greenness(&decoded, 16, y) < right / 2);
        }
    }

    assert!(pipeline.shutdown(Duration::from_secs(2)));
}
