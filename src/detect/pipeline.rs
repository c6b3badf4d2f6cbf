//! Asynchronous detection pipeline.
//!
//! Relay sessions hand frames to `submit` and read `latest`; neither ever waits on
//! inference. A single worker thread drains a small FIFO queue, throttles by
//! dropping, runs the active model, and replaces the cached result set.
//!
//! Control operations (enable/disable, model switch, rate changes) are serialized
//! through the pipeline's own locks. Sessions never mutate pipeline state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::Serialize;

use crate::error::RelayError;

use super::letterbox::{letterbox, Letterbox};
use super::registry::{ModelConfig, ModelRegistry};
use super::result::DetectionSnapshot;

/// Default number of frames waiting for the worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// How long the worker blocks on an empty queue before rechecking its stop flag.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

struct PendingFrame {
    image: RgbImage,
    letterbox: Letterbox,
    model: String,
    generation: u64,
}

struct Control {
    active: Option<String>,
    /// Bumped on every model switch; results from older generations are discarded.
    generation: u64,
    rates: HashMap<String, f32>,
}

struct Shared {
    registry: ModelRegistry,
    capacity: usize,
    queue: Mutex<VecDeque<PendingFrame>>,
    queue_ready: Condvar,
    control: Mutex<Control>,
    latest: RwLock<Option<Arc<DetectionSnapshot>>>,
    enabled: AtomicBool,
}

struct Worker {
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    join: JoinHandle<()>,
}

/// Model status as exposed on the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub config: ModelConfig,
    pub current_fps: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub enabled: bool,
    pub active_model: Option<String>,
    pub pending: usize,
    pub models: Vec<ModelStatus>,
}

pub struct DetectionPipeline {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DetectionPipeline {
    /// Build a disabled pipeline. The registry's default model starts active.
    pub fn new(registry: ModelRegistry, capacity: usize) -> Self {
        let rates = registry
            .list()
            .into_iter()
            .map(|m| (m.name, m.default_fps))
            .collect();
        let active = registry.default_model().map(str::to_string);
        Self {
            shared: Arc::new(Shared {
                registry,
                capacity: capacity.max(1),
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Condvar::new(),
                control: Mutex::new(Control {
                    active,
                    generation: 0,
                    rates,
                }),
                latest: RwLock::new(None),
                enabled: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Start the worker if it is not already running.
    pub fn enable(&self) -> Result<(), RelayError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        let active = lock(&self.shared.control).active.clone();
        let active = active.ok_or(RelayError::NoActiveModel)?;
        // Drop frames queued while disabled.
        lock(&self.shared.queue).clear();

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let shared = self.shared.clone();
        let stop_thread = stop.clone();
        let join = std::thread::Builder::new()
            .name("detection-worker".to_string())
            .spawn(move || {
                run_worker(&shared, &stop_thread);
                let _ = done_tx.send(());
            })?;
        *worker = Some(Worker {
            stop,
            done: done_rx,
            join,
        });
        self.shared.enabled.store(true, Ordering::SeqCst);
        log::info!("detection enabled (model {})", active);
        Ok(())
    }

    /// Stop the worker and wait for it. No detection work runs after this returns.
    pub fn disable(&self) {
        let mut worker = lock(&self.worker);
        self.shared.enabled.store(false, Ordering::SeqCst);
        if let Some(worker) = worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            self.shared.queue_ready.notify_all();
            if worker.join.join().is_err() {
                log::error!("detection worker panicked");
            }
            log::info!("detection disabled");
        }
        lock(&self.shared.queue).clear();
        *write(&self.shared.latest) = None;
    }

    /// Stop the worker, waiting at most `timeout`. Returns false if it did not exit in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut worker = lock(&self.worker);
        self.shared.enabled.store(false, Ordering::SeqCst);
        let Some(worker) = worker.take() else {
            return true;
        };
        worker.stop.store(true, Ordering::SeqCst);
        self.shared.queue_ready.notify_all();
        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = worker.join.join();
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "detection worker still busy after {:?}; leaving it behind",
                    timeout
                );
                false
            }
        }
    }

    /// Queue `image` for detection without blocking. Returns false if it was shed.
    ///
    /// The image is letterboxed here, on the caller's thread, to the active
    /// model's input size. A full queue rejects the new frame; older queued
    /// frames are kept.
    pub fn submit(&self, image: &RgbImage) -> bool {
        if lock(&self.shared.queue).len() >= self.shared.capacity {
            return false;
        }
        let (model, generation) = {
            let control = lock(&self.shared.control);
            match &control.active {
                Some(model) => (model.clone(), control.generation),
                None => return false,
            }
        };
        let Some(input_size) = self.shared.registry.config(&model).map(|c| c.input_size) else {
            return false;
        };
        let (padded, geometry) = letterbox(image, input_size);

        let mut queue = lock(&self.shared.queue);
        if queue.len() >= self.shared.capacity {
            return false;
        }
        queue.push_back(PendingFrame {
            image: padded,
            letterbox: geometry,
            model,
            generation,
        });
        drop(queue);
        self.shared.queue_ready.notify_one();
        true
    }

    /// Frames waiting for the worker.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Latest cached result set, if any.
    pub fn latest(&self) -> Option<Arc<DetectionSnapshot>> {
        read(&self.shared.latest).clone()
    }

    pub fn active_model(&self) -> Option<String> {
        lock(&self.shared.control).active.clone()
    }

    /// Make `name` the active model. Cached results are cleared before this returns.
    pub fn switch_model(&self, name: &str) -> Result<(), RelayError> {
        self.shared.registry.backend(name)?;
        let mut control = lock(&self.shared.control);
        control.active = Some(name.to_string());
        control.generation += 1;
        *write(&self.shared.latest) = None;
        drop(control);
        // Queued inputs were letterboxed for the previous model.
        lock(&self.shared.queue).clear();
        log::info!("detection model switched to {}", name);
        Ok(())
    }

    /// Set the inference rate for `model`, clamped to its range. Returns the rate in effect.
    pub fn set_rate(&self, model: &str, fps: f32) -> Result<f32, RelayError> {
        let config = self
            .shared
            .registry
            .config(model)
            .ok_or_else(|| RelayError::UnknownModel(model.to_string()))?;
        let clamped = config.clamp_fps(fps);
        lock(&self.shared.control)
            .rates
            .insert(model.to_string(), clamped);
        if clamped != fps {
            log::info!(
                "detection rate for {} clamped from {} to {} fps",
                model,
                fps,
                clamped
            );
        }
        Ok(clamped)
    }

    pub fn rate(&self, model: &str) -> Result<f32, RelayError> {
        let config = self
            .shared
            .registry
            .config(model)
            .ok_or_else(|| RelayError::UnknownModel(model.to_string()))?;
        Ok(lock(&self.shared.control)
            .rates
            .get(model)
            .copied()
            .unwrap_or(config.default_fps))
    }

    pub fn status(&self) -> PipelineStatus {
        let control = lock(&self.shared.control);
        let models = self
            .shared
            .registry
            .list()
            .into_iter()
            .map(|config| ModelStatus {
                current_fps: control
                    .rates
                    .get(&config.name)
                    .copied()
                    .unwrap_or(config.default_fps),
                config,
            })
            .collect();
        PipelineStatus {
            enabled: self.is_enabled(),
            active_model: control.active.clone(),
            pending: self.pending(),
            models,
        }
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(2));
    }
}

fn run_worker(shared: &Shared, stop: &AtomicBool) {
    let mut last_inference: Option<(String, Instant)> = None;
    while !stop.load(Ordering::SeqCst) {
        let Some(item) = next_pending(shared, stop) else {
            continue;
        };

        let (rate, current) = {
            let control = lock(&shared.control);
            let rate = control.rates.get(&item.model).copied().unwrap_or(1.0);
            (rate, control.generation == item.generation)
        };
        if !current {
            continue;
        }
        let interval = Duration::from_secs_f32(1.0 / rate.max(f32::EPSILON));
        if let Some((model, at)) = &last_inference {
            if *model == item.model && at.elapsed() < interval {
                continue;
            }
        }
        last_inference = Some((item.model.clone(), Instant::now()));

        let raw = match run_backend(shared, &item) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("{}", err);
                continue;
            }
        };
        let detections = item.letterbox.restore_all(&raw);

        let control = lock(&shared.control);
        if control.generation != item.generation {
            continue;
        }
        *write(&shared.latest) = Some(Arc::new(DetectionSnapshot::new(item.model, detections)));
    }
}

fn run_backend(
    shared: &Shared,
    item: &PendingFrame,
) -> Result<Vec<super::result::RawDetection>, RelayError> {
    let backend = shared.registry.backend(&item.model)?;
    let mut guard = backend
        .lock()
        .map_err(|_| RelayError::Detection(format!("backend for {} poisoned", item.model)))?;
    guard
        .detect(&item.image, &item.model)
        .map_err(|e| RelayError::Detection(format!("{} ({}): {:#}", item.model, guard.name(), e)))
}

fn next_pending(shared: &Shared, stop: &AtomicBool) -> Option<PendingFrame> {
    let mut queue = lock(&shared.queue);
    loop {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(item) = queue.pop_front() {
            return Some(item);
        }
        let (guard, timeout) = shared
            .queue_ready
            .wait_timeout(queue, DEQUEUE_TIMEOUT)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queue = guard;
        if timeout.timed_out() {
            return queue.pop_front();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
