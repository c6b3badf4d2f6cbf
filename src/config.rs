use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{Annotator, ModelConfig, ModelRegistry, MotionBackend, StubBackend};
use crate::fallback::FallbackBuffer;
use crate::ingest::HttpUpstreamConfig;
use crate::relay::SessionSettings;
use crate::transform::TransformConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_UPSTREAM_URL: &str = "http://192.168.4.1/stream";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_STALL_TIMEOUT_MS: u64 = 2_500;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_FALLBACK_FRAMES: usize = 30;
const DEFAULT_FALLBACK_WIDTH: u32 = 640;
const DEFAULT_FALLBACK_HEIGHT: u32 = 480;
const DEFAULT_FALLBACK_FPS: f32 = 15.0;
const DEFAULT_FALLBACK_QUALITY: u8 = 70;
const DEFAULT_OUTPUT_QUALITY: u8 = 80;
const DEFAULT_QUEUE_CAPACITY: usize = 2;

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    listen_addr: Option<String>,
    upstream: Option<UpstreamConfigFile>,
    fallback: Option<FallbackConfigFile>,
    transform: Option<TransformConfig>,
    detection: Option<DetectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct UpstreamConfigFile {
    url: Option<String>,
    connect_timeout_ms: Option<u64>,
    stall_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FallbackConfigFile {
    frames: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f32>,
    reconnect_delay_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    image_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    enabled: Option<bool>,
    model: Option<String>,
    queue_capacity: Option<usize>,
    jpeg_quality: Option<u8>,
    font_path: Option<PathBuf>,
    models: Option<Vec<ModelSpec>>,
}

/// Which backend serves a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Motion,
    Stub,
    Tract,
}

/// One configured detection model.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub display_name: Option<String>,
    pub backend: BackendKind,
    /// ONNX file for `tract` models.
    pub model_path: Option<PathBuf>,
    pub labels: Option<Vec<String>>,
    pub confidence_threshold: Option<f32>,
    pub input_size: u32,
    pub default_fps: f32,
    pub min_fps: f32,
    pub max_fps: f32,
}

impl ModelSpec {
    fn model_config(&self) -> Result<ModelConfig> {
        let config = ModelConfig::new(
            self.name.clone(),
            self.input_size,
            self.default_fps,
            self.min_fps,
            self.max_fps,
        )?;
        Ok(match &self.display_name {
            Some(display_name) => config.with_display_name(display_name.clone()),
            None => config,
        })
    }
}

fn default_models() -> Vec<ModelSpec> {
    vec![ModelSpec {
        name: "motion".to_string(),
        display_name: Some("Motion".to_string()),
        backend: BackendKind::Motion,
        model_path: None,
        labels: None,
        confidence_threshold: None,
        input_size: 320,
        default_fps: 5.0,
        min_fps: 1.0,
        max_fps: 15.0,
    }]
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub upstream: UpstreamSettings,
    pub fallback: FallbackSettings,
    pub transform: TransformConfig,
    pub detection: DetectionSettings,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub reconnect_delay: Duration,
    pub jpeg_quality: u8,
    pub image_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Start the detection worker at startup.
    pub enabled: bool,
    /// Initially active model; defaults to the first available one.
    pub model: Option<String>,
    pub queue_capacity: usize,
    /// Quality for re-encoded (transformed or annotated) live frames.
    pub jpeg_quality: u8,
    pub font_path: Option<PathBuf>,
    pub models: Vec<ModelSpec>,
}

impl RelayConfig {
    /// Load from the file named by `RELAY_CONFIG` (if any), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RELAY_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let upstream = file.upstream.unwrap_or_default();
        let fallback = file.fallback.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        Self {
            listen_addr: file
                .listen_addr
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            upstream: UpstreamSettings {
                url: upstream
                    .url
                    .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
                connect_timeout: Duration::from_millis(
                    upstream
                        .connect_timeout_ms
                        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
                ),
                stall_timeout: Duration::from_millis(
                    upstream.stall_timeout_ms.unwrap_or(DEFAULT_STALL_TIMEOUT_MS),
                ),
            },
            fallback: FallbackSettings {
                frames: fallback.frames.unwrap_or(DEFAULT_FALLBACK_FRAMES),
                width: fallback.width.unwrap_or(DEFAULT_FALLBACK_WIDTH),
                height: fallback.height.unwrap_or(DEFAULT_FALLBACK_HEIGHT),
                fps: fallback.fps.unwrap_or(DEFAULT_FALLBACK_FPS),
                reconnect_delay: Duration::from_millis(
                    fallback
                        .reconnect_delay_ms
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
                ),
                jpeg_quality: fallback.jpeg_quality.unwrap_or(DEFAULT_FALLBACK_QUALITY),
                image_path: fallback.image_path,
            },
            transform: file.transform.unwrap_or_default(),
            detection: DetectionSettings {
                enabled: detection.enabled.unwrap_or(false),
                model: detection.model,
                queue_capacity: detection.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                jpeg_quality: detection.jpeg_quality.unwrap_or(DEFAULT_OUTPUT_QUALITY),
                font_path: detection.font_path,
                models: detection.models.unwrap_or_else(default_models),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("RELAY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        // ESP32_CAM_URL is what camera deployments already export.
        if let Some(url) = non_empty_env("ESP32_CAM_URL") {
            self.upstream.url = url;
        }
        if let Some(url) = non_empty_env("RELAY_UPSTREAM_URL") {
            self.upstream.url = url;
        }
        if let Some(ms) = non_empty_env("RELAY_STALL_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| anyhow!("RELAY_STALL_TIMEOUT_MS must be an integer number of milliseconds"))?;
            self.upstream.stall_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = non_empty_env("RELAY_RECONNECT_DELAY_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                anyhow!("RELAY_RECONNECT_DELAY_MS must be an integer number of milliseconds")
            })?;
            self.fallback.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(path) = non_empty_env("RELAY_FALLBACK_IMAGE") {
            self.fallback.image_path = Some(PathBuf::from(path));
        }
        if let Some(enabled) = non_empty_env("RELAY_DETECTION_ENABLED") {
            self.detection.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("RELAY_DETECTION_ENABLED must be true or false"))?;
        }
        if let Some(model) = non_empty_env("RELAY_DETECTION_MODEL") {
            self.detection.model = Some(model);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen_addr '{}'", self.listen_addr))?;

        let url = url::Url::parse(&self.upstream.url)
            .with_context(|| format!("invalid upstream url '{}'", self.upstream.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "upstream url must be http(s), got '{}'",
                url.scheme()
            ));
        }
        if self.upstream.connect_timeout.is_zero() || self.upstream.stall_timeout.is_zero() {
            return Err(anyhow!("upstream timeouts must be greater than zero"));
        }

        let fb = &self.fallback;
        if fb.frames == 0 || fb.width == 0 || fb.height == 0 {
            return Err(anyhow!("fallback frames, width and height must be greater than zero"));
        }
        if !(fb.fps.is_finite() && fb.fps > 0.0) {
            return Err(anyhow!("fallback fps must be positive"));
        }
        if fb.reconnect_delay.is_zero() {
            return Err(anyhow!("reconnect delay must be greater than zero"));
        }
        for quality in [fb.jpeg_quality, self.detection.jpeg_quality] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("jpeg quality must be within 1..=100 (got {})", quality));
            }
        }

        self.transform.validate()?;

        if self.detection.queue_capacity == 0 {
            return Err(anyhow!("detection queue_capacity must be at least 1"));
        }
        let mut names = HashSet::new();
        for spec in &self.detection.models {
            if !names.insert(spec.name.as_str()) {
                return Err(anyhow!("duplicate detection model '{}'", spec.name));
            }
            spec.model_config()?;
            if spec.backend == BackendKind::Tract && spec.model_path.is_none() {
                return Err(anyhow!("tract model '{}' needs model_path", spec.name));
            }
        }
        if let Some(model) = &self.detection.model {
            if !names.contains(model.as_str()) {
                return Err(anyhow!("detection model '{}' is not configured", model));
            }
        }
        Ok(())
    }

    pub fn upstream_config(&self) -> HttpUpstreamConfig {
        HttpUpstreamConfig {
            url: self.upstream.url.clone(),
            connect_timeout: self.upstream.connect_timeout,
            read_timeout: self.upstream.stall_timeout,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            stall_timeout: self.upstream.stall_timeout,
            reconnect_delay: self.fallback.reconnect_delay,
            fallback_fps: self.fallback.fps,
            jpeg_quality: self.detection.jpeg_quality,
        }
    }

    /// Produce the fallback frames. Any error here must stop startup.
    pub fn build_fallback(&self) -> Result<FallbackBuffer> {
        let fb = &self.fallback;
        let buffer = match &fb.image_path {
            Some(path) => FallbackBuffer::from_image_file(path)?,
            None => FallbackBuffer::generate(fb.frames, fb.width, fb.height, fb.jpeg_quality)?,
        };
        Ok(buffer)
    }

    pub fn build_annotator(&self) -> Result<Annotator> {
        match &self.detection.font_path {
            Some(path) => Annotator::with_font_file(path),
            None => Ok(Annotator::new()),
        }
    }

    /// Construct backends for every configured model. Models whose backend fails to
    /// load are registered as unavailable instead of failing startup.
    pub fn build_registry(&self) -> Result<ModelRegistry> {
        let mut registry = ModelRegistry::new();
        for spec in &self.detection.models {
            let config = spec.model_config()?;
            match spec.backend {
                BackendKind::Motion => registry.register(config, MotionBackend::new()),
                BackendKind::Stub => registry.register(config, StubBackend::new()),
                BackendKind::Tract => register_tract(&mut registry, spec, config),
            }
        }
        if let Some(model) = &self.detection.model {
            registry.set_default(model)?;
        }
        Ok(registry)
    }
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut ModelRegistry, spec: &ModelSpec, config: ModelConfig) {
    use crate::detect::backends::TractBackend;
    use crate::detect::DetectorBackend;

    let loaded = spec
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("no model_path"))
        .and_then(|path| TractBackend::new(path, spec.input_size))
        .and_then(|backend| {
            let mut backend = backend.with_labels(spec.labels.clone().unwrap_or_default());
            if let Some(threshold) = spec.confidence_threshold {
                backend = backend.with_threshold(threshold);
            }
            backend.warm_up()?;
            Ok(backend)
        });
    match loaded {
        Ok(backend) => registry.register(config, backend),
        Err(err) => {
            log::warn!("detection model '{}' unavailable: {:#}", spec.name, err);
            registry.register_unavailable(config);
        }
    }
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(registry: &mut ModelRegistry, spec: &ModelSpec, config: ModelConfig) {
    log::warn!(
        "detection model '{}' requires the backend-tract feature; marking unavailable",
        spec.name
    );
    registry.register_unavailable(config);
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
