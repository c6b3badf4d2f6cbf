use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::RelayError;

use super::backend::DetectorBackend;

/// Static description of one detectable model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub display_name: String,
    /// Side of the square input image the backend expects.
    pub input_size: u32,
    pub default_fps: f32,
    pub min_fps: f32,
    pub max_fps: f32,
    pub available: bool,
}

impl ModelConfig {
    pub fn new(
        name: impl Into<String>,
        input_size: u32,
        default_fps: f32,
        min_fps: f32,
        max_fps: f32,
    ) -> Result<Self, RelayError> {
        let name = name.into();
        let ordered = min_fps > 0.0 && min_fps <= default_fps && default_fps <= max_fps;
        if !ordered || !max_fps.is_finite() {
            return Err(RelayError::FatalStartup(format!(
                "model '{}' needs 0 < min_fps <= default_fps <= max_fps (got {}/{}/{})",
                name, min_fps, default_fps, max_fps
            )));
        }
        if input_size == 0 {
            return Err(RelayError::FatalStartup(format!(
                "model '{}' input_size must be greater than zero",
                name
            )));
        }
        Ok(Self {
            display_name: name.clone(),
            name,
            input_size,
            default_fps,
            min_fps,
            max_fps,
            available: true,
        })
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Clamp a requested rate into `[min_fps, max_fps]`. NaN maps to `min_fps`.
    pub fn clamp_fps(&self, fps: f32) -> f32 {
        if fps.is_nan() {
            return self.min_fps;
        }
        fps.clamp(self.min_fps, self.max_fps)
    }
}

type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

struct RegisteredModel {
    config: ModelConfig,
    backend: Option<SharedBackend>,
}

/// Detectable models and the backends that serve them.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct ModelRegistry {
    models: BTreeMap<String, RegisteredModel>,
    default_name: Option<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Register an available model. The first available model becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, mut config: ModelConfig, backend: B) {
        config.available = true;
        if self.default_name.is_none() {
            self.default_name = Some(config.name.clone());
        }
        log::debug!("model {} served by the {} backend", config.name, backend.name());
        let backend: SharedBackend = Arc::new(Mutex::new(backend));
        self.models.insert(
            config.name.clone(),
            RegisteredModel {
                config,
                backend: Some(backend),
            },
        );
    }

    /// Register a model whose backend could not be loaded. It is listed but never runs.
    pub fn register_unavailable(&mut self, mut config: ModelConfig) {
        config.available = false;
        self.models.insert(
            config.name.clone(),
            RegisteredModel {
                config,
                backend: None,
            },
        );
    }

    /// Set default model by name.
    pub fn set_default(&mut self, name: &str) -> Result<(), RelayError> {
        let model = self
            .models
            .get(name)
            .ok_or_else(|| RelayError::UnknownModel(name.to_string()))?;
        if model.backend.is_none() {
            return Err(RelayError::ModelUnavailable(name.to_string()));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn config(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name).map(|m| &m.config)
    }

    /// Backend for an available model.
    pub fn backend(&self, name: &str) -> Result<SharedBackend, RelayError> {
        let model = self
            .models
            .get(name)
            .ok_or_else(|| RelayError::UnknownModel(name.to_string()))?;
        model
            .backend
            .clone()
            .ok_or_else(|| RelayError::ModelUnavailable(name.to_string()))
    }

    /// All registered models, sorted by name.
    pub fn list(&self) -> Vec<ModelConfig> {
        self.models.values().map(|m| m.config.clone()).collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
