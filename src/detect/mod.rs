//! Object detection overlay.
//!
//! - `backend`: the detection capability seam (`DetectorBackend`)
//! - `backends`: motion (CPU), stub, and tract (ONNX, feature `backend-tract`)
//! - `registry`: model configs and their backends
//! - `letterbox`: scale-and-pad into model input, and the inverse box mapping
//! - `pipeline`: bounded queue + single worker + cached latest results
//! - `annotate`: drawing cached results onto live frames
//! - `glyphs`: built-in bitmap label font

pub mod annotate;
mod backend;
pub mod backends;
mod glyphs;
pub mod letterbox;
pub mod pipeline;
mod registry;
pub mod result;

pub use annotate::Annotator;
pub use backend::DetectorBackend;
pub use backends::{MotionBackend, StubBackend};
pub use letterbox::{letterbox, Letterbox};
pub use pipeline::{DetectionPipeline, ModelStatus, PipelineStatus, DEFAULT_QUEUE_CAPACITY};
pub use registry::{ModelConfig, ModelRegistry};
pub use result::{Detection, DetectionSnapshot, RawDetection};
