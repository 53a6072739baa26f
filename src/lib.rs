//! Host-side lifecycle and prediction core for an on-device LLM engine.
//!
//! Engines and sessions live in registries keyed by opaque string ids.
//! Predictions run either on the caller's thread or on a dedicated worker
//! whose chunks are handed back through a [`ChunkDispatcher`].

pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod marshal;
pub mod media;
pub mod native;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use llm_host_models::{
    ActivationDataType, ModelSettings, PreferredBackend, PromptTemplates, Response,
    RuntimeConfig, SessionConfig,
};

pub use crate::config::{init_tracing, ConfigError, HostConfig};
pub use crate::engine::{EngineManager, EngineOptions};
pub use crate::error::{HostError, Result};
pub use crate::host::{LlmHost, LlmHostBuilder};
pub use crate::media::{FileMediaResolver, MediaError, MediaResolver};
pub use crate::native::{CApiBackend, InferenceBackend, NativeError, StubBackend};
pub use crate::scheduler::{ChunkDispatcher, PredictionEvent, PredictionScheduler, RequestId};
pub use crate::session::{PredictionState, SessionManager};
