//! LLM inference engine
//!
//! This module handles all interaction with llama-cpp for model loading and inference.

pub mod engine;
pub mod model;

// Re-export main types for convenience
pub use engine::{
    Generation, GenerationError, GenerationParams, LlamaChatSession, LlamaEngine, LoadError,
    LoadOptions, LoadedModelInfo, StopReason,
};
pub use model::{validate_gguf, GgufMetadata, ModelError, GGUF_MAGIC};
