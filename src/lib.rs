//! llamachat library
//!
//! Single-turn console chat with a local GGUF model through llama.cpp.

pub mod app;
pub mod chat;
pub mod inference;
pub mod storage;
pub mod types;
