//! Console chat
//!
//! The session traits the runner is written against, and the runner itself.

pub mod runner;
pub mod session;

pub use runner::{ChatRunner, Exchange, BOT_LABEL, USER_LABEL};
pub use session::{ChatModel, ChatSession};

use crate::inference::{GenerationError, LoadError};
use thiserror::Error;

/// Any failure that ends a run
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Failed to load model: {0}")]
    Load(#[from] LoadError),
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("Console I/O error: {0}")]
    Input(#[from] std::io::Error),
    #[error("Standard input closed before a line was read")]
    EndOfInput,
}
