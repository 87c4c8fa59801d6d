//! Session seam between the chat runner and an inference backend

use crate::inference::{Generation, GenerationError, GenerationParams};

/// Something that can open chat sessions over a loaded model
pub trait ChatModel {
    /// Session type; it borrows the model and is closed when dropped
    type Session<'a>: ChatSession
    where
        Self: 'a;

    /// Open a session, seeded with `system_prompt` when it is not blank
    fn chat_session(&self, system_prompt: &str) -> Result<Self::Session<'_>, GenerationError>;
}

/// An open chat session
pub trait ChatSession {
    /// Produce one completion for `prompt`, keeping it in the session history
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GenerationError>;
}
