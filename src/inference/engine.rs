//! llama.cpp engine
//!
//! Owns the llama.cpp backend and the single loaded model, and hands out
//! borrow-scoped chat sessions that run completions against it.

use crate::chat::session::{ChatModel, ChatSession};
use crate::inference::model::{validate_gguf, ModelError};
use crate::storage::StorageError;
use crate::types::message::{plain_transcript, Message, Role};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while getting a model ready
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to initialize llama.cpp backend: {0}")]
    Backend(String),
    #[error("Invalid model file: {0}")]
    InvalidModel(#[from] ModelError),
    #[error("llama.cpp could not load the model: {0}")]
    Llama(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised while generating text
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("No model loaded")]
    NoModelLoaded,
    #[error("Failed to create inference context: {0}")]
    Context(String),
    #[error("Failed to apply chat template: {0}")]
    Template(String),
    #[error("Tokenization failed: {0}")]
    Tokenize(String),
    #[error("Prompt is {tokens} tokens but the context holds {context}")]
    PromptTooLong { tokens: usize, context: usize },
    #[error("Batch error: {0}")]
    Batch(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Detokenization failed: {0}")]
    Detokenize(String),
}

/// Sampling parameters for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Upper bound on produced tokens
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub seed: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.4,
            min_p: 0.0,
            repeat_penalty: 1.18,
            repeat_last_n: 64,
            seed: 0,
        }
    }
}

/// Why a completion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model emitted an end-of-generation token
    EndOfGeneration,
    /// `max_tokens` was reached
    MaxTokens,
    /// The context window filled up
    ContextFull,
}

/// Result of one completion
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tokens: u32,
    pub stop: StopReason,
}

/// Options applied when loading a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Number of layers offloaded to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Requested context window, capped to the model's training context
    pub context_size: u32,
    /// Prompt evaluation batch size
    pub batch_size: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            context_size: 2048,
            batch_size: 512,
        }
    }
}

/// Information about the loaded model
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModelInfo {
    /// Display name, from `general.name` or the file stem
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub architecture: Option<String>,
    pub gguf_version: u32,
    /// Context length the model was trained with
    pub train_context: u32,
    /// Context window sessions are created with
    pub context_size: u32,
}

/// Context window and batch size actually used for a model
///
/// The context is capped to the training context when the model reports one.
fn effective_sizes(options: &LoadOptions, train_context: u32) -> (u32, u32) {
    let context_size = if train_context > 0 {
        options.context_size.min(train_context)
    } else {
        options.context_size
    };
    let batch_size = options.batch_size.clamp(1, context_size.max(1));
    (context_size, batch_size)
}

/// The llama.cpp engine
///
/// Holds at most one model; the backend is initialized once per process,
/// on the first successful validation of a model file.
pub struct LlamaEngine {
    backend: Option<LlamaBackend>,
    model: Option<LlamaModel>,
    info: Option<LoadedModelInfo>,
    batch_size: u32,
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaEngine {
    /// Create an engine with no backend and no model
    pub fn new() -> Self {
        Self {
            backend: None,
            model: None,
            info: None,
            batch_size: LoadOptions::default().batch_size,
        }
    }

    fn backend(&mut self) -> Result<&LlamaBackend, LoadError> {
        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => {
                let backend =
                    LlamaBackend::init().map_err(|e| LoadError::Backend(e.to_string()))?;
                tracing::debug!("llama.cpp backend initialized");
                backend
            }
        };
        Ok(&*self.backend.insert(backend))
    }

    /// Load a GGUF model, replacing any model already held
    ///
    /// The file header is validated before llama.cpp is touched.
    pub fn load_model(
        &mut self,
        path: &Path,
        options: &LoadOptions,
    ) -> Result<LoadedModelInfo, LoadError> {
        let metadata = validate_gguf(path)?;
        if !metadata.has_chat_template {
            tracing::warn!("{:?} carries no chat template, prompts use a plain transcript", path);
        }
        self.unload_model();

        let params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
        tracing::info!(
            "Loading model {:?} ({} GPU layers)",
            path,
            options.gpu_layers
        );
        let backend = self.backend()?;
        let model = LlamaModel::load_from_file(backend, path, &params)
            .map_err(|e| LoadError::Llama(e.to_string()))?;

        let train_context = model.n_ctx_train();
        let (context_size, batch_size) = effective_sizes(options, train_context);
        if context_size < options.context_size {
            tracing::warn!(
                "Context size {} exceeds training context, capping to {}",
                options.context_size,
                context_size
            );
        }

        let name = metadata.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let info = LoadedModelInfo {
            name,
            path: path.to_path_buf(),
            size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            architecture: metadata.architecture,
            gguf_version: metadata.version,
            train_context,
            context_size,
        };

        tracing::info!("Model loaded: {} ({})", info.name, info.path.display());
        self.model = Some(model);
        self.info = Some(info.clone());
        self.batch_size = batch_size;
        Ok(info)
    }

    /// Drop the loaded model, if any
    pub fn unload_model(&mut self) {
        if self.model.take().is_some() {
            tracing::info!("Model unloaded");
        }
        self.info = None;
    }
}

impl ChatModel for LlamaEngine {
    type Session<'a> = LlamaChatSession<'a>;

    fn chat_session(&self, system_prompt: &str) -> Result<LlamaChatSession<'_>, GenerationError> {
        let (Some(backend), Some(model), Some(info)) = (&self.backend, &self.model, &self.info)
        else {
            return Err(GenerationError::NoModelLoaded);
        };

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(info.context_size))
            .with_n_batch(self.batch_size);
        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| GenerationError::Context(e.to_string()))?;

        let template = match model.chat_template(None) {
            Ok(template) => Some(template),
            Err(e) => {
                tracing::debug!("No usable chat template: {}", e);
                None
            }
        };

        let mut history = Vec::new();
        if !system_prompt.trim().is_empty() {
            history.push(Message::new(Role::System, system_prompt));
        }

        tracing::debug!("Chat session opened (n_ctx = {})", info.context_size);
        Ok(LlamaChatSession {
            model,
            ctx,
            template,
            history,
            batch_size: self.batch_size as usize,
        })
    }
}

/// A chat session bound to the engine's model
///
/// Owns the inference context and conversation history; both are released on drop.
pub struct LlamaChatSession<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    template: Option<LlamaChatTemplate>,
    history: Vec<Message>,
    batch_size: usize,
}

impl ChatSession for LlamaChatSession<'_> {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Generation, GenerationError> {
        let Self {
            model,
            ctx,
            template,
            history,
            batch_size,
        } = self;

        record_turn(history, prompt, |history| {
            let text = render_prompt(*model, template.as_ref(), history)?;
            complete(*model, ctx, *batch_size, &text, params)
        })
    }
}

impl Drop for LlamaChatSession<'_> {
    fn drop(&mut self) {
        self.history.clear();
        tracing::debug!("Chat session closed");
    }
}

/// Append the user turn, run `complete` over the history, then keep the reply
///
/// On failure the user turn is removed again.
fn record_turn<F>(
    history: &mut Vec<Message>,
    prompt: &str,
    complete: F,
) -> Result<Generation, GenerationError>
where
    F: FnOnce(&[Message]) -> Result<Generation, GenerationError>,
{
    history.push(Message::new(Role::User, prompt));
    match complete(history) {
        Ok(generation) => {
            history.push(Message::new(Role::Assistant, generation.text.clone()));
            Ok(generation)
        }
        Err(e) => {
            history.pop();
            Err(e)
        }
    }
}

fn render_prompt(
    model: &LlamaModel,
    template: Option<&LlamaChatTemplate>,
    history: &[Message],
) -> Result<String, GenerationError> {
    let Some(template) = template else {
        return Ok(plain_transcript(history));
    };

    let chat = history
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GenerationError::Template(e.to_string()))?;
    model
        .apply_chat_template(template, &chat, true)
        .map_err(|e| GenerationError::Template(e.to_string()))
}

/// Whether the rendered prompt already opens with the BOS token's text
fn starts_with_bos(prompt: &str, bos_piece: &str) -> bool {
    !bos_piece.is_empty() && prompt.starts_with(bos_piece)
}

fn add_bos_for(model: &LlamaModel, prompt: &str) -> AddBos {
    let bos_piece = model
        .token_to_bytes(model.token_bos(), Special::Tokenize)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    if starts_with_bos(prompt, &bos_piece) {
        AddBos::Never
    } else {
        AddBos::Always
    }
}

/// Tracks produced tokens against `max_tokens` and the context window
#[derive(Debug, Clone, Copy)]
struct TokenBudget {
    max_tokens: u32,
    n_ctx: usize,
    generated: u32,
}

impl TokenBudget {
    fn new(max_tokens: u32, n_ctx: usize) -> Self {
        Self {
            max_tokens,
            n_ctx,
            generated: 0,
        }
    }

    /// Stop condition before sampling a token at position `pos`
    fn check(&self, pos: usize) -> Option<StopReason> {
        if self.generated >= self.max_tokens {
            Some(StopReason::MaxTokens)
        } else if pos >= self.n_ctx {
            Some(StopReason::ContextFull)
        } else {
            None
        }
    }

    fn record(&mut self) {
        self.generated += 1;
    }

    fn is_spent(&self) -> bool {
        self.generated >= self.max_tokens
    }
}

fn complete(
    model: &LlamaModel,
    ctx: &mut LlamaContext<'_>,
    batch_size: usize,
    prompt: &str,
    params: &GenerationParams,
) -> Result<Generation, GenerationError> {
    let tokens = model
        .str_to_token(prompt, add_bos_for(model, prompt))
        .map_err(|e| GenerationError::Tokenize(e.to_string()))?;
    if tokens.is_empty() {
        return Err(GenerationError::Tokenize("prompt produced no tokens".to_string()));
    }

    let n_ctx = ctx.n_ctx() as usize;
    if tokens.len() >= n_ctx {
        return Err(GenerationError::PromptTooLong {
            tokens: tokens.len(),
            context: n_ctx,
        });
    }

    let mut budget = TokenBudget::new(params.max_tokens, n_ctx);
    if budget.is_spent() {
        return Ok(Generation {
            text: String::new(),
            tokens: 0,
            stop: StopReason::MaxTokens,
        });
    }

    ctx.clear_kv_cache();

    let mut batch = LlamaBatch::new(batch_size, 1);
    let last_index = tokens.len() - 1;
    let mut pos: i32 = 0;
    for chunk in tokens.chunks(batch_size) {
        batch.clear();
        for &token in chunk {
            let wants_logits = pos as usize == last_index;
            batch
                .add(token, pos, &[0], wants_logits)
                .map_err(|e| GenerationError::Batch(e.to_string()))?;
            pos += 1;
        }
        ctx.decode(&mut batch)
            .map_err(|e| GenerationError::Decode(e.to_string()))?;
    }
    tracing::debug!("Prompt evaluated: {} tokens", tokens.len());

    let mut sampler = build_sampler(params);
    let mut bytes: Vec<u8> = Vec::new();

    let stop = loop {
        if let Some(stop) = budget.check(pos as usize) {
            break stop;
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        if model.is_eog_token(token) {
            break StopReason::EndOfGeneration;
        }

        // Pieces can split a UTF-8 sequence; decode once at the end
        let piece = model
            .token_to_bytes(token, Special::Plaintext)
            .map_err(|e| GenerationError::Detokenize(e.to_string()))?;
        bytes.extend_from_slice(&piece);
        budget.record();

        // No point evaluating a token nothing will follow
        if budget.is_spent() {
            break StopReason::MaxTokens;
        }

        batch.clear();
        batch
            .add(token, pos, &[0], true)
            .map_err(|e| GenerationError::Batch(e.to_string()))?;
        pos += 1;
        ctx.decode(&mut batch)
            .map_err(|e| GenerationError::Decode(e.to_string()))?;
    };

    tracing::debug!("Generated {} tokens, stopped on {:?}", budget.generated, stop);
    Ok(Generation {
        text: String::from_utf8_lossy(&bytes).into_owned(),
        tokens: budget.generated,
        stop,
    })
}

fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    let mut chain = vec![LlamaSampler::penalties(
        params.repeat_last_n,
        params.repeat_penalty,
        0.0,
        0.0,
    )];

    if params.temperature <= 0.0 {
        chain.push(LlamaSampler::greedy());
    } else {
        chain.push(LlamaSampler::top_k(params.top_k as i32));
        chain.push(LlamaSampler::top_p(params.top_p, 1));
        chain.push(LlamaSampler::min_p(params.min_p, 1));
        chain.push(LlamaSampler::temp(params.temperature));
        chain.push(LlamaSampler::dist(params.seed));
    }

    LlamaSampler::chain_simple(chain)
}
