//! Application flow
//!
//! Resolves and loads the model, then hands the console to the chat runner.

use crate::chat::{ChatError, ChatRunner, Exchange};
use crate::inference::{LlamaEngine, LoadError};
use crate::storage::download::format_size;
use crate::storage::models::resolve_model;
use crate::storage::settings::ChatSettings;
use std::io::{BufRead, Write};

/// Run one chat exchange with the configured model
///
/// The model is fully loaded before anything is read from `input`.
pub fn run<R: BufRead, W: Write>(
    settings: &ChatSettings,
    input: &mut R,
    output: &mut W,
) -> Result<Exchange, ChatError> {
    let path = resolve_model(settings).map_err(LoadError::from)?;

    let mut engine = LlamaEngine::new();
    let info = engine.load_model(&path, &settings.load_options())?;
    tracing::info!(
        "Ready: {} ({:?}, GGUF v{}, {}, context {})",
        info.name,
        info.architecture,
        info.gguf_version,
        format_size(info.size_bytes),
        info.context_size
    );

    let runner = ChatRunner::new(&engine, settings.generation_params())
        .with_system_prompt(settings.system_prompt.clone());
    let exchange = runner.run_once(input, output)?;
    Ok(exchange)
}

/// Log a fatal error and print it as one line on `stderr`
pub fn report_failure<W: Write>(err: &ChatError, stderr: &mut W) {
    tracing::error!("{:?}", err);
    let _ = writeln!(stderr, "Error: {}", err);
}
