use llamachat::app;
use llamachat::storage::settings::load_settings;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries only the conversation
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings();
    llama_cpp_2::send_logs_to_tracing(
        llama_cpp_2::LogOptions::default().with_logs_enabled(settings.llama_logs),
    );

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout().lock();

    match app::run(&settings, &mut input, &mut output) {
        Ok(exchange) => {
            tracing::debug!(
                "Exchange complete: {} prompt bytes, {} tokens",
                exchange.prompt.len(),
                exchange.generation.tokens
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            app::report_failure(&e, &mut std::io::stderr());
            ExitCode::FAILURE
        }
    }
}
