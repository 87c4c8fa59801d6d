//! Single-turn chat runner
//!
//! Opens one session, reads one line, requests one completion and prints it.

use crate::chat::session::{ChatModel, ChatSession};
use crate::chat::ChatError;
use crate::inference::{Generation, GenerationParams};
use std::io::{BufRead, Write};

/// Label written before reading the user's line
pub const USER_LABEL: &str = "You: ";
/// Label written before the model's reply
pub const BOT_LABEL: &str = "Bot: ";

/// One completed request/response pair
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub prompt: String,
    pub generation: Generation,
}

/// Runs exactly one exchange against a model
pub struct ChatRunner<'m, M: ChatModel> {
    model: &'m M,
    params: GenerationParams,
    system_prompt: String,
}

impl<'m, M: ChatModel> ChatRunner<'m, M> {
    pub fn new(model: &'m M, params: GenerationParams) -> Self {
        Self {
            model,
            params,
            system_prompt: String::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Run the exchange over the given console streams
    ///
    /// The session is dropped on every return path, including errors.
    pub fn run_once<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
    ) -> Result<Exchange, ChatError> {
        let mut session = self.model.chat_session(&self.system_prompt)?;

        let prompt = read_prompt(input, output)?;
        tracing::debug!("Read {} bytes of input", prompt.len());

        let generation = session.generate(&prompt, &self.params)?;
        tracing::info!(
            "Generated {} tokens ({:?})",
            generation.tokens,
            generation.stop
        );

        writeln!(output, "{}{}", BOT_LABEL, generation.text)?;
        output.flush()?;

        Ok(Exchange { prompt, generation })
    }
}

/// Prompt with [`USER_LABEL`] and read a single line
///
/// The line terminator is stripped; everything else, including an empty line, is kept.
pub fn read_prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<String, ChatError> {
    write!(output, "{}", USER_LABEL)?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(ChatError::EndOfInput);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{GenerationError, StopReason};
    use std::cell::{Cell, RefCell};
    use std::io::{Cursor, Read};

    /// Records every call made through the session seam
    #[derive(Default)]
    struct FakeModel {
        reply: Option<String>,
        fail_open: bool,
        opened: Cell<u32>,
        closed: Cell<u32>,
        calls: RefCell<Vec<(String, GenerationParams)>>,
        system_prompts: RefCell<Vec<String>>,
    }

    impl FakeModel {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                ..Default::default()
            }
        }

        fn failing() -> Self {
            Self::default()
        }
    }

    struct FakeSession<'a> {
        model: &'a FakeModel,
    }

    impl ChatModel for FakeModel {
        type Session<'a> = FakeSession<'a>;

        fn chat_session(&self, system_prompt: &str) -> Result<FakeSession<'_>, GenerationError> {
            if self.fail_open {
                return Err(GenerationError::Context("no memory".to_string()));
            }
            self.opened.set(self.opened.get() + 1);
            self.system_prompts
                .borrow_mut()
                .push(system_prompt.to_string());
            Ok(FakeSession { model: self })
        }
    }

    impl ChatSession for FakeSession<'_> {
        fn generate(
            &mut self,
            prompt: &str,
            params: &GenerationParams,
        ) -> Result<Generation, GenerationError> {
            self.model
                .calls
                .borrow_mut()
                .push((prompt.to_string(), params.clone()));
            match &self.model.reply {
                Some(text) => Ok(Generation {
                    text: text.clone(),
                    tokens: 3,
                    stop: StopReason::EndOfGeneration,
                }),
                None => Err(GenerationError::Decode("backend failure".to_string())),
            }
        }
    }

    impl Drop for FakeSession<'_> {
        fn drop(&mut self) {
            self.model.closed.set(self.model.closed.get() + 1);
        }
    }

    fn run(model: &FakeModel, stdin: &str) -> (Result<Exchange, ChatError>, String, String) {
        let mut input = Cursor::new(stdin.as_bytes().to_vec());
        let mut output = Vec::new();
        let result = ChatRunner::new(model, GenerationParams::default())
            .run_once(&mut input, &mut output);
        let mut rest = String::new();
        input.read_to_string(&mut rest).unwrap();
        (result, String::from_utf8(output).unwrap(), rest)
    }

    #[test]
    fn test_hello_exchange() {
        let model = FakeModel::replying("Hi there!");
        let (result, stdout, _) = run(&model, "Hello\n");

        let exchange = result.unwrap();
        assert_eq!(exchange.prompt, "Hello");
        assert_eq!(stdout, "You: Bot: Hi there!\n");
        assert_eq!(model.opened.get(), 1);
        assert_eq!(model.closed.get(), 1);
    }

    #[test]
    fn test_max_tokens_passed_through() {
        let model = FakeModel::replying("ok");
        run(&model, "Hello\n").0.unwrap();

        let calls = model.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.max_tokens, 512);
    }

    #[test]
    fn test_empty_line_still_generates() {
        let model = FakeModel::replying("...");
        let (result, stdout, _) = run(&model, "\n");

        assert!(result.is_ok());
        assert_eq!(model.calls.borrow()[0].0, "");
        assert!(stdout.ends_with("Bot: ...\n"));
    }

    #[test]
    fn test_line_without_newline() {
        let model = FakeModel::replying("ok");
        let (result, _, _) = run(&model, "last line");
        assert_eq!(result.unwrap().prompt, "last line");
    }

    #[test]
    fn test_crlf_stripped_spaces_kept() {
        let model = FakeModel::replying("ok");
        let (result, _, _) = run(&model, "  padded  \r\n");
        assert_eq!(result.unwrap().prompt, "  padded  ");
    }

    #[test]
    fn test_reads_exactly_one_line() {
        let model = FakeModel::replying("ok");
        let (result, stdout, rest) = run(&model, "first\nsecond\nthird\n");

        assert_eq!(result.unwrap().prompt, "first");
        assert_eq!(rest, "second\nthird\n");
        assert_eq!(model.calls.borrow().len(), 1);
        assert_eq!(stdout.matches(USER_LABEL).count(), 1);
        assert_eq!(stdout.matches(BOT_LABEL).count(), 1);
    }

    #[test]
    fn test_generation_error_closes_session() {
        let model = FakeModel::failing();
        let (result, stdout, _) = run(&model, "Hello\n");

        assert!(matches!(result, Err(ChatError::Generation(_))));
        assert!(!stdout.contains(BOT_LABEL));
        assert_eq!(model.opened.get(), 1);
        assert_eq!(model.closed.get(), 1);
    }

    #[test]
    fn test_end_of_input() {
        let model = FakeModel::replying("unused");
        let (result, stdout, _) = run(&model, "");

        assert!(matches!(result, Err(ChatError::EndOfInput)));
        assert_eq!(stdout, "You: ");
        assert!(model.calls.borrow().is_empty());
        assert_eq!(model.closed.get(), 1);
    }

    #[test]
    fn test_session_open_failure_reads_nothing() {
        let model = FakeModel {
            fail_open: true,
            ..FakeModel::replying("unused")
        };
        let (result, stdout, rest) = run(&model, "Hello\n");

        assert!(matches!(result, Err(ChatError::Generation(_))));
        assert!(stdout.is_empty());
        assert_eq!(rest, "Hello\n");
        assert_eq!(model.closed.get(), 0);
    }

    #[test]
    fn test_system_prompt_forwarded() {
        let model = FakeModel::replying("Arr");
        let mut input = Cursor::new(b"Hi\n".to_vec());
        let mut output = Vec::new();
        ChatRunner::new(&model, GenerationParams::default())
            .with_system_prompt("Talk like a pirate")
            .run_once(&mut input, &mut output)
            .unwrap();

        assert_eq!(model.system_prompts.borrow()[0], "Talk like a pirate");
    }

    #[test]
    fn test_long_reply_single_call() {
        let long = "word ".repeat(5000);
        let model = FakeModel::replying(&long);
        let (result, stdout, _) = run(&model, "Tell me everything\n");

        assert!(result.is_ok());
        assert_eq!(model.calls.borrow().len(), 1);
        assert!(stdout.starts_with("You: Bot: word "));
    }
}
