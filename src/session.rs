//! The interactive chat session.
//!
//! A [`Session`] owns everything a conversation needs: the [`Backend`] it makes sure is
//! running, the [`Transport`] messages travel through, the [`History`] of recent exchanges and
//! the terminal output. Input lines come from a [`LineSource`] and are routed by
//! [`Session::handle_input`]; one message is processed to completion before the next prompt.
//!
//! ## State
//!
//! ```text
//! Initializing -> Ready -> AwaitingInput <-> Processing
//!                                |
//!                                v
//!                           Terminated
//! ```

use std::{
    io::{self, Write},
    time::Duration,
};

use async_trait::async_trait;
use crossterm::style::Stylize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use reedline::{DefaultPrompt, DefaultPromptSegment, Reedline, Signal};
use tracing::{debug, info, warn};

use crate::{
    Error,
    backend::Backend,
    config::Config,
    history::{Exchange, History},
    ollama,
    transport::Transport,
};

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    AwaitingInput,
    Processing,
    Terminated,
}

/// What a line of user input asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Exit,
    Clear,
    Empty,
    Chat(&'a str),
}

impl<'a> Input<'a> {
    /// Classifies a line. Commands are matched trimmed and case-insensitively.
    pub fn classify(line: &'a str, exit_commands: &[String]) -> Self {
        let trimmed = line.trim();
        let normalized = trimmed.to_lowercase();

        if normalized.is_empty() {
            Input::Empty
        } else if exit_commands.iter().any(|command| *command == normalized) {
            Input::Exit
        } else if normalized == "clear" {
            Input::Clear
        } else {
            Input::Chat(trimmed)
        }
    }
}

/// Whether the loop should keep going after an input was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// How the backend was found during initialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendStatus {
    AlreadyRunning,
    Started,
}

/// A session error. Only initialization and terminal failures end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] Error),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Result of reading one line of input.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    Line(String),
    /// The user pressed Ctrl-C at the prompt.
    Interrupted,
    /// Input is exhausted (Ctrl-D or closed stdin).
    Eof,
}

/// Somewhere input lines come from.
#[async_trait(?Send)]
pub trait LineSource {
    async fn read_line(&mut self, prompt: &str) -> io::Result<ReadEvent>;
}

/// Interactive line editor input.
pub struct ReedlineSource {
    editor: Reedline,
}

impl ReedlineSource {
    pub fn new() -> Self {
        Self {
            editor: Reedline::create(),
        }
    }
}

impl Default for ReedlineSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl LineSource for ReedlineSource {
    async fn read_line(&mut self, prompt: &str) -> io::Result<ReadEvent> {
        let prompt = DefaultPrompt::new(
            DefaultPromptSegment::Basic(prompt.to_string()),
            DefaultPromptSegment::Empty,
        );

        // The editor blocks on the terminal, keep the runtime's other workers free.
        let signal = tokio::task::block_in_place(|| self.editor.read_line(&prompt))?;
        Ok(match signal {
            Signal::Success(buffer) => ReadEvent::Line(buffer),
            Signal::CtrlC => ReadEvent::Interrupted,
            Signal::CtrlD => ReadEvent::Eof,
        })
    }
}

/// Plain buffered input, for piped stdin and tests.
///
/// Reads asynchronously, so an interrupt can be handled while waiting for a line.
pub struct BufReadSource<R, P> {
    reader: R,
    prompt_out: P,
}

impl<R: AsyncBufRead + Unpin, P: Write> BufReadSource<R, P> {
    /// Reads lines from `reader`, writing prompts to `prompt_out`.
    pub fn new(reader: R, prompt_out: P) -> Self {
        Self { reader, prompt_out }
    }
}

#[async_trait(?Send)]
impl<R: AsyncBufRead + Unpin, P: Write> LineSource for BufReadSource<R, P> {
    async fn read_line(&mut self, prompt: &str) -> io::Result<ReadEvent> {
        write!(self.prompt_out, "{prompt}: ")?;
        self.prompt_out.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(ReadEvent::Eof);
        }
        Ok(ReadEvent::Line(
            line.trim_end_matches(['\n', '\r']).to_string(),
        ))
    }
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Name the assistant speaks under.
    pub persona: String,
    /// How the user is addressed.
    pub user_label: String,
    /// Model expected to be installed on the backend.
    pub model: String,
    /// Lowercased inputs ending the session.
    pub exit_commands: Vec<String>,
    /// Wait between starting the backend and probing it again.
    pub startup_grace: Duration,
    pub history_capacity: usize,
    /// Whether to color the output. Only set when writing to a terminal.
    pub styled: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            persona: config.session.persona.clone(),
            user_label: config.session.user_label.clone(),
            model: config.model.name.clone(),
            exit_commands: config.exit_commands(),
            startup_grace: config.startup_grace(),
            history_capacity: config.session.history_capacity,
            styled: false,
        }
    }
}

/// A chat session, from backend startup to termination.
pub struct Session<B, T, W> {
    state: SessionState,
    history: History,
    backend: B,
    transport: T,
    out: W,
    options: SessionOptions,
}

impl<B, T, W> Session<B, T, W>
where
    B: Backend,
    T: Transport,
    W: Write + Send,
{
    pub fn new(backend: B, transport: T, out: W, options: SessionOptions) -> Self {
        Self {
            state: SessionState::Initializing,
            history: History::with_capacity(options.history_capacity),
            backend,
            transport,
            out,
            options,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Makes sure the backend runs, starting it if needed, then greets the user.
    ///
    /// Fails with [`Error::BackendUnavailable`] when the backend is neither running nor
    /// reachable after the start attempt and the grace period.
    pub async fn initialize(&mut self) -> Result<BackendStatus, SessionError> {
        self.state = SessionState::Initializing;

        let status = if self.backend.is_available().await {
            writeln!(self.out, "Ollama server is already running!")?;
            BackendStatus::AlreadyRunning
        } else {
            writeln!(self.out, "🔄 Starting Ollama server...")?;
            self.out.flush()?;

            if let Err(err) = self.backend.start().await {
                self.state = SessionState::Terminated;
                return Err(err.into());
            }
            debug!(grace = ?self.options.startup_grace, "waiting for backend to come up");
            tokio::time::sleep(self.options.startup_grace).await;

            if !self.backend.is_available().await {
                self.backend.shutdown().await;
                self.state = SessionState::Terminated;
                return Err(Error::BackendUnavailable(
                    "Failed to start Ollama server".to_string(),
                )
                .into());
            }
            writeln!(self.out, "✅ Ollama server started successfully!")?;
            BackendStatus::Started
        };
        info!(?status, "backend ready");

        if self.backend.has_model().await == Some(false) {
            warn!(model = %self.options.model, "model is not installed on the backend");
            writeln!(
                self.out,
                "Model \"{}\" was not found, replies will fail until it is created.",
                self.options.model
            )?;
        }

        self.state = SessionState::Ready;
        self.print_banner()?;
        Ok(status)
    }

    fn print_banner(&mut self) -> io::Result<()> {
        let title = format!("🤖 {} SYSTEM INITIALIZED", self.options.persona);
        if self.options.styled {
            writeln!(self.out, "{}", title.as_str().bold())?;
        } else {
            writeln!(self.out, "{title}")?;
        }
        writeln!(self.out, "{}", "═".repeat(27))?;
        writeln!(
            self.out,
            "Greetings, {}. I am {}, your digital assistant.",
            self.options.user_label, self.options.persona
        )?;
        writeln!(
            self.out,
            "Type \"exit\" or \"quit\" to terminate the session."
        )?;
        writeln!(self.out, "Type \"clear\" to clear conversation memory.\n")?;
        self.out.flush()
    }

    fn speaker(&self) -> String {
        let label = format!("{}:", self.options.persona);
        if !self.options.styled {
            return label;
        }
        label.cyan().bold().to_string()
    }

    /// Routes one line of input.
    ///
    /// Chat failures are reported inline and do not end the session; only failing to write
    /// to the terminal is an error.
    pub async fn handle_input(&mut self, line: &str) -> Result<Flow, SessionError> {
        let speaker = self.speaker();

        match Input::classify(line, &self.options.exit_commands) {
            Input::Exit => {
                writeln!(self.out, "\n🔴 {speaker} Exiting... Terminated.")?;
                self.out.flush()?;
                return Ok(Flow::Exit);
            }
            Input::Clear => {
                self.history.clear();
                writeln!(
                    self.out,
                    "🧠 {speaker} Memory cleared. Starting fresh conversation.\n"
                )?;
            }
            Input::Empty => {}
            Input::Chat(message) => {
                self.state = SessionState::Processing;
                self.chat(message, &speaker).await?;
                self.state = SessionState::AwaitingInput;
            }
        }

        self.out.flush()?;
        Ok(Flow::Continue)
    }

    async fn chat(&mut self, message: &str, speaker: &str) -> Result<(), SessionError> {
        writeln!(self.out, "\n{speaker} Processing...")?;
        self.out.flush()?;

        let out = &mut self.out;
        let mut started = false;
        let result = self
            .transport
            .send(message, &self.history, &mut |fragment| {
                // Fragment output is best effort, a broken terminal surfaces on the next write.
                if !started {
                    let _ = write!(out, "{speaker} ");
                    started = true;
                }
                let _ = write!(out, "{fragment}");
                let _ = out.flush();
            })
            .await;

        match result {
            Ok(reply) => {
                let text = reply.text.trim();
                if reply.streamed {
                    writeln!(self.out, "\n")?;
                } else {
                    writeln!(self.out, "{speaker} {text}\n")?;
                }
                self.history.append(Exchange::new(message, text));
            }
            Err(err) => {
                warn!(transport = self.transport.name(), %err, "chat turn failed");
                if started {
                    writeln!(self.out)?;
                }
                writeln!(self.out, "{speaker} System error encountered - {err}\n")?;
            }
        }

        Ok(())
    }

    /// Runs the read-eval-print loop until an exit command, end of input or Ctrl-C at the
    /// prompt, then shuts down.
    pub async fn run<L: LineSource + ?Sized>(
        &mut self,
        input: &mut L,
    ) -> Result<(), SessionError> {
        let prompt = self.options.user_label.to_uppercase();

        let result = loop {
            self.state = SessionState::AwaitingInput;
            let line = match input.read_line(&prompt).await {
                Ok(ReadEvent::Line(line)) => line,
                Ok(ReadEvent::Interrupted) => {
                    let speaker = self.speaker();
                    let notice = writeln!(self.out, "\n\n{speaker} Emergency shutdown initiated.");
                    break notice.map_err(SessionError::from);
                }
                Ok(ReadEvent::Eof) => match self.handle_input("exit").await {
                    Ok(_) => break Ok(()),
                    Err(err) => break Err(err),
                },
                Err(err) => break Err(err.into()),
            };

            match self.handle_input(&line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.shutdown().await;
        result
    }

    /// Releases the transport and any backend process this session started.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }

        self.transport.shutdown().await;
        if self.backend.owns_process() {
            self.backend.shutdown().await;
        }
        let _ = self.out.flush();

        self.state = SessionState::Terminated;
        debug!("session terminated");
    }
}

/// Registers `callback` to run once the process receives an interrupt (Ctrl-C).
///
/// Must be called from within a tokio runtime.
pub fn on_interrupt<F>(callback: F) -> tokio::task::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => callback(),
            Err(err) => warn!(%err, "cannot listen for interrupts"),
        }
    })
}

/// Hint shown when initialization fails.
pub fn initialization_hint(model: &str) -> String {
    format!(
        "Make sure Ollama is installed and the \"{}\" model exists.",
        if model.is_empty() {
            ollama::DEFAULT_MODEL
        } else {
            model
        }
    )
}
