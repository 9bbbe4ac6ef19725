//! Transports carry a user message to the backend and bring back the reply.
//!
//! Three flavours exist:
//!
//! * [`HttpTransport::single_turn`] sends only the new message, the model sees no context.
//! * [`HttpTransport::with_context`] re-sends the whole [`History`] as a transcript in front of
//!   the new message, since the generate endpoint keeps no state between calls.
//! * [`PipeTransport`] keeps a line-oriented model process alive and talks to it over its
//!   standard streams; the process remembers the conversation by itself.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::{debug, info, trace, warn};

use crate::{
    Api, Error, GenerateRequestBuilder,
    history::{History, Speakers},
    json_scan::StreamDecoder,
    ollama,
};

/// How long to wait for a pipe child to report its exit status after closing its output.
const EXIT_WAIT: Duration = Duration::from_secs(1);

/// Line a pipe child prints on its own after every complete reply.
pub const DEFAULT_TERMINATOR: &str = "<<<END>>>";

/// The assistant's answer to a single message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// Whether the text was already handed out fragment by fragment while it was generated.
    pub streamed: bool,
}

#[async_trait]
pub trait Transport: Send {
    /// Sends `message` and waits for the complete reply.
    ///
    /// Streaming transports call `on_fragment` with each piece of text as it arrives.
    async fn send(
        &mut self,
        message: &str,
        history: &History,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) + Send + '_),
    ) -> Result<Reply, Error>;

    /// Releases any process or connection held by the transport.
    async fn shutdown(&mut self) {}

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(
        &mut self,
        message: &str,
        history: &History,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) + Send + '_),
    ) -> Result<Reply, Error> {
        (**self).send(message, history, on_fragment).await
    }

    async fn shutdown(&mut self) {
        (**self).shutdown().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// What an HTTP transport puts into the prompt.
#[derive(Debug, Clone)]
pub enum PromptMode {
    /// Only the new message.
    SingleTurn,
    /// The rendered history followed by the new message.
    Transcript(Speakers),
}

/// Sends every message as a separate `generate` request.
#[derive(Debug)]
pub struct HttpTransport {
    api: Api,
    client: reqwest::Client,
    mode: PromptMode,
    stream: bool,
}

impl HttpTransport {
    pub fn single_turn(api: Api, client: reqwest::Client) -> Self {
        Self {
            api,
            client,
            mode: PromptMode::SingleTurn,
            stream: false,
        }
    }

    pub fn with_context(api: Api, client: reqwest::Client, speakers: Speakers) -> Self {
        Self {
            api,
            client,
            mode: PromptMode::Transcript(speakers),
            stream: false,
        }
    }

    /// Enables streamed replies.
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    fn prompt(&self, message: &str, history: &History) -> String {
        match &self.mode {
            PromptMode::SingleTurn => message.to_string(),
            PromptMode::Transcript(speakers) => history.prompt_for(speakers, message),
        }
    }

    async fn receive_batched(response: reqwest::Response) -> Result<Reply, Error> {
        let status = response.status();
        let body = response.text().await?;

        match ollama::deserialize_response(&body) {
            Ok(text) => Ok(Reply {
                text,
                streamed: false,
            }),
            Err(Error::Parse(err)) if !status.is_success() => {
                debug!(%err, "unparsable error body");
                Err(Error::Transport(format!("HTTP {status}: {}", body.trim())))
            }
            Err(err) => Err(err),
        }
    }

    async fn receive_streamed(
        mut response: reqwest::Response,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) + Send + '_),
    ) -> Result<Reply, Error> {
        let status = response.status();
        if !status.is_success() {
            // Failures are reported as a single, non-streamed error object.
            return match Self::receive_batched(response).await {
                Err(err) => Err(err),
                Ok(_) => Err(Error::Transport(format!("HTTP {status}"))),
            };
        }

        let mut decoder = StreamDecoder::new();
        let mut text = String::new();

        while let Some(bytes) = response.chunk().await? {
            for object in decoder.push(&bytes)? {
                let chunk = ollama::deserialize_chunk(&object)?;
                if !chunk.text.is_empty() {
                    on_fragment(&chunk.text);
                    text.push_str(&chunk.text);
                }
                if chunk.done {
                    return finish_stream(text);
                }
            }
        }

        if !decoder.is_finished() {
            return Err(Error::Transport(
                "response stream ended in the middle of a message".to_string(),
            ));
        }
        finish_stream(text)
    }
}

fn finish_stream(text: String) -> Result<Reply, Error> {
    if text.is_empty() {
        return Err(Error::MissingResponse);
    }
    Ok(Reply {
        text,
        streamed: true,
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &mut self,
        message: &str,
        history: &History,
        on_fragment: &mut (dyn for<'f> FnMut(&'f str) + Send + '_),
    ) -> Result<Reply, Error> {
        let prompt = self.prompt(message, history);
        let http_request = GenerateRequestBuilder::new(prompt)
            .stream(self.stream)
            .build(&self.api)?;

        debug!(
            transport = self.name(),
            history = history.len(),
            bytes = http_request.body.len(),
            "sending generate request"
        );
        trace!(request = %http_request, "request");

        let response = http_request
            .try_into_reqwest_builder(&self.client)?
            .send()
            .await?;

        if self.stream {
            Self::receive_streamed(response, on_fragment).await
        } else {
            Self::receive_batched(response).await
        }
    }

    fn name(&self) -> &'static str {
        match self.mode {
            PromptMode::SingleTurn => "http",
            PromptMode::Transcript(_) => "context",
        }
    }
}

/// Talks to a long-running model process over newline-delimited stdin/stdout.
///
/// Each message is written as one line. The reply is every line printed before a line holding
/// only the terminator, so replies may contain blank lines. The process is spawned on the first
/// message and respawned on the next one if it dies.
///
/// `ollama run` itself does not qualify: without a terminal it waits for the end of its input
/// before answering. The child is expected to be a wrapper speaking this protocol.
#[derive(Debug)]
pub struct PipeTransport {
    command: Vec<String>,
    terminator: String,
    process: Option<PipeProcess>,
}

#[derive(Debug)]
struct PipeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl PipeTransport {
    /// Creates a transport for `command` (program followed by its arguments) whose replies end
    /// with a `terminator` line.
    pub fn new<S: Into<String>>(command: Vec<String>, terminator: S) -> Result<Self, Error> {
        if command.is_empty() {
            return Err(Error::Transport("no pipe command configured".to_string()));
        }
        let terminator = terminator.into();
        if terminator.trim().is_empty() {
            return Err(Error::Transport("pipe reply terminator is empty".to_string()));
        }

        Ok(Self {
            command,
            terminator,
            process: None,
        })
    }

    /// Whether the child process is currently running.
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    fn spawn(&self) -> Result<PipeProcess, Error> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Transport("no pipe command configured".to_string()))?;

        info!(program = %program, ?args, "spawning pipe backend");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Transport(format!("failed to start `{program}`: {err}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::Transport("child process has no pipes".to_string()));
        };

        Ok(PipeProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

impl PipeProcess {
    async fn exchange(&mut self, line: &str, terminator: &str) -> Result<String, Error> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let mut reply = Vec::new();
        loop {
            match self.stdout.next_line().await? {
                Some(line) if line.trim() == terminator => break,
                Some(line) => reply.push(line),
                None => return Err(self.exit_error().await),
            }
        }

        let text = reply.join("\n").trim().to_string();
        if text.is_empty() {
            return Err(Error::MissingResponse);
        }
        Ok(text)
    }

    /// Describes why the child stopped talking.
    async fn exit_error(&mut self) -> Error {
        match tokio::time::timeout(EXIT_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => Error::Transport(format!("backend process exited with {status}")),
            Ok(Err(err)) => Error::Transport(format!("backend process failed: {err}")),
            Err(_) => Error::Transport("backend process closed its output".to_string()),
        }
    }

    async fn kill(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        info!(pid = ?self.child.id(), "stopping pipe backend");
        if let Err(err) = self.child.kill().await {
            warn!(%err, "failed to stop pipe backend");
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(
        &mut self,
        message: &str,
        _history: &History,
        _on_fragment: &mut (dyn for<'f> FnMut(&'f str) + Send + '_),
    ) -> Result<Reply, Error> {
        // The protocol is line based, a multi-line message is folded into one line.
        let line = message.lines().map(str::trim).collect::<Vec<_>>().join(" ");

        let mut process = match self.process.take() {
            Some(process) => process,
            None => self.spawn()?,
        };

        debug!(transport = self.name(), bytes = line.len(), "writing message");
        let result = process.exchange(&line, self.terminator.trim()).await;
        match result {
            Err(Error::MissingResponse) => {
                self.process = Some(process);
                Err(Error::MissingResponse)
            }
            Ok(text) => {
                self.process = Some(process);
                Ok(Reply {
                    text,
                    streamed: false,
                })
            }
            Err(err) => {
                // A broken child is dropped here (and killed), the next message starts afresh.
                process.kill().await;
                Err(err)
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }
    }

    fn name(&self) -> &'static str {
        "pipe"
    }
}
