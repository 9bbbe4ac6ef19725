//! Client configuration, read from a TOML file.
//!
//! Every field has a default, so a missing file or a partial file is fine. Command line flags
//! are applied on top of the loaded values by the binary.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    Api,
    history::{self, Speakers},
    ollama::{self, GenerateOptions},
    transport,
};

/// A configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How messages reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One stateless request per message.
    Http,
    /// One request per message, carrying the recent conversation as context.
    #[default]
    Context,
    /// A long-running `ollama run` child fed through its standard input.
    Pipe,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub model: ModelConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Host and port of the Ollama server.
    pub host: String,
    pub transport: TransportKind,
    /// Command used to start the server when it is not running.
    pub serve_command: Vec<String>,
    /// Command spawned by the pipe transport. Required when that transport is selected.
    ///
    /// `ollama run` reads its whole input before answering when it is not attached to a
    /// terminal, so it cannot be used directly.
    pub pipe_command: Option<Vec<String>>,
    /// Line the pipe child prints after each complete reply.
    pub pipe_terminator: String,
    /// Time to wait after starting the server before probing it again.
    pub startup_grace_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: ollama::DEFAULT_ENDPOINT_HOST.to_string(),
            transport: TransportKind::default(),
            serve_command: vec!["ollama".to_string(), "serve".to_string()],
            pipe_command: None,
            pipe_terminator: transport::DEFAULT_TERMINATOR.to_string(),
            startup_grace_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    /// Print replies as they are generated.
    pub stream: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let options = GenerateOptions::default();
        Self {
            name: ollama::DEFAULT_MODEL.to_string(),
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name the assistant speaks under.
    pub persona: String,
    /// Label of the user's turns in the transcript.
    pub user_label: String,
    /// Extra commands ending the session, besides `exit` and `quit`.
    pub exit_aliases: Vec<String>,
    pub history_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persona: "TRON".to_string(),
            user_label: "User".to_string(),
            exit_aliases: vec!["end of line".to_string()],
            history_capacity: history::DEFAULT_CAPACITY,
        }
    }
}

impl Config {
    /// Default location, `<config dir>/tron/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_default()
            .join("tron")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file, returning defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Checks values that parse fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.serve_command.is_empty() {
            return Err(ConfigError::Invalid(
                "backend.serve_command must not be empty".to_string(),
            ));
        }
        if self.backend.host.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.host must not be empty".to_string()));
        }
        match &self.backend.pipe_command {
            Some(command) if command.is_empty() => {
                return Err(ConfigError::Invalid(
                    "backend.pipe_command must not be empty".to_string(),
                ));
            }
            None if self.backend.transport == TransportKind::Pipe => {
                return Err(ConfigError::Invalid(
                    "the pipe transport needs backend.pipe_command, a program answering one line \
                     per message and ending each reply with backend.pipe_terminator"
                        .to_string(),
                ));
            }
            _ => {}
        }
        if self.backend.pipe_terminator.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "backend.pipe_terminator must not be empty".to_string(),
            ));
        }
        if self.session.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.history_capacity must be at least 1".to_string(),
            ));
        }
        if self.model.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model.name must not be empty".to_string()));
        }
        Ok(())
    }

    /// The API description derived from the backend and model sections.
    pub fn api(&self) -> Api {
        Api::new()
            .endpoint_host(self.backend.host.as_str())
            .default_model(self.model.name.as_str())
            .options(GenerateOptions {
                temperature: self.model.temperature,
                top_p: self.model.top_p,
                max_tokens: self.model.max_tokens,
            })
    }

    pub fn speakers(&self) -> Speakers {
        Speakers {
            user: self.session.user_label.as_str().into(),
            assistant: self.session.persona.as_str().into(),
        }
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.backend.startup_grace_ms)
    }

    /// Command line of the pipe transport's child, empty if none is configured.
    pub fn pipe_command(&self) -> Vec<String> {
        self.backend.pipe_command.clone().unwrap_or_default()
    }

    /// Every input that ends the session, lowercased.
    pub fn exit_commands(&self) -> Vec<String> {
        ["exit", "quit"]
            .into_iter()
            .map(str::to_string)
            .chain(
                self.session
                    .exit_aliases
                    .iter()
                    .map(|alias| alias.trim().to_lowercase()),
            )
            .collect()
    }
}
