#![doc = include_str!("../README.md")]

pub mod backend;
pub mod config;
pub mod history;
pub mod http_request;
pub mod json_scan;
pub mod ollama;
pub mod session;
#[cfg(test)]
mod test_server;
pub mod transport;

use std::{io, sync::Arc};

pub use http_request::HttpRequest;
use ollama::{GenerateBody, GenerateOptions};

/// An Ollama endpoint configuration.
#[derive(Clone, Debug)]
pub struct Api {
    /// The endpoint host, including the port (without protocol or path).
    endpoint_host: Arc<str>,
    /// The default model to use for requests.
    default_model: Arc<str>,
    /// Sampling options sent with every request.
    options: GenerateOptions,
}

impl Api {
    /// Creates a new API instance pointing at the default loopback endpoint.
    pub fn new() -> Self {
        Self {
            endpoint_host: Arc::from(ollama::DEFAULT_ENDPOINT_HOST),
            default_model: Arc::from(ollama::DEFAULT_MODEL),
            options: GenerateOptions::default(),
        }
    }

    /// Sets the default model for requests.
    ///
    /// If not set, [`ollama::DEFAULT_MODEL`] will be used.
    pub fn default_model<S: Into<Arc<str>>>(mut self, model: S) -> Self {
        self.default_model = model.into();
        self
    }

    /// Sets the API endpoint host.
    ///
    /// If not set, [`ollama::DEFAULT_ENDPOINT_HOST`] will be used.
    pub fn endpoint_host<S: Into<Arc<str>>>(mut self, endpoint_host: S) -> Self {
        self.endpoint_host = endpoint_host.into();
        self
    }

    /// Sets the sampling options.
    pub fn options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &str {
        &self.default_model
    }

    pub fn host(&self) -> &str {
        &self.endpoint_host
    }

    /// Builds the health check request, listing the installed models.
    pub fn tags_request(&self) -> HttpRequest {
        HttpRequest {
            host: self.endpoint_host.to_string(),
            path: ollama::TAGS_PATH.to_string(),
            method: "GET",
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Creates the required headers for any request with a body.
    fn create_default_headers(&self) -> Vec<(&'static str, Arc<str>)> {
        vec![("content-type", Arc::from("application/json"))]
    }
}

impl Default for Api {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for requests to the generate endpoint.
#[derive(Debug)]
pub struct GenerateRequestBuilder {
    /// The model to use for the request.
    ///
    /// If none is provided, the default model will be used.
    model: Option<String>,
    /// The complete prompt.
    prompt: String,
    /// Whether to ask for a streamed reply.
    stream: bool,
}

impl GenerateRequestBuilder {
    /// Creates a new, non-streaming request for the given prompt.
    pub fn new<S: Into<String>>(prompt: S) -> Self {
        Self {
            model: None,
            prompt: prompt.into(),
            stream: false,
        }
    }

    /// Sets the model for the request.
    pub fn model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Requests a streamed reply.
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Builds the HTTP request.
    ///
    /// The prompt is JSON-encoded, so arbitrary user text (quotes, newlines, control
    /// characters) is safe to pass.
    pub fn build(&self, api: &Api) -> Result<HttpRequest, Error> {
        let model = self.model.as_deref().unwrap_or(&api.default_model);

        let body = GenerateBody {
            model,
            prompt: &self.prompt,
            stream: self.stream,
            options: &api.options,
        };

        Ok(HttpRequest {
            host: api.endpoint_host.to_string(),
            path: ollama::GENERATE_PATH.to_string(),
            method: "POST",
            headers: api.create_default_headers(),
            body: serde_json::to_string(&body).map_err(Error::Encode)?,
        })
    }
}

/// Creates the HTTP client used for every backend call.
///
/// The backend is always on loopback, so proxy settings from the environment are ignored.
pub fn loopback_client() -> Result<reqwest::Client, Error> {
    Ok(reqwest::Client::builder().no_proxy().build()?)
}

/// A chat client error.
///
/// Every variant except [`Error::BackendUnavailable`] is confined to a single chat turn.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend could not be reached, nor started.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Sending the request or receiving the reply failed.
    #[error("Failed to communicate with Ollama: {0}")]
    Transport(String),
    /// The reply was not valid JSON.
    #[error("Failed to parse Ollama response: {0}")]
    Parse(#[from] serde_json::Error),
    /// The reply parsed but carried neither text nor an error.
    #[error("No response from Ollama")]
    MissingResponse,
    /// The backend reported an error in-band.
    #[error("{0}")]
    Backend(String),
    /// The request body could not be encoded.
    #[error("Failed to encode request: {0}")]
    Encode(serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<json_scan::StreamError> for Error {
    fn from(err: json_scan::StreamError) -> Self {
        Error::Transport(err.to_string())
    }
}
