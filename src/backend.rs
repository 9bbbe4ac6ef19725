//! The model-serving process behind the chat.
//!
//! A [`Backend`] can tell whether the server answers and, if it does not, try to start it.
//! [`OllamaServer`] probes the tags endpoint and spawns `ollama serve` as a child process that
//! it owns until [`Backend::shutdown`] is called.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{Api, Error, ollama};

/// Time allowed for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Backend: Send + Sync {
    /// Checks whether the backend currently answers requests.
    async fn is_available(&self) -> bool;

    /// Starts the backend process. Returns once the process was spawned, not once it is ready.
    async fn start(&mut self) -> Result<(), Error>;

    /// Terminates the backend process if this instance started it.
    async fn shutdown(&mut self);

    /// Whether a process started by this instance is being held.
    fn owns_process(&self) -> bool;

    /// Checks whether the configured model is installed. `None` if it cannot be determined.
    async fn has_model(&self) -> Option<bool> {
        None
    }
}

/// An Ollama server on the loopback interface.
#[derive(Debug)]
pub struct OllamaServer {
    api: Api,
    client: reqwest::Client,
    serve_command: Vec<String>,
    child: Option<Child>,
}

impl OllamaServer {
    pub fn new(api: Api, client: reqwest::Client, serve_command: Vec<String>) -> Self {
        Self {
            api,
            client,
            serve_command,
            child: None,
        }
    }

    async fn fetch_tags(&self) -> Result<ollama::TagsResponse, Error> {
        let response = self
            .api
            .tags_request()
            .try_into_reqwest_builder(&self.client)?
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        ollama::deserialize_tags(&response.text().await?)
    }
}

#[async_trait]
impl Backend for OllamaServer {
    async fn is_available(&self) -> bool {
        let request = match self.api.tags_request().try_into_reqwest_builder(&self.client) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "cannot build health check request");
                return false;
            }
        };

        match request.timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(host = self.api.host(), "backend is available");
                true
            }
            Ok(response) => {
                debug!(status = %response.status(), "health check returned an error status");
                false
            }
            Err(err) => {
                debug!(%err, "health check failed");
                false
            }
        }
    }

    async fn start(&mut self) -> Result<(), Error> {
        let Some((program, args)) = self.serve_command.split_first() else {
            return Err(Error::BackendUnavailable("no serve command configured".to_string()));
        };

        info!(program = %program, ?args, "starting backend");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::BackendUnavailable(format!("failed to start `{program}`: {err}"))
            })?;

        debug!(pid = ?child.id(), "backend process spawned");
        self.child = Some(child);
        Ok(())
    }

    async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        info!(pid = ?child.id(), "stopping backend");
        if let Err(err) = child.kill().await {
            warn!(%err, "failed to stop backend process");
        }
    }

    fn owns_process(&self) -> bool {
        self.child.is_some()
    }

    async fn has_model(&self) -> Option<bool> {
        match self.fetch_tags().await {
            Ok(tags) => Some(tags.has_model(self.api.model())),
            Err(err) => {
                debug!(%err, "could not list models");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server;

    fn server(host: &str, serve_command: &[&str]) -> OllamaServer {
        OllamaServer::new(
            Api::new().endpoint_host(host),
            crate::loopback_client().unwrap(),
            serve_command.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_available_backend_is_detected() {
        let (host, mut requests) =
            test_server::serve("200 OK", r#"{"models":[{"name":"tron:latest"}]}"#).await;
        let backend = server(&host, &["ollama", "serve"]);

        assert!(backend.is_available().await);
        assert!(requests.recv().await.unwrap().head.starts_with("GET /api/tags "));
        assert_eq!(backend.has_model().await, Some(true));
        assert!(!backend.owns_process());
    }

    #[tokio::test]
    async fn test_missing_model_is_reported() {
        let (host, _requests) = test_server::serve("200 OK", r#"{"models":[]}"#).await;
        let backend = server(&host, &["ollama", "serve"]);

        assert_eq!(backend.has_model().await, Some(false));
    }

    #[tokio::test]
    async fn test_error_status_is_unavailable() {
        let (host, _requests) = test_server::serve("500 Internal Server Error", "{}").await;

        assert!(!server(&host, &["ollama", "serve"]).is_available().await);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let host = test_server::unused_host().await;
        let backend = server(&host, &["ollama", "serve"]);

        assert!(!backend.is_available().await);
        assert_eq!(backend.has_model().await, None);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_start() {
        let mut backend = server("127.0.0.1:1", &["definitely-not-an-ollama-binary"]);

        assert!(matches!(
            backend.start().await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(!backend.owns_process());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_owned_process() {
        let mut backend = server("127.0.0.1:1", &["sleep", "30"]);

        backend.start().await.unwrap();
        assert!(backend.owns_process());

        backend.shutdown().await;
        assert!(!backend.owns_process());

        // Idempotent.
        backend.shutdown().await;
    }
}
