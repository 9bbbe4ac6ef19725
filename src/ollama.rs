//! Ollama API related types.
//!
//! This module contains the subset of the Ollama HTTP API that the client talks to: the
//! `tags` endpoint used as a health check and the `generate` endpoint used for chatting.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default API endpoint host to use, Ollama's loopback listener.
pub const DEFAULT_ENDPOINT_HOST: &str = "localhost:11434";

/// Default model to use for requests.
pub const DEFAULT_MODEL: &str = "tron";

/// Path of the completion endpoint.
pub const GENERATE_PATH: &str = "/api/generate";

/// Path of the model listing endpoint, doubling as the health check.
pub const TAGS_PATH: &str = "/api/tags";

/// The body of a request to the generate endpoint.
///
/// Usually it is better to use [`crate::GenerateRequestBuilder`] instead.
#[derive(Debug, Serialize)]
pub struct GenerateBody<'a> {
    /// The model to use for the request.
    pub model: &'a str,
    /// The full prompt text.
    pub prompt: &'a str,
    /// Whether the server should stream the reply as a sequence of objects.
    pub stream: bool,
    /// Sampling options.
    pub options: &'a GenerateOptions,
}

/// Sampling options sent along with every generate request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub top_p: f32,
    /// Upper bound on generated tokens, called `num_predict` by Ollama.
    #[serde(rename(serialize = "num_predict"))]
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 1000,
        }
    }
}

/// A response (or, when streaming, one chunk of a response) from the generate endpoint.
///
/// Ollama reports failures in-band through the `error` field, frequently with a non-success
/// status code, so both fields are optional.
#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of the tags endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
}

impl TagsResponse {
    /// Checks whether a model is installed.
    ///
    /// Ollama lists models with their tag, and a bare name refers to the `latest` tag.
    pub fn has_model(&self, model: &str) -> bool {
        let latest = format!("{model}:latest");
        self.models
            .iter()
            .any(|info| info.name == model || info.name == latest)
    }
}

/// Deserializes a complete, non-streamed generate response and extracts the reply text.
pub fn deserialize_response(json: &str) -> Result<String, Error> {
    let response: GenerateResponse = serde_json::from_str(json)?;

    match response {
        GenerateResponse {
            response: Some(text),
            ..
        } if !text.is_empty() => Ok(text),
        GenerateResponse {
            error: Some(error), ..
        } => Err(Error::Backend(error)),
        _ => Err(Error::MissingResponse),
    }
}

/// A single decoded chunk of a streamed reply.
#[derive(Debug, PartialEq)]
pub struct Chunk {
    /// Text fragment, may be empty.
    pub text: String,
    /// Set on the final chunk.
    pub done: bool,
}

/// Deserializes one object of a streamed generate response.
pub fn deserialize_chunk(json: &[u8]) -> Result<Chunk, Error> {
    let response: GenerateResponse = serde_json::from_slice(json)?;

    if let Some(error) = response.error {
        return Err(Error::Backend(error));
    }

    Ok(Chunk {
        text: response.response.unwrap_or_default(),
        done: response.done,
    })
}

/// Deserializes the tags endpoint response.
pub fn deserialize_tags(json: &str) -> Result<TagsResponse, Error> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_text_is_extracted() {
        let json = r#"{
  "model": "tron",
  "created_at": "2024-01-01T00:00:00Z",
  "response": "Greetings, User.",
  "done": true,
  "total_duration": 5589157167
}"#;

        assert_eq!(deserialize_response(json).unwrap(), "Greetings, User.");
    }

    #[test]
    fn test_error_field_becomes_backend_error() {
        let json = r#"{"error":"model 'tron' not found, try pulling it first"}"#;

        match deserialize_response(json) {
            Err(Error::Backend(message)) => {
                assert_eq!(message, "model 'tron' not found, try pulling it first")
            }
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_response_without_error_is_missing() {
        assert!(matches!(
            deserialize_response(r#"{"response":"","done":true}"#),
            Err(Error::MissingResponse)
        ));
        assert!(matches!(
            deserialize_response(r#"{"done":true}"#),
            Err(Error::MissingResponse)
        ));
    }

    #[test]
    fn test_malformed_body_is_parse_error() {
        assert!(matches!(
            deserialize_response("404 page not found"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_chunk_deserialization() {
        let chunk = deserialize_chunk(br#"{"model":"tron","response":"Hel","done":false}"#)
            .expect("should deserialize chunk");
        assert_eq!(
            chunk,
            Chunk {
                text: "Hel".to_string(),
                done: false
            }
        );

        let last = deserialize_chunk(br#"{"model":"tron","response":"","done":true}"#).unwrap();
        assert!(last.done);
        assert!(last.text.is_empty());

        assert!(matches!(
            deserialize_chunk(br#"{"error":"out of memory"}"#),
            Err(Error::Backend(_))
        ));
    }

    #[test]
    fn test_tags_model_lookup() {
        let tags = deserialize_tags(
            r#"{"models":[{"name":"tron:latest","size":123},{"name":"llama3.2:1b"}]}"#,
        )
        .unwrap();

        assert!(tags.has_model("tron"));
        assert!(tags.has_model("tron:latest"));
        assert!(tags.has_model("llama3.2:1b"));
        assert!(!tags.has_model("llama3.2"));
        assert!(!tags.has_model("mistral"));
    }

    #[test]
    fn test_bare_name_only_matches_latest_tag() {
        let tags = deserialize_tags(r#"{"models":[{"name":"tron:7b"}]}"#).unwrap();

        assert!(!tags.has_model("tron"));
        assert!(tags.has_model("tron:7b"));
    }

    #[test]
    fn test_options_serialize_with_ollama_names() {
        let json = serde_json::to_string(&GenerateOptions::default()).unwrap();

        assert!(json.contains("\"temperature\":0.7"));
        assert!(json.contains("\"top_p\":0.9"));
        assert!(json.contains("\"num_predict\":1000"));
    }
}
