//! Client-agnostic description of a backend call.
//!
//! Request construction in this crate never touches the network. [`crate::Api`] and
//! [`crate::GenerateRequestBuilder`] produce an [`HttpRequest`], and only the code that actually
//! sends it converts it into a [`reqwest::RequestBuilder`].

use std::{fmt, sync::Arc};

use crate::Error;

/// A fully assembled request to the Ollama server.
///
/// Its [`fmt::Display`] form is a wire-like dump, logged at trace level before sending.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// `host:port` of the server.
    pub host: String,
    pub path: String,
    pub method: &'static str,
    pub headers: Vec<(&'static str, Arc<str>)>,
    /// JSON payload, empty for `GET`.
    pub body: String,
}

impl HttpRequest {
    /// Absolute URL. The server is local, so the scheme is always `http`.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.host, self.path)
    }

    /// Prepares the request on `client`, ready to be sent.
    pub fn try_into_reqwest_builder(
        self,
        client: &reqwest::Client,
    ) -> Result<reqwest::RequestBuilder, Error> {
        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|err| Error::Transport(format!("invalid method `{}`: {err}", self.method)))?;
        let url = reqwest::Url::parse(&self.url())
            .map_err(|err| Error::Transport(format!("invalid backend address `{}`: {err}", self.host)))?;

        let builder = self
            .headers
            .iter()
            .fold(client.request(method, url), |builder, (name, value)| {
                builder.header(*name, value.as_ref())
            });

        Ok(if self.body.is_empty() {
            builder
        } else {
            builder.body(self.body)
        })
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} HTTP/1.1\nHost: {}\n", self.method, self.path, self.host)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}: {value}")?;
        }
        write!(f, "\n{}", self.body)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::HttpRequest;

    fn generate_request() -> HttpRequest {
        HttpRequest {
            host: "localhost:11434".to_string(),
            path: "/api/generate".to_string(),
            method: "POST",
            headers: vec![("content-type", Arc::from("application/json"))],
            body: r#"{"model":"tron","prompt":"Greetings, program.","stream":false}"#.to_string(),
        }
    }

    #[test]
    fn test_converts_post_with_headers_and_body() {
        let request = generate_request()
            .try_into_reqwest_builder(&reqwest::Client::new())
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(request.method(), &reqwest::Method::POST);
        assert_eq!(request.url().as_str(), "http://localhost:11434/api/generate");
        assert_eq!(request.headers()["content-type"], "application/json");

        let body = request.body().and_then(|body| body.as_bytes()).unwrap();
        assert!(std::str::from_utf8(body).unwrap().contains("Greetings, program."));
    }

    #[test]
    fn test_get_without_body() {
        let tags = HttpRequest {
            path: "/api/tags".to_string(),
            method: "GET",
            headers: Vec::new(),
            body: String::new(),
            ..generate_request()
        };

        let request = tags
            .try_into_reqwest_builder(&reqwest::Client::new())
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(request.method(), &reqwest::Method::GET);
        assert!(request.body().is_none());
    }

    #[test]
    fn test_bad_host_is_a_transport_error() {
        let request = HttpRequest {
            host: "local host:11434".to_string(),
            ..generate_request()
        };

        assert!(matches!(
            request.try_into_reqwest_builder(&reqwest::Client::new()),
            Err(crate::Error::Transport(_))
        ));
    }

    #[test]
    fn test_display_dump() {
        assert_eq!(
            generate_request().to_string(),
            "POST /api/generate HTTP/1.1\nHost: localhost:11434\ncontent-type: application/json\n\n\
             {\"model\":\"tron\",\"prompt\":\"Greetings, program.\",\"stream\":false}"
        );
    }
}
