use std::{
    io::{self, Read},
    time::Duration,
};

use reqwest::blocking::Client;
use thiserror::Error;

/// A single request header, name then value.
pub type Header = (String, String);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("failed reading response body")]
    Body(#[from] io::Error),
}

/// Metadata returned by a `HEAD` probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Probe {
    pub status: u16,
    pub etag: Option<String>,
    pub accept_ranges: Option<String>,
    pub content_length: Option<u64>,
}

impl Probe {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn supports_ranges(&self) -> bool {
        self.accept_ranges
            .as_deref()
            .map(|value| !value.trim().is_empty() && value.trim() != "none")
            .unwrap_or(false)
    }
}

/// A `GET` response whose body has not been read yet.
pub struct Response {
    pub status: u16,
    pub content_length: Option<u64>,
    body: Box<dyn Read + Send>,
}

impl Response {
    pub fn new(status: u16, content_length: Option<u64>, body: Box<dyn Read + Send>) -> Self {
        Self {
            status,
            content_length,
            body,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body(&mut self) -> &mut (dyn Read + Send + 'static) {
        self.body.as_mut()
    }

    /// Drains the body into memory.
    pub fn into_content(mut self) -> Result<Content, TransportError> {
        let mut body = Vec::new();
        self.body.read_to_end(&mut body)?;
        Ok(Content {
            status: self.status,
            body,
        })
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// A fully buffered response, used for small JSON documents.
#[derive(Debug, Clone)]
pub struct Content {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Content {
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The only way this crate touches the network.
pub trait Transport: Send + Sync {
    fn head(&self, url: &str, headers: &[Header]) -> Result<Probe, TransportError>;

    fn get(&self, url: &str, headers: &[Header]) -> Result<Response, TransportError>;

    fn get_content(&self, url: &str, headers: &[Header]) -> Result<Content, TransportError> {
        self.get(url, headers)?.into_content()
    }
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Option<Duration>) -> Result<Self, TransportError> {
        // `None` disables the blocking client's default 30s total timeout.
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn head(&self, url: &str, headers: &[Header]) -> Result<Probe, TransportError> {
        let mut request = self.client.head(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Ok(Probe {
            status: response.status().as_u16(),
            etag: header("etag"),
            accept_ranges: header("accept-ranges"),
            content_length: header("content-length").and_then(|value| value.parse().ok()),
        })
    }

    fn get(&self, url: &str, headers: &[Header]) -> Result<Response, TransportError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Response::new(
            response.status().as_u16(),
            response.content_length(),
            Box::new(response),
        ))
    }
}
