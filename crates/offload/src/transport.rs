use std::{io, time::Duration};

use reqwest::{blocking::Client, header::CONTENT_TYPE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("io error: {0}")]
    Io(io::Error),
    #[error("mqtt error: {0}")]
    Mqtt(String),
    #[error("sink misconfigured: {0}")]
    Config(String),
}

impl TransportError {
    /// Timeout-class errors are retried; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Http(err)
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            _ => TransportError::Io(err),
        }
    }
}

/// Blocking client for plain-text status posts.
pub trait Transport: Send {
    /// POST `body` as `text/plain; charset=utf-8` and return the status code.
    fn post_plain_text(
        &mut self,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<u16, TransportError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn post_plain_text(
        &mut self,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body.to_vec())
            .send()?;
        Ok(response.status().as_u16())
    }
}

/// Shared reqwest client configuration for the transport and HTTP sinks.
pub fn build_client() -> Result<Client, TransportError> {
    Client::builder()
        .user_agent(concat!("facewatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(TransportError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_are_transient() {
        let err = TransportError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_transient());
        let err = TransportError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(!err.is_transient());
        assert!(!TransportError::Status(503).is_transient());
    }
}
