//! Outbound HTTP transport

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;

use crate::error::DeliveryError;

/// A fully prepared webhook POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends a request and reports the response status.
///
/// Errors are for failures that never produced a status (refused
/// connection, reset, timeout) and are classified by the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest, timeout: Duration) -> Result<u16, DeliveryError>;
}

/// Map a response status onto the delivery outcome
pub fn classify_status(status: u16) -> Result<(), DeliveryError> {
    match status {
        200..=299 => Ok(()),
        429 | 500..=599 => Err(DeliveryError::Transient(format!("destination returned {}", status))),
        other => Err(DeliveryError::Permanent(format!("destination returned {}", other))),
    }
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::Permanent(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn build_headers(request: &OutboundRequest) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| DeliveryError::Permanent(format!("invalid header name {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| DeliveryError::Permanent(format!("invalid value for header {}", name)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutboundRequest, timeout: Duration) -> Result<u16, DeliveryError> {
        let headers = Self::build_headers(request)?;
        let response = self
            .client
            .post(&request.url)
            .headers(headers)
            .body(request.body.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_builder() {
                    DeliveryError::Permanent(err.to_string())
                } else if err.is_timeout() {
                    DeliveryError::Transient(format!("timed out after {:?}", timeout))
                } else {
                    // Connect failures, resets and other I/O errors
                    DeliveryError::Transient(err.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(200).is_ok());
        assert!(classify_status(204).is_ok());
        assert!(classify_status(503).unwrap_err().is_retryable());
        assert!(classify_status(429).unwrap_err().is_retryable());
        assert!(!classify_status(404).unwrap_err().is_retryable());
        assert!(!classify_status(410).unwrap_err().is_retryable());
        assert!(matches!(classify_status(302), Err(DeliveryError::Permanent(_))));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = OutboundRequest {
            url: "https://hooks.example.com".into(),
            headers: vec![("X-Contract-Event".into(), "proposal.created".into())],
            body: "{}".into(),
        };
        assert_eq!(request.header("x-contract-event"), Some("proposal.created"));
        assert!(request.header("x-contract-signature").is_none());
    }

    #[test]
    fn test_bad_header_is_permanent() {
        let request = OutboundRequest {
            url: "https://hooks.example.com".into(),
            headers: vec![("bad header".into(), "v".into())],
            body: "{}".into(),
        };
        assert!(matches!(
            HttpTransport::build_headers(&request),
            Err(DeliveryError::Permanent(_))
        ));
    }
}
