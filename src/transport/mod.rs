//! Network transport abstraction
//!
//! Jobs and the download orchestrator never talk to `reqwest` directly. They
//! issue [`FetchRequest`]s through the [`Transport`] trait, which lets tests
//! substitute scripted responses and keeps the redirect policy in one place.

mod http;
mod redirect;

pub use http::ReqwestTransport;
pub use redirect::{RedirectDecision, RedirectPolicy};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::TransportError;

/// How a transport treats 3xx responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RedirectMode {
    /// Follow redirects that stay on the same origin, reject the rest
    #[default]
    FollowSameOrigin,
    /// Never follow; the 3xx response is returned to the caller
    Manual,
    /// Hold each redirect and follow only after checking the target against
    /// the allow-list rule for the issuing host
    UserVerified,
}

/// One outgoing request
#[derive(Clone, Debug, Default)]
pub struct FetchRequest {
    /// Absolute URL
    pub url: String,
    /// Request headers (`Referer`, `Range`, auth, ...)
    pub headers: Vec<(String, String)>,
    /// Redirect handling
    pub redirect: RedirectMode,
    /// Whole-request deadline; `None` for streaming transfers
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// Request `url` with no headers and the default redirect mode
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the redirect mode
    pub fn redirect(mut self, mode: RedirectMode) -> Self {
        self.redirect = mode;
        self
    }

    /// Set a whole-request deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Look up a header value (case-insensitive)
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status line and headers of a response
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// HTTP status code
    pub status: u16,
    /// URL of the response after redirects
    pub final_url: String,
    /// `Content-Length` if the server sent one
    pub content_length: Option<u64>,
    /// Redirect target for 3xx responses returned in manual mode
    pub location: Option<String>,
}

impl ResponseMeta {
    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success status into [`TransportError::Status`]
    pub fn error_for_status(&self) -> Result<(), TransportError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: self.status,
                url: self.final_url.clone(),
            })
        }
    }
}

/// Body chunks in the order they arrived
pub type BodyStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// A response whose body is still streaming
pub struct TransportResponse {
    /// Status and headers
    pub meta: ResponseMeta,
    /// Body chunks
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// Collect the whole body
    pub async fn bytes(mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::with_capacity(self.meta.content_length.unwrap_or(0) as usize);
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }

    /// Collect the whole body as UTF-8 text (lossy)
    pub async fn text(self) -> Result<String, TransportError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Transport provider
///
/// Each call completes exactly once with success or error. Progress is
/// observed by consuming [`TransportResponse::body`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Metadata-only request
    async fn head(&self, request: &FetchRequest) -> Result<ResponseMeta, TransportError>;

    /// Full request with a streaming body
    async fn get(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError>;

    /// GET that fails on a non-success status and buffers the body
    async fn get_bytes(&self, request: &FetchRequest) -> Result<Vec<u8>, TransportError> {
        let response = self.get(request).await?;
        response.meta.error_for_status()?;
        response.bytes().await
    }

    /// GET that fails on a non-success status and returns the body as text
    async fn get_text(&self, request: &FetchRequest) -> Result<String, TransportError> {
        let bytes = self.get_bytes(request).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let request = FetchRequest::new("https://example.com/a")
            .header("Referer", "https://example.com/")
            .header("range", "bytes=10-");

        assert_eq!(request.header_value("referer"), Some("https://example.com/"));
        assert_eq!(request.header_value("Range"), Some("bytes=10-"));
        assert_eq!(request.header_value("cookie"), None);
    }

    #[test]
    fn non_success_status_becomes_error() {
        let meta = ResponseMeta {
            status: 404,
            final_url: "https://example.com/missing".into(),
            ..Default::default()
        };

        assert_eq!(
            meta.error_for_status(),
            Err(TransportError::Status {
                status: 404,
                url: "https://example.com/missing".into()
            })
        );
        assert!(
            ResponseMeta {
                status: 206,
                ..Default::default()
            }
            .is_success()
        );
    }

    #[tokio::test]
    async fn response_collects_chunks_in_order() {
        let chunks: Vec<Result<Vec<u8>, TransportError>> =
            vec![Ok(b"ab".to_vec()), Ok(b"cd".to_vec())];
        let response = TransportResponse {
            meta: ResponseMeta::default(),
            body: futures::stream::iter(chunks).boxed(),
        };

        assert_eq!(response.text().await.unwrap(), "abcd");
    }
}
