//! `reqwest`-backed transport with manual redirect handling

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Method, header};
use std::collections::HashSet;
use url::Url;

use super::{
    FetchRequest, RedirectDecision, RedirectPolicy, ResponseMeta, Transport, TransportResponse,
};
use crate::config::{HttpConfig, RedirectConfig};
use crate::error::TransportError;

/// Headers that must not follow a redirect to another origin
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

/// HTTP transport over a shared `reqwest::Client`
///
/// Automatic redirects are disabled on the client. Every 3xx hop is checked
/// against the [`RedirectPolicy`] before it is followed.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    policy: RedirectPolicy,
}

impl ReqwestTransport {
    /// Build the client from HTTP and redirect settings
    pub fn new(http: &HttpConfig, redirect: &RedirectConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(http.user_agent.clone())
            .connect_timeout(http.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            policy: RedirectPolicy::new(redirect.allow_list.clone(), http.max_redirects),
        })
    }

    /// The redirect policy in use
    pub fn policy(&self) -> &RedirectPolicy {
        &self.policy
    }

    async fn send(
        &self,
        method: Method,
        request: &FetchRequest,
    ) -> Result<reqwest::Response, TransportError> {
        let mut current = parse_url(&request.url)?;
        let mut headers = request.headers.clone();
        let mut visited = HashSet::from([current.to_string()]);
        let mut hops = 0usize;

        loop {
            let mut builder = self.client.request(method.clone(), current.clone());
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let response = builder.send().await?;
            if !response.status().is_redirection() {
                return Ok(response);
            }

            let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(response);
            };
            let target = current
                .join(location)
                .map_err(|e| TransportError::Other(format!("bad redirect location: {}", e)))?;

            match self.policy.decide(request.redirect, &current, &target) {
                RedirectDecision::Return => return Ok(response),
                RedirectDecision::Block => {
                    tracing::warn!(
                        from = %current,
                        to = %target,
                        "Redirect blocked by policy"
                    );
                    return Err(TransportError::RedirectBlocked {
                        from: current.to_string(),
                        to: target.to_string(),
                    });
                }
                RedirectDecision::Follow => {}
            }

            hops += 1;
            if hops > self.policy.max_redirects() {
                return Err(TransportError::TooManyRedirects(self.policy.max_redirects()));
            }
            if !visited.insert(target.to_string()) {
                return Err(TransportError::RedirectLoop(target.to_string()));
            }

            if current.origin() != target.origin() {
                headers.retain(|(name, _)| {
                    !CREDENTIAL_HEADERS
                        .iter()
                        .any(|h| name.eq_ignore_ascii_case(h))
                });
            }

            tracing::debug!(from = %current, to = %target, hop = hops, "Following redirect");
            current = target;
        }
    }
}

fn parse_url(raw: &str) -> Result<Url, TransportError> {
    Url::parse(raw).map_err(|e| TransportError::Other(format!("invalid URL '{}': {}", raw, e)))
}

fn meta_of(response: &reqwest::Response) -> ResponseMeta {
    ResponseMeta {
        status: response.status().as_u16(),
        final_url: response.url().to_string(),
        content_length: response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
        location: response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn head(&self, request: &FetchRequest) -> Result<ResponseMeta, TransportError> {
        let response = self.send(Method::HEAD, request).await?;
        Ok(meta_of(&response))
    }

    async fn get(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        let response = self.send(Method::GET, request).await?;
        let meta = meta_of(&response);
        let body = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(TransportError::from)
            .boxed();

        Ok(TransportResponse { meta, body })
    }
}
