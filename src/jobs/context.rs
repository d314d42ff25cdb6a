//! Per-job execution context: transport, settings, cover cache and cancellation.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::cache::CoverCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{FetchRequest, RedirectPolicy, Transport};
use crate::types::JobId;

/// Everything a running job may touch
///
/// Every asynchronous resume point calls [`JobContext::checkpoint`] first; a
/// cancelled job stops issuing requests and unwinds with [`Error::Cancelled`].
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    transport: Arc<dyn Transport>,
    config: Arc<Config>,
    cache: Arc<CoverCache>,
    token: CancellationToken,
    base_url: Url,
    redirect_policy: RedirectPolicy,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.id)
            .field("base_url", &self.base_url.as_str())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub(crate) fn new(
        id: JobId,
        transport: Arc<dyn Transport>,
        config: Arc<Config>,
        cache: Arc<CoverCache>,
        token: CancellationToken,
    ) -> Result<Self> {
        let base_url = Url::parse(&config.site.base_url).map_err(|e| Error::Config {
            message: format!("invalid base URL '{}': {}", config.site.base_url, e),
            key: Some("site.base_url".to_string()),
        })?;
        let redirect_policy =
            RedirectPolicy::new(config.redirect.allow_list.clone(), config.http.max_redirects);

        Ok(Self {
            id,
            transport,
            config,
            cache,
            token,
            base_url,
            redirect_policy,
        })
    }

    /// Job this context belongs to
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Crate configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared cover cache
    pub fn cache(&self) -> &CoverCache {
        &self.cache
    }

    /// Whether the job was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with [`Error::Cancelled`] once the job has been cancelled
    pub fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve `path` against the site base URL
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Validation(format!("invalid endpoint '{}': {}", path, e)))
    }

    fn request(&self, url: &str) -> FetchRequest {
        FetchRequest::new(url)
            .redirect(self.redirect_policy.mode_for(url))
            .header("Referer", self.base_url.as_str())
            .timeout(self.config.http.request_timeout)
    }

    /// GET `url` and buffer the body; cancellation interrupts the request
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.checkpoint()?;
        let request = self.request(url);
        let bytes = tokio::select! {
            _ = self.token.cancelled() => return Err(Error::Cancelled),
            bytes = self.transport.get_bytes(&request) => bytes?,
        };
        self.checkpoint()?;
        Ok(bytes)
    }

    /// GET `url` as text
    pub async fn fetch_text(&self, url: &Url) -> Result<String> {
        let bytes = self.fetch_bytes(url.as_str()).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// GET `url` and decode the JSON body
    ///
    /// A body that does not match `T` is a parse error.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T> {
        let bytes = self.fetch_bytes(url.as_str()).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Parse(format!("unexpected response from {}: {}", url, e)))
    }
}
