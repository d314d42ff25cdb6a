//! Configuration types for harvest-dl

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

use crate::error::{Error, Result};
use crate::types::CollisionPolicy;

/// Download orchestration settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Base directory for relative destinations (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum concurrent transfers (default: 3, `<= 0` means unlimited)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: i32,

    /// Collision policy used when a request does not carry one.
    /// `None` asks the collision prompt.
    #[serde(default)]
    pub default_collision: Option<CollisionPolicy>,

    /// Capacity of each task's writer chunk queue (default: 64)
    #[serde(default = "default_chunk_queue_depth")]
    pub chunk_queue_depth: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            default_collision: None,
            chunk_queue_depth: default_chunk_queue_depth(),
        }
    }
}

impl DownloadConfig {
    /// Concurrency ceiling, `None` when unlimited
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.max_concurrent_downloads <= 0 {
            None
        } else {
            Some(self.max_concurrent_downloads as usize)
        }
    }
}

/// HTTP client settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Connect timeout (default: 10 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Whole-request timeout for page and probe requests (default: 30 seconds).
    /// Streaming transfers are bounded only by the connect timeout.
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Maximum redirect hops followed for one request (default: 5)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_redirects: default_max_redirects(),
        }
    }
}

/// One allow-list entry: redirects issued by hosts ending in `host_suffix`
/// are followed only when the target host ends in `allowed_target_suffix`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    /// Suffix of the host that issues the redirect (e.g. "example.net")
    pub host_suffix: String,
    /// Suffix the redirect target host must have (e.g. ".example.net")
    pub allowed_target_suffix: String,
}

/// Redirect policy table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// Hosts whose redirects are held and verified against a target suffix.
    /// Every other host only follows same-origin redirects.
    #[serde(default)]
    pub allow_list: Vec<RedirectRule>,
}

/// Remote site adapter settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Absolute base URL of the site (default: "https://localhost")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Regex that anchors the embedded preload JSON on post pages.
    /// The match must end at the opening brace of the document.
    #[serde(default = "default_preload_anchor")]
    pub preload_anchor: String,

    /// Bookmark page size (default: 48)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Byte budget for id-list queries (default: 1024)
    #[serde(default = "default_max_query_bytes")]
    pub max_query_bytes: usize,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            preload_anchor: default_preload_anchor(),
            page_size: default_page_size(),
            max_query_bytes: default_max_query_bytes(),
        }
    }
}

/// Extraction job settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    /// Window during which a second job of the same kind is dropped (default: 1000 ms)
    #[serde(default = "default_creation_cooldown", with = "millis_serde")]
    pub creation_cooldown: Duration,

    /// Number of processed covers kept for reuse (default: 64)
    #[serde(default = "default_cover_cache_capacity")]
    pub cover_cache_capacity: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            creation_cooldown: default_creation_cooldown(),
            cover_cache_capacity: default_cover_cache_capacity(),
        }
    }
}

/// Cover thumbnail post-processing settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Longest allowed side in pixels (default: 480)
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    /// JPEG quality 1-100 (default: 85)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Main configuration
///
/// Every section has sensible defaults, so `Config::default()` works out of
/// the box once `site.base_url` points at a real site.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download orchestration
    #[serde(default)]
    pub download: DownloadConfig,

    /// HTTP client
    #[serde(default)]
    pub http: HttpConfig,

    /// Redirect allow-list
    #[serde(default)]
    pub redirect: RedirectConfig,

    /// Remote site adapter
    #[serde(default)]
    pub site: SiteConfig,

    /// Extraction jobs
    #[serde(default)]
    pub jobs: JobConfig,

    /// Cover post-processing
    #[serde(default)]
    pub images: ImageConfig,
}

impl Config {
    /// Load a JSON configuration file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot
    pub fn validate(&self) -> Result<()> {
        let base = url::Url::parse(&self.site.base_url).map_err(|e| Error::Config {
            message: format!("base_url '{}' is not absolute: {}", self.site.base_url, e),
            key: Some("site.base_url".to_string()),
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::Config {
                message: format!("base_url '{}' cannot be a base", self.site.base_url),
                key: Some("site.base_url".to_string()),
            });
        }

        Regex::new(&self.site.preload_anchor).map_err(|e| Error::Config {
            message: format!("invalid preload anchor: {}", e),
            key: Some("site.preload_anchor".to_string()),
        })?;

        if self.images.jpeg_quality == 0 || self.images.jpeg_quality > 100 {
            return Err(Error::Config {
                message: format!("jpeg_quality {} outside 1-100", self.images.jpeg_quality),
                key: Some("images.jpeg_quality".to_string()),
            });
        }

        if self.images.max_dimension == 0 {
            return Err(Error::Config {
                message: "max_dimension must be positive".to_string(),
                key: Some("images.max_dimension".to_string()),
            });
        }

        if self.site.page_size == 0 {
            return Err(Error::Config {
                message: "page_size must be positive".to_string(),
                key: Some("site.page_size".to_string()),
            });
        }

        Ok(())
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> i32 {
    3
}

fn default_chunk_queue_depth() -> usize {
    64
}

fn default_user_agent() -> String {
    concat!("harvest-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_redirects() -> usize {
    5
}

fn default_base_url() -> String {
    "https://localhost".to_string()
}

fn default_preload_anchor() -> String {
    r#"id="preload-data"[^>]*>\s*\{"#.to_string()
}

fn default_page_size() -> usize {
    48
}

fn default_max_query_bytes() -> usize {
    1024
}

fn default_creation_cooldown() -> Duration {
    Duration::from_millis(1000)
}

fn default_cover_cache_capacity() -> usize {
    64
}

fn default_max_dimension() -> u32 {
    480
}

fn default_jpeg_quality() -> u8 {
    85
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
