//! Fetch client: one bounded HTTP GET per call.
//!
//! Sends browser-like headers (some invoicing portals refuse unknown
//! agents), follows a limited number of redirects and stops reading once
//! the body exceeds the size cap. Every failure comes back as a typed
//! [`FetchError`], never a panic.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::{redirect::Policy, Client};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ConfigError, FetchError};
use crate::pipeline::content::{classify_content_type, ContentClass};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,application/pdf,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "es-ES,es;q=0.8,en-US;q=0.5,en;q=0.3";

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    /// Bodies larger than this are abandoned with [`FetchError::TooLarge`].
    pub max_bytes: usize,
    pub max_redirects: usize,
    pub user_agent: String,
    pub accept_language: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 20 * 1024 * 1024,
            max_redirects: 10,
            user_agent: DEFAULT_USER_AGENT.into(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.into(),
        }
    }
}

impl FetchConfig {
    /// Load from environment, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timeout_secs = match std::env::var("FETCH_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "FETCH_TIMEOUT_SECS".into(),
                message: e.to_string(),
            })?,
            Err(_) => defaults.timeout.as_secs(),
        };
        let max_bytes = match std::env::var("FETCH_MAX_BYTES") {
            Ok(raw) => raw.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                key: "FETCH_MAX_BYTES".into(),
                message: e.to_string(),
            })?,
            Err(_) => defaults.max_bytes,
        };

        Ok(Self {
            timeout: Duration::from_secs(timeout_secs),
            max_bytes,
            max_redirects: defaults.max_redirects,
            user_agent: std::env::var("FETCH_USER_AGENT").unwrap_or(defaults.user_agent),
            accept_language: std::env::var("FETCH_ACCEPT_LANGUAGE")
                .unwrap_or(defaults.accept_language),
        })
    }
}

/// A successful response body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// URL after redirects; relative links in a page resolve against this.
    pub final_url: Url,
    /// Raw `Content-Type` header, empty if absent.
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FetchedBody {
    pub fn class(&self) -> ContentClass {
        classify_content_type(&self.content_type)
    }

    /// Body decoded as text for page parsing. Invalid UTF-8 is replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Network boundary of the resolver.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// GET `url`, returning the body or a typed failure.
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, FetchError>;
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    http: Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "FETCH_ACCEPT_LANGUAGE".into(),
                    message: e.to_string(),
                }
            })?,
        );

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .gzip(true)
            .redirect(Policy::limited(config.max_redirects))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "FETCH_USER_AGENT".into(),
                message: e.to_string(),
            })?;

        Ok(Self {
            http,
            max_bytes: config.max_bytes,
        })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedBody, FetchError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        debug!(url = %url, "Fetching");
        let mut response = self.http.get(url.clone()).send().await.map_err(map_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "Fetch returned non-success status");
            return Err(FetchError::Status(status.as_u16()));
        }

        if response
            .content_length()
            .is_some_and(|declared| exceeds_limit(declared, self.max_bytes))
        {
            return Err(FetchError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(
            url = %final_url,
            content_type = %content_type,
            size = bytes.len(),
            "Fetched"
        );

        Ok(FetchedBody {
            final_url,
            content_type,
            bytes,
        })
    }
}

fn map_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = err.status() {
        FetchError::Status(status.as_u16())
    } else {
        FetchError::Connection(err.to_string())
    }
}

/// A declared length that does not even fit in `usize` is over any limit.
fn exceeds_limit(declared: u64, limit: usize) -> bool {
    usize::try_from(declared).map_or(true, |len| len > limit)
}
