//! Upstream fetch: stream the source image into the raw temp file.
//!
//! The body is never held in memory. [`Fetcher::fetch`] only checks the
//! status and captures cache headers; [`Upstream::write_to`] then pipes the
//! body chunk by chunk into the scratch file.

use crate::config::ProxyConfig;
use crate::error::ThumbError;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, CACHE_CONTROL, LAST_MODIFIED};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

static MAX_AGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bmax-age=(\d+)\b").expect("valid regex"));

/// Cache headers relayed from the upstream response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetadata {
    /// `max-age` from the upstream `Cache-Control`, in seconds.
    pub max_age: Option<u64>,
    /// Upstream `Last-Modified`, verbatim.
    pub last_modified: Option<String>,
}

impl CacheMetadata {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let max_age = headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| MAX_AGE.captures(v))
            .and_then(|caps| caps[1].parse().ok());
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self {
            max_age,
            last_modified,
        }
    }

    /// `Cache-Control` value for the response: upstream max-age if it sent
    /// one, else `default_max_age`.
    pub fn cache_control(&self, default_max_age: u64) -> String {
        format!("max-age={}", self.max_age.unwrap_or(default_max_age))
    }
}

/// HTTP client bound to the upstream base URL.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    base: String,
}

impl Fetcher {
    pub fn new(config: &ProxyConfig) -> Result<Self, ThumbError> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.fetch_timeout_secs));
        if let Some(ref proxy) = config.proxy {
            info!("Using proxy {}", proxy);
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| ThumbError::InvalidConfig(format!("proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ThumbError::Internal(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base: config.base_path.trim_end_matches('/').to_string(),
        })
    }

    /// Full upstream URL for a source path such as `/photos/cat.jpg`.
    pub fn source_url(&self, source_path: &str) -> String {
        format!("{}{}", self.base, source_path)
    }

    /// Issue the GET and check the status.
    ///
    /// # Errors
    /// - [`ThumbError::UpstreamNotFound`] for any status other than 200
    /// - [`ThumbError::UpstreamTransport`] when no response arrives
    pub async fn fetch(&self, source_path: &str) -> Result<Upstream, ThumbError> {
        let url = self.source_url(source_path);
        debug!("Fetching {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            ThumbError::UpstreamTransport {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;

        if response.status() != StatusCode::OK {
            return Err(ThumbError::UpstreamNotFound {
                url,
                status: response.status().as_u16(),
            });
        }

        let cache = CacheMetadata::from_headers(response.headers());
        Ok(Upstream {
            url,
            response,
            cache,
        })
    }
}

/// A 200 response whose body has not been read yet.
#[derive(Debug)]
pub struct Upstream {
    url: String,
    response: reqwest::Response,
    pub cache: CacheMetadata,
}

impl Upstream {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stream the body into the file at `path`, returning the byte count.
    ///
    /// # Errors
    /// [`ThumbError::StreamWrite`] when the connection drops mid-body or the
    /// local write fails. The partial file is left for cleanup.
    pub async fn write_to(self, path: &Path) -> Result<u64, ThumbError> {
        let write_err = |reason: String| ThumbError::StreamWrite {
            path: path.to_path_buf(),
            reason,
        };

        let mut out = tokio::fs::File::create(path)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        let mut body = self.response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| write_err(format!("reading '{}': {e}", self.url)))?;
            out.write_all(&chunk)
                .await
                .map_err(|e| write_err(e.to_string()))?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(|e| write_err(e.to_string()))?;

        debug!("{} written ({} bytes)", path.display(), written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(reqwest::header::HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn max_age_from_cache_control() {
        let meta = CacheMetadata::from_headers(&headers(&[(
            CACHE_CONTROL,
            "public, max-age=120, must-revalidate",
        )]));
        assert_eq!(meta.max_age, Some(120));
        assert_eq!(meta.cache_control(86_400), "max-age=120");
    }

    #[test]
    fn default_max_age_when_absent() {
        let meta = CacheMetadata::from_headers(&HeaderMap::new());
        assert_eq!(meta, CacheMetadata::default());
        assert_eq!(meta.cache_control(3600), "max-age=3600");

        let meta = CacheMetadata::from_headers(&headers(&[(CACHE_CONTROL, "no-cache")]));
        assert_eq!(meta.max_age, None);
    }

    #[test]
    fn s_maxage_is_not_max_age() {
        let meta = CacheMetadata::from_headers(&headers(&[(CACHE_CONTROL, "s-maxage=50")]));
        assert_eq!(meta.max_age, None);
    }

    #[test]
    fn last_modified_copied() {
        let meta = CacheMetadata::from_headers(&headers(&[(
            LAST_MODIFIED,
            "Wed, 21 Oct 2015 07:28:00 GMT",
        )]));
        assert_eq!(
            meta.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[test]
    fn source_url_joins_without_double_slash() {
        let config = ProxyConfig::builder()
            .base_path("http://up.example/originals/")
            .build()
            .unwrap();
        let fetcher = Fetcher::new(&config).unwrap();
        assert_eq!(
            fetcher.source_url("/a/b.jpg"),
            "http://up.example/originals/a/b.jpg"
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        // Port 9 (discard) on localhost is closed on any sane test machine.
        let config = ProxyConfig::builder()
            .base_path("http://127.0.0.1:9")
            .fetch_timeout_secs(5)
            .build()
            .unwrap();
        let fetcher = Fetcher::new(&config).unwrap();
        let err = fetcher.fetch("/a.jpg").await.unwrap_err();
        assert!(
            matches!(err, ThumbError::UpstreamTransport { .. }),
            "got: {err:?}"
        );
    }
}
