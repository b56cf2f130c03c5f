//! Configuration for the thumbnailing proxy.
//!
//! All behaviour is controlled through [`ProxyConfig`], built via its
//! [`ProxyConfigBuilder`] or deserialised from a JSON file. Fields missing
//! from the file fall back to the same defaults the builder starts from.

use crate::error::ThumbError;
use crate::request::OutputFormat;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the proxy and its conversion pipeline.
///
/// # Example
/// ```rust
/// use thumbproxy::ProxyConfig;
///
/// let config = ProxyConfig::builder()
///     .base_path("https://images.example.com/originals")
///     .concurrency(4)
///     .max_dimension(1600)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream base URL. The source path from the request is appended to it.
    pub base_path: String,

    /// Conversion tool command line, e.g. `"convert"` or
    /// `"nice -n 10 convert -limit memory 64MiB"`. The first word is the
    /// program; the rest are prefix arguments placed before every transform.
    pub convert_command: String,

    /// Hard wall-clock limit for one conversion subprocess, in ms. Default: 20000.
    pub convert_timeout_ms: u64,

    /// Longest a task may sit in the queue before it is failed without
    /// running, in ms. Default: 15000.
    ///
    /// Independent of `convert_timeout_ms`: this one bounds waiting, that one
    /// bounds running.
    pub staleness_ms: u64,

    /// Number of conversion subprocesses allowed at once. Default: 1.
    pub concurrency: usize,

    /// Upper bound for requested width and height. Default: 2000.
    pub max_dimension: u32,

    /// `Cache-Control` max-age used when the upstream sends none, and for
    /// conditional requests. Default: 86400.
    pub max_age_secs: u64,

    /// Timeout for the whole upstream fetch, in seconds. Default: 30.
    pub fetch_timeout_secs: u64,

    /// Optional outbound proxy for upstream fetches.
    pub proxy: Option<String>,

    /// Scratch directory for raw and converted temp files.
    pub temp_dir: PathBuf,

    /// Output extensions the proxy will serve. Default: jpeg, png.
    pub allowed_formats: Vec<OutputFormat>,

    /// Address the HTTP server binds to. Default: `0.0.0.0:8080`.
    pub listen_addr: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            convert_command: "convert".to_string(),
            convert_timeout_ms: 20_000,
            staleness_ms: 15_000,
            concurrency: 1,
            max_dimension: 2000,
            max_age_secs: 86_400,
            fetch_timeout_secs: 30,
            proxy: None,
            temp_dir: std::env::temp_dir(),
            allowed_formats: vec![OutputFormat::Jpeg, OutputFormat::Png],
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ProxyConfig {
    /// Create a new builder for `ProxyConfig`.
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load a JSON config file. Missing keys take their defaults.
    ///
    /// The result is not validated; pass it through
    /// [`ProxyConfigBuilder::from_config`] and `build()` for that.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ThumbError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ThumbError::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            ThumbError::InvalidConfig(format!("cannot parse '{}': {e}", path.display()))
        })
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_millis(self.convert_timeout_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    /// Split `convert_command` into program and prefix arguments.
    pub fn conversion_command(&self) -> Result<ConversionCommand, ThumbError> {
        ConversionCommand::parse(&self.convert_command)
    }
}

/// The external conversion tool: program plus fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCommand {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl ConversionCommand {
    /// Whitespace-split a command line. No quoting is supported.
    pub fn parse(command_line: &str) -> Result<Self, ThumbError> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| ThumbError::InvalidConfig("convert_command is empty".into()))?;
        Ok(Self {
            program,
            prefix_args: words.collect(),
        })
    }
}

/// Builder for [`ProxyConfig`].
#[derive(Debug)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// Start from an existing config (e.g. one loaded from a file).
    pub fn from_config(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn base_path(mut self, url: impl Into<String>) -> Self {
        self.config.base_path = url.into();
        self
    }

    pub fn convert_command(mut self, command: impl Into<String>) -> Self {
        self.config.convert_command = command.into();
        self
    }

    pub fn convert_timeout_ms(mut self, ms: u64) -> Self {
        self.config.convert_timeout_ms = ms.max(1);
        self
    }

    pub fn staleness_ms(mut self, ms: u64) -> Self {
        self.config.staleness_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_dimension(mut self, px: u32) -> Self {
        self.config.max_dimension = px.max(1);
        self
    }

    pub fn max_age_secs(mut self, secs: u64) -> Self {
        self.config.max_age_secs = secs;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs.max(1);
        self
    }

    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.config.proxy = Some(url.into());
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = dir.into();
        self
    }

    pub fn allowed_formats(mut self, formats: Vec<OutputFormat>) -> Self {
        self.config.allowed_formats = formats;
        self
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProxyConfig, ThumbError> {
        let c = &self.config;
        match reqwest::Url::parse(&c.base_path) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ThumbError::InvalidConfig(format!(
                    "base_path must be http or https, got '{}'",
                    url.scheme()
                )))
            }
            Err(e) => {
                return Err(ThumbError::InvalidConfig(format!(
                    "base_path '{}' is not a URL: {e}",
                    c.base_path
                )))
            }
        }
        if c.concurrency == 0 {
            return Err(ThumbError::InvalidConfig("concurrency must be ≥ 1".into()));
        }
        if c.max_dimension == 0 {
            return Err(ThumbError::InvalidConfig("max_dimension must be ≥ 1".into()));
        }
        if c.allowed_formats.is_empty() {
            return Err(ThumbError::InvalidConfig(
                "allowed_formats must name at least one format".into(),
            ));
        }
        if let Some(ref proxy) = c.proxy {
            reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
                ThumbError::InvalidConfig(format!("proxy '{proxy}' is invalid: {e}"))
            })?;
        }
        c.conversion_command()?;
        Ok(self.config)
    }
}
