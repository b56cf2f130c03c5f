//! Request orchestration: one thumbnail from path to bytes.
//!
//! ```text
//! parse ──▶ conditional? ──▶ fetch ──▶ allocate ──▶ write raw ──▶ queue ──▶ read
//!   │            │             │                       │           │        │
//!   └── 400      └── 304       └── 404/500             └── 500     └── 503/500
//! ```
//!
//! Temp files only exist from "allocate" on. Everything after that runs
//! inside `produce`, whose result is held while
//! [`RequestFiles::cleanup`] runs; there is no other way out of
//! [`Thumbnailer::handle`] once a file has been created.

use crate::config::ProxyConfig;
use crate::error::ThumbError;
use crate::pipeline::cleanup::RequestFiles;
use crate::pipeline::fetch::Fetcher;
use crate::pipeline::queue::{ConversionQueue, ConversionTask, QueueSettings};
use crate::pipeline::runner::{CommandRunner, ToolRunner};
use crate::pipeline::scratch::{Scratch, TempFile, TempRole};
use crate::request::{OutputFormat, ThumbnailRequest};
use crate::timing::TimingTrace;
use crate::transform::{self, TransformSpec};
use axum::body::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A converted image ready to send.
#[derive(Debug)]
pub struct Thumbnail {
    pub body: Bytes,
    pub content_type: &'static str,
    /// `max-age=<seconds>`, from upstream or the configured default.
    pub cache_control: String,
    pub last_modified: Option<String>,
    pub trace: TimingTrace,
}

/// What a request resolves to when nothing went wrong.
#[derive(Debug)]
pub enum Outcome {
    /// Conditional request answered without fetching.
    NotModified { cache_control: String },
    Thumbnail(Thumbnail),
}

/// The conversion pipeline, owned by the process and shared by handlers.
#[derive(Debug)]
pub struct Thumbnailer {
    config: ProxyConfig,
    fetcher: Fetcher,
    queue: ConversionQueue,
    scratch: Scratch,
}

impl Thumbnailer {
    /// Build the pipeline with the real subprocess runner.
    ///
    /// Must be called inside a tokio runtime: the queue workers are spawned
    /// here.
    pub fn new(config: ProxyConfig) -> Result<Self, ThumbError> {
        Self::with_runner(config, Arc::new(CommandRunner))
    }

    /// Build the pipeline around a custom [`ToolRunner`].
    pub fn with_runner(config: ProxyConfig, runner: Arc<dyn ToolRunner>) -> Result<Self, ThumbError> {
        let fetcher = Fetcher::new(&config)?;
        let queue = ConversionQueue::start(QueueSettings::from_config(&config)?, runner);
        let scratch = Scratch::new(config.temp_dir.clone());
        Ok(Self {
            config,
            fetcher,
            queue,
            scratch,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    /// Split and validate a request path against the allowed formats.
    pub fn parse_request(&self, path: &str) -> Result<ThumbnailRequest, ThumbError> {
        ThumbnailRequest::from_path(path, &self.config.allowed_formats)
    }

    /// Run one request through the pipeline.
    ///
    /// `conditional` is true when the client sent `If-None-Match` or
    /// `If-Modified-Since`. Sources are treated as immutable, so such a
    /// request is answered "not modified" straight away once the transform
    /// itself is known to be valid.
    pub async fn handle(
        &self,
        request: &ThumbnailRequest,
        conditional: bool,
    ) -> Result<Outcome, ThumbError> {
        let trace = TimingTrace::start();
        let started = trace.started_at();
        let transform = transform::parse(&request.options, self.config.max_dimension)?;

        if conditional {
            debug!("Conditional request for {}, skipping fetch", request.source_path());
            return Ok(Outcome::NotModified {
                cache_control: format!("max-age={}", self.config.max_age_secs),
            });
        }

        let mut files = RequestFiles::default();
        let result = self
            .produce(request, transform, &mut files, trace)
            .await;
        files.cleanup().await;

        match result {
            Ok(thumbnail) => {
                info!(
                    "{} → {} bytes in {}ms",
                    request.source_path(),
                    thumbnail.body.len(),
                    started.elapsed().as_millis()
                );
                Ok(Outcome::Thumbnail(thumbnail))
            }
            Err(e) => {
                debug!("{} failed after {}ms", request.source_path(), started.elapsed().as_millis());
                Err(e)
            }
        }
    }

    async fn produce(
        &self,
        request: &ThumbnailRequest,
        transform: TransformSpec,
        files: &mut RequestFiles,
        mut trace: TimingTrace,
    ) -> Result<Thumbnail, ThumbError> {
        let upstream = self.fetcher.fetch(&request.source_path()).await?;
        let cache = upstream.cache.clone();

        let raw = self
            .allocate(&mut files.raw, TempRole::Raw, request.format)
            .await?;
        let converted = self
            .allocate(&mut files.converted, TempRole::Converted, request.format)
            .await?;

        upstream.write_to(&raw).await?;
        trace.mark("downloaded");

        let dequeued_at = self
            .queue
            .submit(ConversionTask::new(&raw, &converted, transform))
            .await?;
        trace.mark_at("waiting", dequeued_at);
        trace.mark("converted");

        let body = tokio::fs::read(&converted).await.map_err(|e| {
            ThumbError::Internal(format!("cannot read '{}': {e}", converted.display()))
        })?;

        Ok(Thumbnail {
            body: Bytes::from(body),
            content_type: request.format.content_type(),
            cache_control: cache.cache_control(self.config.max_age_secs),
            last_modified: cache.last_modified,
            trace,
        })
    }

    /// Allocate a temp file into `slot` so cleanup sees it even if a later
    /// step fails.
    async fn allocate(
        &self,
        slot: &mut Option<TempFile>,
        role: TempRole,
        format: OutputFormat,
    ) -> Result<PathBuf, ThumbError> {
        let file = self.scratch.allocate(role, format).await?;
        let path = file.path().to_path_buf();
        *slot = Some(file);
        Ok(path)
    }
}
