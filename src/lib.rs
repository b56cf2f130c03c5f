//! # thumbproxy
//!
//! On-demand image thumbnailing proxy. A request names an upstream image and
//! a transform in its path; the proxy fetches the image, runs an external
//! converter (ImageMagick `convert` by default) and returns the result with
//! the upstream's cache headers.
//!
//! ## Request shape
//!
//! ```text
//! /photos/2019/cat.w200h150r90c400x300+10+20.jpg
//! └──── resource ─┘└──── transform suffix ──┘└ext┘
//! ```
//!
//! is served from `<base_path>/photos/2019/cat.jpg`, cropped to 400x300 at
//! (10,20), rotated 90°, resized to fit 200x150 and stripped of metadata.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Parse    path shape, output format, transform suffix
//!  ├─ 2. Gate     conditional requests answered 304 without fetching
//!  ├─ 3. Fetch    stream upstream body into a raw temp file
//!  ├─ 4. Queue    bounded worker pool, stale tasks failed unrun
//!  ├─ 5. Convert  external tool under a hard timeout
//!  └─ 6. Cleanup  both temp files deleted on every path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use thumbproxy::{server, ProxyConfig, Thumbnailer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::builder()
//!         .base_path("https://images.example.com/originals")
//!         .concurrency(4)
//!         .build()?;
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
//!     let thumbnailer = Arc::new(Thumbnailer::new(config)?);
//!     server::serve(listener, thumbnailer, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `thumbproxy` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod request;
pub mod server;
pub mod timing;
pub mod transform;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionCommand, ProxyConfig, ProxyConfigBuilder};
pub use convert::{Outcome, Thumbnail, Thumbnailer};
pub use error::ThumbError;
pub use pipeline::queue::{ConversionQueue, ConversionTask, QueueSettings};
pub use pipeline::runner::{CommandRunner, ToolInvocation, ToolRunner};
pub use request::{OutputFormat, ThumbnailRequest};
pub use transform::{Operation, Rect, TransformSpec};
