//! CLI binary for thumbproxy.
//!
//! A thin shim over the library crate that layers a JSON config file and
//! CLI flags into `ProxyConfig`, binds the listener and serves.

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thumbproxy::{server, OutputFormat, ProxyConfig, ProxyConfigBuilder, Thumbnailer};
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"URL FORMAT:
  /<resource-path>.<transform>.<ext>

  Transform tokens (any order, concatenated):
    w<N>          target width
    h<N>          target height
    r<N>          rotate N degrees
    c<W>x<H>+<X>+<Y>  crop rectangle

  Applied as crop → rotate → resize, then metadata is stripped.

EXAMPLES:
  # Serve thumbnails of https://img.example.com/... on port 8080
  thumbproxy --base-path https://img.example.com

  # GET /photos/cat.w200h150.jpg  → https://img.example.com/photos/cat.jpg, 200x150

  # Four conversions at once, nice'd converter
  thumbproxy --base-path https://img.example.com -c 4 \
      --convert-command "nice -n 10 convert"

  # Settings from a file, CLI flags override
  thumbproxy --config /etc/thumbproxy.json --listen 127.0.0.1:9000

ENVIRONMENT VARIABLES:
  Every flag can also be set as THUMBPROXY_<FLAG>, e.g. THUMBPROXY_BASE_PATH.
  RUST_LOG overrides the log filter.
"#;

/// On-demand image thumbnailing proxy.
#[derive(Parser, Debug)]
#[command(
    name = "thumbproxy",
    version,
    about = "On-demand image thumbnailing proxy",
    long_about = "Fetches images from an upstream base URL and returns them resized, cropped \
or rotated according to a transform suffix in the request path, using an external \
converter such as ImageMagick.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// JSON config file. CLI flags and environment variables take precedence.
    #[arg(long, env = "THUMBPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream base URL.
    #[arg(long, env = "THUMBPROXY_BASE_PATH")]
    base_path: Option<String>,

    /// Address to listen on.
    #[arg(long, env = "THUMBPROXY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Converter command line: program followed by fixed arguments.
    #[arg(long, env = "THUMBPROXY_CONVERT_COMMAND")]
    convert_command: Option<String>,

    /// Hard limit for one conversion, in milliseconds.
    #[arg(long, env = "THUMBPROXY_CONVERT_TIMEOUT_MS")]
    convert_timeout_ms: Option<u64>,

    /// Longest a conversion may wait in the queue, in milliseconds.
    #[arg(long, env = "THUMBPROXY_STALENESS_MS")]
    staleness_ms: Option<u64>,

    /// Number of conversions allowed to run at once.
    #[arg(short, long, env = "THUMBPROXY_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Clamp for requested width and height.
    #[arg(long, env = "THUMBPROXY_MAX_DIMENSION")]
    max_dimension: Option<u32>,

    /// Default Cache-Control max-age in seconds.
    #[arg(long, env = "THUMBPROXY_MAX_AGE")]
    max_age: Option<u64>,

    /// Upstream fetch timeout in seconds.
    #[arg(long, env = "THUMBPROXY_FETCH_TIMEOUT")]
    fetch_timeout: Option<u64>,

    /// Outbound proxy URL for upstream fetches.
    #[arg(long, env = "THUMBPROXY_PROXY")]
    proxy: Option<String>,

    /// Scratch directory for temp files.
    #[arg(long, env = "THUMBPROXY_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Allowed output extensions, comma-separated (jpeg, png, gif, webp).
    #[arg(long, env = "THUMBPROXY_FORMATS", value_delimiter = ',', value_parser = parse_format)]
    formats: Option<Vec<OutputFormat>>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "THUMBPROXY_VERBOSE")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, env = "THUMBPROXY_QUIET")]
    quiet: bool,
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    OutputFormat::from_extension(s.trim()).ok_or_else(|| format!("unknown format '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let config = build_config(&cli)?;
    info!(
        "Upstream {} · {} worker(s) · scratch {}",
        config.base_path,
        config.concurrency,
        config.temp_dir.display()
    );

    // ── Bind and serve ───────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let thumbnailer = Arc::new(Thumbnailer::new(config).context("Failed to start pipeline")?);

    server::serve(listener, thumbnailer, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await
    .context("Server failed")?;

    Ok(())
}

/// Defaults → config file → CLI/env.
fn build_config(cli: &Cli) -> Result<ProxyConfig> {
    let base = match cli.config {
        Some(ref path) => ProxyConfig::from_json_file(path).context("Failed to load config file")?,
        None => ProxyConfig::default(),
    };
    let mut builder = ProxyConfigBuilder::from_config(base);

    if let Some(ref v) = cli.base_path {
        builder = builder.base_path(v.clone());
    }
    if let Some(v) = cli.listen {
        builder = builder.listen_addr(v);
    }
    if let Some(ref v) = cli.convert_command {
        builder = builder.convert_command(v.clone());
    }
    if let Some(v) = cli.convert_timeout_ms {
        builder = builder.convert_timeout_ms(v);
    }
    if let Some(v) = cli.staleness_ms {
        builder = builder.staleness_ms(v);
    }
    if let Some(v) = cli.concurrency {
        builder = builder.concurrency(v);
    }
    if let Some(v) = cli.max_dimension {
        builder = builder.max_dimension(v);
    }
    if let Some(v) = cli.max_age {
        builder = builder.max_age_secs(v);
    }
    if let Some(v) = cli.fetch_timeout {
        builder = builder.fetch_timeout_secs(v);
    }
    if let Some(ref v) = cli.proxy {
        builder = builder.proxy(v.clone());
    }
    if let Some(ref v) = cli.temp_dir {
        builder = builder.temp_dir(v.clone());
    }
    if let Some(ref v) = cli.formats {
        builder = builder.allowed_formats(v.clone());
    }

    builder.build().context("Invalid configuration")
}
