//! HTTP surface: one `GET` route over the whole path space.
//!
//! The handler is a thin shim. It detects conditional requests, hands the
//! path to [`Thumbnailer`], and turns the outcome into a response. Error
//! bodies carry only the status reason; details go to the log.

use crate::convert::{Outcome, Thumbnail, Thumbnailer};
use crate::error::ThumbError;
use axum::extract::State;
use axum::http::header::{
    CACHE_CONTROL, CONTENT_TYPE, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Build the router with access logging.
pub fn router(thumbnailer: Arc<Thumbnailer>) -> Router {
    Router::new()
        .route("/{*path}", get(thumbnail))
        .layer(TraceLayer::new_for_http())
        .with_state(thumbnailer)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    thumbnailer: Arc<Thumbnailer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ThumbError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    axum::serve(listener, router(thumbnailer))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ThumbError::Internal(format!("server terminated: {e}")))
}

async fn thumbnail(
    State(thumbnailer): State<Arc<Thumbnailer>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let conditional = headers.contains_key(IF_NONE_MATCH) || headers.contains_key(IF_MODIFIED_SINCE);

    let outcome = match thumbnailer.parse_request(uri.path()) {
        Ok(request) => thumbnailer.handle(&request, conditional).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(Outcome::NotModified { cache_control }) => {
            (StatusCode::NOT_MODIFIED, [(CACHE_CONTROL, cache_control)]).into_response()
        }
        Ok(Outcome::Thumbnail(thumb)) => thumbnail_response(uri.path(), thumb),
        Err(e) => {
            log_error(uri.path(), &e);
            e.into_response()
        }
    }
}

fn thumbnail_response(path: &str, thumb: Thumbnail) -> Response {
    let Thumbnail {
        body,
        content_type,
        cache_control,
        last_modified,
        mut trace,
    } = thumb;

    let mut response = (
        StatusCode::OK,
        [
            (CONTENT_TYPE, content_type.to_string()),
            (CACHE_CONTROL, cache_control),
        ],
        body,
    )
        .into_response();

    if let Some(value) = last_modified.and_then(|v| HeaderValue::from_str(&v).ok()) {
        response.headers_mut().insert(LAST_MODIFIED, value);
    }

    trace.mark("sent");
    trace.log(path);
    response
}

fn log_error(path: &str, e: &ThumbError) {
    match e {
        ThumbError::ConversionFailed { stderr, .. } if !stderr.is_empty() => {
            error!("{}: {} (stderr: {})", path, e, stderr.trim_end())
        }
        ThumbError::QueueTimeout { .. } => warn!("{}: {}", path, e),
        _ if e.status().is_server_error() => error!("{}: {}", path, e),
        _ => debug!("{}: {}", path, e),
    }
}

impl IntoResponse for ThumbError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, status.canonical_reason().unwrap_or_default()).into_response()
    }
}
