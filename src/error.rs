//! Error type for the thumbproxy library.
//!
//! Every failure a request can hit is a variant of [`ThumbError`]. The
//! variants follow the request's life: the URL is rejected, the upstream
//! refuses or cannot be reached, the local copy cannot be written, the
//! conversion queue gives up, or the external tool fails.
//!
//! None of these are retried internally. The HTTP layer maps each one to a
//! status with [`ThumbError::status`]; the `Display` text (and any captured
//! subprocess output) is for logs only and is never sent to the client.

use axum::http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the thumbproxy library.
#[derive(Debug, Error)]
pub enum ThumbError {
    // ── Client errors ─────────────────────────────────────────────────────
    /// The transform suffix, request path shape or output extension was
    /// rejected before anything was fetched.
    #[error("Invalid request: {0}")]
    Parse(String),

    // ── Upstream errors ───────────────────────────────────────────────────
    /// The upstream answered with something other than 200.
    #[error("Upstream returned HTTP {status} for '{url}'")]
    UpstreamNotFound { url: String, status: u16 },

    /// The upstream could not be reached at all.
    #[error("Failed to fetch '{url}': {reason}")]
    UpstreamTransport { url: String, reason: String },

    // ── Local I/O errors ──────────────────────────────────────────────────
    /// Buffering the upstream body into the scratch directory failed
    /// (disk full, truncated connection, ...).
    #[error("Failed to write '{path}': {reason}")]
    StreamWrite { path: PathBuf, reason: String },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// The task waited in the queue longer than the staleness threshold and
    /// was dropped without running. Callers may retry with backoff.
    #[error("Conversion task gave up after waiting {waited_ms}ms in queue")]
    QueueTimeout { waited_ms: u64 },

    /// The conversion tool could not be spawned, exited non-zero, or ran
    /// past its wall-clock limit.
    #[error("Conversion failed: {reason}")]
    ConversionFailed { reason: String, stderr: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or config file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (join failure, queue shut down, ...).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThumbError {
    /// HTTP status the request boundary answers with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ThumbError::Parse(_) => StatusCode::BAD_REQUEST,
            ThumbError::UpstreamNotFound { .. } => StatusCode::NOT_FOUND,
            ThumbError::QueueTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ThumbError::UpstreamTransport { .. }
            | ThumbError::StreamWrite { .. }
            | ThumbError::ConversionFailed { .. }
            | ThumbError::InvalidConfig(_)
            | ThumbError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `true` for errors caused by the request itself rather than the server.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ThumbError::Parse("w100x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ThumbError::UpstreamNotFound {
                url: "http://up/a.jpg".into(),
                status: 403,
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ThumbError::QueueTimeout { waited_ms: 16000 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ThumbError::ConversionFailed {
                reason: "exit status 1".into(),
                stderr: "convert: no decode delegate".into(),
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ThumbError::StreamWrite {
                path: "/tmp/x".into(),
                reason: "No space left on device".into(),
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn client_errors() {
        assert!(ThumbError::Parse("x".into()).is_client_error());
        assert!(ThumbError::UpstreamNotFound {
            url: "u".into(),
            status: 500
        }
        .is_client_error());
        assert!(!ThumbError::QueueTimeout { waited_ms: 1 }.is_client_error());
    }

    #[test]
    fn conversion_failed_display_omits_stderr() {
        let e = ThumbError::ConversionFailed {
            reason: "exit status 1".into(),
            stderr: "secret diagnostic".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exit status 1"), "got: {msg}");
        assert!(!msg.contains("secret diagnostic"));
    }

    #[test]
    fn queue_timeout_display() {
        let e = ThumbError::QueueTimeout { waited_ms: 15001 };
        assert!(e.to_string().contains("15001ms"));
    }
}
