//! Cleanup of a request's temp files.
//!
//! [`RequestFiles`] travels with a request from the moment its first temp
//! file exists. The orchestrator calls [`RequestFiles::cleanup`] once, on the
//! single exit path every outcome funnels through. Ownership makes a second
//! call impossible.

use crate::pipeline::scratch::TempFile;
use std::io::ErrorKind;
use tracing::{debug, warn};

/// The raw and converted files of one request, either possibly absent.
#[derive(Debug, Default)]
pub struct RequestFiles {
    pub raw: Option<TempFile>,
    pub converted: Option<TempFile>,
}

impl RequestFiles {
    pub fn new(raw: TempFile, converted: TempFile) -> Self {
        Self {
            raw: Some(raw),
            converted: Some(converted),
        }
    }

    /// Delete every file present. Never fails: a file that is already gone
    /// is fine, anything else is logged.
    pub async fn cleanup(self) {
        for file in [self.raw, self.converted].into_iter().flatten() {
            remove(file).await;
        }
    }
}

async fn remove(file: TempFile) {
    let path = file.path().to_path_buf();
    debug!("Deleting {}", path.display());
    match tokio::task::spawn_blocking(move || file.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {}
        Ok(Err(e)) => warn!("Failed to delete {}: {}", path.display(), e),
        Err(e) => warn!("Delete task for {} panicked: {}", path.display(), e),
    }
}
