//! Temp file allocation in the scratch directory.
//!
//! Each request gets two files: the raw upstream bytes and the converted
//! output. Names come from [`tempfile::Builder`], which picks a random
//! suffix and creates the file with `O_EXCL`, so a path is never handed to
//! two requests even when many allocate at once.
//!
//! A [`TempFile`] owns its path. It is deleted explicitly by
//! [`crate::pipeline::cleanup::RequestFiles::cleanup`]; if a request future
//! is dropped before it gets there (client disconnect, panic), dropping the
//! [`TempFile`] removes the file instead. Both happen on the blocking pool
//! whenever a tokio runtime is around.

use crate::error::ThumbError;
use crate::request::OutputFormat;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

/// Which stage of a request a temp file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempRole {
    Raw,
    Converted,
}

impl TempRole {
    fn prefix(self) -> &'static str {
        match self {
            TempRole::Raw => "thumbnail-raw-",
            TempRole::Converted => "thumbnail-converted-",
        }
    }
}

impl fmt::Display for TempRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TempRole::Raw => f.write_str("raw"),
            TempRole::Converted => f.write_str("converted"),
        }
    }
}

/// A request-scoped file in the scratch directory.
pub struct TempFile {
    path: PathBuf,
    /// `None` once closed.
    guard: Option<TempPath>,
    role: TempRole,
}

impl TempFile {
    fn new(guard: TempPath, role: TempRole) -> Self {
        Self {
            path: guard.to_path_buf(),
            guard: Some(guard),
            role,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> TempRole {
        self.role
    }

    /// Delete the file now, reporting the outcome. Blocking.
    pub fn close(mut self) -> std::io::Result<()> {
        match self.guard.take() {
            Some(guard) => guard.close(),
            None => Ok(()),
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(guard));
            }
            Err(_) => drop(guard),
        }
    }
}

impl fmt::Debug for TempFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempFile")
            .field("path", &self.path())
            .field("role", &self.role)
            .finish()
    }
}

/// Allocator for temp files inside one scratch directory.
#[derive(Debug, Clone)]
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a fresh, empty file for `role` named after `format`.
    ///
    /// The create runs on the blocking pool.
    pub async fn allocate(&self, role: TempRole, format: OutputFormat) -> Result<TempFile, ThumbError> {
        let dir = self.dir.clone();
        let suffix = format!(".{}", format.extension());

        let created = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(role.prefix())
                .suffix(&suffix)
                .rand_bytes(12)
                .tempfile_in(&dir)
        })
        .await
        .map_err(|e| ThumbError::Internal(format!("{role} temp file task failed: {e}")))?;

        let file = created.map_err(|e| {
            ThumbError::Internal(format!(
                "cannot create {role} temp file in '{}': {e}",
                self.dir.display()
            ))
        })?;

        let temp = TempFile::new(file.into_temp_path(), role);
        debug!("Allocated {}", temp.path().display());
        Ok(temp)
    }
}
