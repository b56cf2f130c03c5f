//! Request shape: `<resource-path>.<transform-suffix>.<output-extension>`.
//!
//! The output extension picks an [`OutputFormat`] from the configured
//! allow-list. Everything downstream (temp-file names, `Content-Type`) uses
//! the resolved format, never the literal extension, so an odd spelling in
//! the URL cannot make the conversion tool misread a file.

use crate::error::ThumbError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static PATH_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/.+)\.([^./]+)\.([^./]+)$").expect("valid regex"));

/// Output image formats the proxy knows how to label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl OutputFormat {
    /// Resolve a URL extension (case-insensitive, without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(OutputFormat::Jpeg),
            "png" => Some(OutputFormat::Png),
            "gif" => Some(OutputFormat::Gif),
            "webp" => Some(OutputFormat::Webp),
            _ => None,
        }
    }

    /// Canonical file extension used for temp files.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Webp => "image/webp",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A request path split into its three parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRequest {
    /// Path of the source below the upstream base, without extension.
    pub resource: String,
    /// Raw transform suffix, parsed separately by [`crate::transform::parse`].
    pub options: String,
    /// Extension exactly as written in the URL.
    pub extension: String,
    /// Format resolved from `extension`.
    pub format: OutputFormat,
}

impl ThumbnailRequest {
    /// Split a request path and check its extension against `allowed`.
    ///
    /// # Errors
    /// [`ThumbError::Parse`] when the path lacks the three-part shape or the
    /// extension is unknown or not allowed.
    pub fn from_path(path: &str, allowed: &[OutputFormat]) -> Result<Self, ThumbError> {
        let caps = PATH_SHAPE
            .captures(path)
            .ok_or_else(|| ThumbError::Parse(format!("path '{path}' has no transform suffix")))?;

        let extension = caps[3].to_string();
        let format = OutputFormat::from_extension(&extension)
            .filter(|f| allowed.contains(f))
            .ok_or_else(|| {
                ThumbError::Parse(format!("output extension '{extension}' is not allowed"))
            })?;

        Ok(Self {
            resource: caps[1].to_string(),
            options: caps[2].to_string(),
            extension,
            format,
        })
    }

    /// Path of the source image relative to the upstream base: the resource
    /// with the transform suffix removed and the literal extension kept.
    pub fn source_path(&self) -> String {
        format!("{}.{}", self.resource, self.extension)
    }
}
