//! Error types for the bootforge-core library.
//!
//! Every variant carries either the byte offset or the pipeline stage at which
//! the failure happened, so a caller can tell *where* an image went wrong and
//! not only *that* it did.

use crate::codec::CompressionKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bootforge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all bootforge operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Input is neither a structured boot image nor a recognizable kernel blob
    #[error("unrecognized boot image format at offset {offset}: {details}")]
    Format {
        /// Byte offset where parsing stopped
        offset: usize,
        /// Detailed description of the issue
        details: String,
    },

    /// A compressed stream is internally inconsistent
    #[error("{kind} stream at offset {offset} is corrupt: {details}")]
    Decompression {
        /// Codec that rejected the stream
        kind: CompressionKind,
        /// Offset of the stream within the analyzed buffer
        offset: usize,
        /// Detailed description of the issue
        details: String,
    },

    /// Input (or decompressed output) exceeds a configured ceiling
    #[error("{stage}: {size} bytes exceeds the configured limit of {limit} bytes")]
    Resource {
        /// Pipeline stage that enforced the limit
        stage: &'static str,
        /// Observed size (a lower bound when the stage stopped early)
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Components or header values cannot form a valid boot image
    #[error("invalid boot image input ({stage}): {details}")]
    Validation {
        /// Builder stage that rejected the input
        stage: &'static str,
        /// Detailed description of the issue
        details: String,
    },

    /// Requested component is not present in this image
    #[error("component '{component}' is not present in this image")]
    NotFound {
        /// Name of the missing component
        component: &'static str,
    },
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new format error
    pub fn format(offset: usize, details: impl Into<String>) -> Self {
        Self::Format {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new decompression error
    pub fn decompression(kind: CompressionKind, offset: usize, details: impl Into<String>) -> Self {
        Self::Decompression {
            kind,
            offset,
            details: details.into(),
        }
    }

    /// Creates a new resource limit error
    pub fn resource(stage: &'static str, size: usize, limit: usize) -> Self {
        Self::Resource { stage, size, limit }
    }

    /// Creates a new validation error
    pub fn validation(stage: &'static str, details: impl Into<String>) -> Self {
        Self::Validation {
            stage,
            details: details.into(),
        }
    }

    /// Creates a new not-found error
    pub fn not_found(component: &'static str) -> Self {
        Self::NotFound { component }
    }

    /// Returns true if analysis may continue past this error with a degraded result
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decompression { .. } | Self::NotFound { .. } | Self::Format { .. }
        )
    }
}
