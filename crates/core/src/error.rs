//! Error types for loading and engine setup

use crate::request::{ResourceId, SourceKind};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a [`Transport`](crate::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server answered with a non-success status
    #[error("HTTP status {code}")]
    Status { code: u16 },
    /// Connect or read timed out
    #[error("request timed out")]
    Timeout,
    /// Connection or stream failure
    #[error("I/O error: {0}")]
    Io(String),
    /// The URL could not be parsed or uses an unsupported scheme
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Per-request failure delivered to callbacks
///
/// None of these affect the engine itself; the next request proceeds
/// normally.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),

    #[error("no loader configured for {0} sources")]
    NoLoader(SourceKind),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("transformation failed: {0}")]
    Transform(String),

    #[error("request cancelled")]
    Cancelled,
}

impl LoadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }
}

/// Result type for loader operations
pub type LoadResult<T> = Result<T, LoadError>;

/// Failure building a [`RequestEngine`](crate::RequestEngine)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] io::Error),
}
