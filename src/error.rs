//! Error types for the folio-cache library.

use thiserror::Error;

/// Errors that can occur while routing, caching or managing the worker.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during cache file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A URL could not be parsed or resolved against the origin.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL text.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A network fetch failed before producing a response.
    #[error("Network request to {url} failed: {reason}")]
    Network {
        /// Requested URL.
        url: String,
        /// Failure description.
        reason: String,
    },

    /// A required asset could not be cached during installation.
    #[error("Install failed for {url}: {reason}")]
    Install {
        /// Asset that failed.
        url: String,
        /// Failure description.
        reason: String,
    },

    /// The cache storage backend failed.
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// A control-channel message could not be decoded.
    #[error("Invalid message: {0}")]
    Message(String),
}

/// A specialized `Result` type for folio-cache operations.
pub type Result<T> = std::result::Result<T, Error>;
