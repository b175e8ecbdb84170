//! Error types for seshat-core

use thiserror::Error;

/// Main error type for the seshat-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Index store error (open/prepare/bind/step failures)
    #[error("index store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fatal parser setup error (invalid glob, unreadable root).
    ///
    /// Malformed log content is never reported here: parsers fail softly
    /// by returning `None` and the scan continues.
    #[error("parse error in {source_kind} log: {message}")]
    Parse {
        source_kind: String,
        message: String,
    },

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// External scanner failure (launch failure or nonzero exit)
    #[error("scanner error: {0}")]
    Scanner(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for seshat-core
pub type Result<T> = std::result::Result<T, Error>;
