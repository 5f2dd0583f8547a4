//! Core error types for the harvester daemon.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Config file could not be parsed
    #[error("Invalid config file {path:?}: {message}")]
    Config { path: PathBuf, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Workspace id rejected
    #[error("Invalid workspace id: {0:?}")]
    InvalidWorkspace(String),
}
