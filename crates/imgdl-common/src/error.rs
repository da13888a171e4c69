//! Error types for imgdl
//!
//! Only run-level failures live here. Per-item problems (a failed fetch, an
//! undecodable image) are values handled inside the pipeline and never turn
//! into an [`ImgdlError`].

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for imgdl operations
pub type Result<T> = std::result::Result<T, ImgdlError>;

/// Main error type for imgdl
#[derive(Error, Debug)]
pub enum ImgdlError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An input file could not be opened or read. Recoverable: the run skips
    /// the file and leaves it out of the checkpoint.
    #[error("Cannot read input '{}': {reason}", path.display())]
    InputOpen { path: PathBuf, reason: String },

    /// Writing the output dataset failed. Fatal.
    #[error("Output write failed: {0}")]
    OutputWrite(String),

    /// Invalid settings detected before any work starts. Fatal.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

impl ImgdlError {
    pub fn input_open(path: impl AsRef<Path>, reason: impl ToString) -> Self {
        Self::InputOpen {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn output_write(reason: impl ToString) -> Self {
        Self::OutputWrite(reason.to_string())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InputOpen { .. })
    }
}
