use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by image servicing operations.
///
/// Bookkeeping failures (log writes, scratch directory removal) never appear
/// here as hard errors; they are recorded and reported through outcome values
/// such as [`crate::removal::RemovalOutcome`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Tool not found: {}", program.display())]
    ToolNotFound { program: PathBuf },

    #[error("Mount failed for {} (index {index}): tool exited with {code}", image.display())]
    MountFailed {
        image: PathBuf,
        index: u32,
        code: i32,
    },

    #[error("{operation} failed: tool exited with {code}")]
    ToolFailed { operation: String, code: i32 },

    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(String),

    #[error("{failed} of {attempted} indices failed: {indices:?}")]
    PartialExportFailure {
        attempted: usize,
        failed: usize,
        indices: Vec<u32>,
    },

    #[error("Could not remove {}: {reason}", path.display())]
    CleanupFailure { path: PathBuf, reason: String },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Destination kept, nothing was written: {}", .0.display())]
    DestinationKept(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
