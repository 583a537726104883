//! Crate-wide error type.
//!
//! Mirrors the taxonomy in the design: transient I/O and hang conditions are
//! reported through [`crate::executor::ExecutorResult`] rather than an `Err`,
//! so only the fatal classes below ever propagate out of the event loop.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MazerunnerError {
    #[error("event channel broken: {0}")]
    ChannelBroken(String),

    #[error("truncated message: expected {expected} bytes, got {got}")]
    TruncatedMessage { expected: usize, got: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("child process failed: {code:?}")]
    ChildFailure { code: Option<i32> },

    #[error("solver reported a fatal status: {0}")]
    SolverFatal(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error("path does not exist: {0}")]
    MissingPath(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Ciborium(String),
}

impl From<ciborium::ser::Error<io::Error>> for MazerunnerError {
    fn from(e: ciborium::ser::Error<io::Error>) -> Self {
        MazerunnerError::Ciborium(e.to_string())
    }
}

impl From<ciborium::de::Error<io::Error>> for MazerunnerError {
    fn from(e: ciborium::de::Error<io::Error>) -> Self {
        MazerunnerError::Ciborium(e.to_string())
    }
}
