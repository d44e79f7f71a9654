// src/error.rs
use std::io;

use thiserror::Error;

use crate::frame::FrameError;

/// Central error type for the ravel engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O error from the OS or the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire-level framing violation.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A slot pool reached its fixed capacity.
    #[error("slot pool exhausted")]
    PoolExhausted,

    /// A caller-supplied parameter was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `start()` was called while the server is already running.
    #[error("service manager is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, Error>;
