//! Error types for protocol operations

use std::io;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An event could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Malformed envelope or missing required header field
    #[error("Decode error: {0}")]
    Decode(String),

    /// Stream ended in the middle of a frame
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Underlying stream failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
