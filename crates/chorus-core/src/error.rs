//! Error types for Chorus.

use thiserror::Error;

/// Result type alias using Chorus's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the playback stack.
///
/// Errors are `Clone` because a single failure can surface twice: once to
/// the caller awaiting a load, and once to passive event listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Resource errors (before decode starts)
    #[error("failed to fetch resource: {0}")]
    Fetch(String),

    // Codec errors
    #[error("codec failed to open input: {0}")]
    CodecInit(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("seek failed: {0}")]
    Seek(String),

    // Output errors
    #[error("audio output error: {0}")]
    Output(String),

    // Control-flow errors
    #[error("load was superseded by a newer load or destroy")]
    Aborted,

    #[error("playback rate control is not supported by this backend")]
    RateControlUnsupported,

    #[error("playback engine has shut down")]
    EngineClosed,
}

impl Error {
    /// Returns true if this error marks a superseded operation rather than
    /// a genuine failure.
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns true if the error originates in the decode pipeline
    /// (as opposed to fetch, output, or control flow).
    pub const fn is_decode_failure(&self) -> bool {
        matches!(self, Self::CodecInit(_) | Self::Decode(_) | Self::Seek(_))
    }
}
