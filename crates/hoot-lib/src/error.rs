//! Error types for hoot-lib

use hoot_core::protocol::DecodeError;
use thiserror::Error;

/// Serial link failures. Returned as values, never raised past the link.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("link unavailable: {0}")]
    Unavailable(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("link worker stopped")]
    Closed,
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

/// Speech player failures.
#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("TTS request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("TTS server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("playback did not finish within {0:?}")]
    Timeout(std::time::Duration),

    #[error("player error: {0}")]
    Player(String),
}

/// Annotator failures. Always recovered by falling back to plain speech.
#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("annotation unavailable: {0}")]
    Unavailable(String),

    #[error("annotator request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("annotator returned no usable content")]
    Empty,
}
