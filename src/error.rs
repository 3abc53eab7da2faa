//! Error taxonomy for media resolution, decoding and playback, plus the
//! record-store / auth errors of the backend client.

use serde::Serialize;
use thiserror::Error;

/// Failures of the media pipeline for a single viewer.
///
/// None of these are retried automatically. The viewer converts each one
/// into a visible state and a notification on its event channel.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ViewerError {
    /// Malformed media reference (an empty identifier or file name).
    #[error("invalid media reference: {0}")]
    InvalidReference(String),

    /// The existence probe for the resolved URL failed.
    #[error("media file is not available on the server: {url}")]
    UnreachableResource { url: String },

    /// Fetching the bytes failed or returned a non-2xx status.
    #[error("download failed: {0}")]
    DownloadError(String),

    /// Unsupported codec or corrupt data.
    #[error("audio decode failed: {0}")]
    DecodeError(String),

    /// Starting output (device, context, playback node) failed.
    #[error("audio playback failed: {0}")]
    PlaybackError(String),
}

/// Coarse error category, sent alongside error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidReference,
    UnreachableResource,
    Download,
    Decode,
    Playback,
}

impl ViewerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReference(_) => ErrorKind::InvalidReference,
            Self::UnreachableResource { .. } => ErrorKind::UnreachableResource,
            Self::DownloadError(_) => ErrorKind::Download,
            Self::DecodeError(_) => ErrorKind::Decode,
            Self::PlaybackError(_) => ErrorKind::Playback,
        }
    }

    /// Errors that a mobile platform absorbs into download-only mode.
    pub fn is_fallback_candidate(&self) -> bool {
        matches!(self, Self::DecodeError(_) | Self::PlaybackError(_))
    }
}

/// Failures talking to the record store or the identity provider.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("session storage error: {0}")]
    Session(String),
}
