//! What a viewer shows, and how times are displayed.

use serde::Serialize;

use crate::audio::PlaybackSnapshot;

/// Renderable state of one media viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MediaView {
    /// Resolving, probing or decoding.
    Loading {
        #[serde(skip_serializing_if = "Option::is_none")]
        transcription: Option<String>,
    },
    /// The file is missing on the server. Rendered in place of the player.
    Unavailable { message: String },
    /// A fatal error for this item.
    Failed { message: String },
    /// Inline audio player.
    Player {
        url: String,
        playback: PlaybackSnapshot,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcription: Option<String>,
    },
    /// Inline playback is not available here; offer a download instead.
    DownloadOnly {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcription: Option<String>,
    },
    Image { url: String },
    Document { url: String },
}

impl MediaView {
    pub fn transcription(&self) -> Option<&str> {
        match self {
            Self::Loading { transcription }
            | Self::Player { transcription, .. }
            | Self::DownloadOnly { transcription, .. } => transcription.as_deref(),
            _ => None,
        }
    }
}

/// `m:ss`, as shown under the progress bar.
pub fn format_time(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs.floor() as u64
    } else {
        0
    };
    format!("{}:{:02}", total / 60, total % 60)
}
