//! IPC protocol types for communication with the host UI.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (viewer -> host).
//! Commands use `{"command": "<name>", ...}` format (host -> viewer).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::audio::PlaybackSnapshot;
use crate::backend::{ChatMessage, Conversation, MessageCounts, MessageType};
use crate::error::ErrorKind;
use crate::media::MediaReference;
use crate::viewer::MediaView;

// ---------------------------------------------------------------------------
// Events: viewer -> host (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the host via stdout as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ViewerEvent {
    Starting {},
    Ready {
        authenticated: bool,
    },
    Pong {},
    LoggedIn {
        user: serde_json::Value,
    },
    LoggedOut {},
    Conversations {
        conversations: Vec<Conversation>,
    },
    Messages {
        phone: String,
        messages: Vec<ChatMessage>,
        /// Tallies over the whole conversation, before any filter.
        counts: MessageCounts,
    },
    MediaState {
        id: String,
        view: MediaView,
    },
    Progress {
        id: String,
        playback: PlaybackSnapshot,
        /// `m:ss` renderings of offset and duration.
        elapsed: String,
        duration: String,
    },
    PlaybackEnded {
        id: String,
    },
    Downloaded {
        id: String,
        path: String,
    },
    AudioDevices {
        output: Vec<String>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        message: String,
    },
    Stopping {},
}

// ---------------------------------------------------------------------------
// Commands: host -> viewer (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the host via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum ViewerCommand {
    Ping {},
    Stop {},
    Login {
        email: String,
        password: String,
    },
    Logout {},
    ListConversations {
        #[serde(default)]
        search: String,
    },
    /// Messages of one conversation, optionally narrowed by text and type.
    ListMessages {
        phone: String,
        #[serde(default)]
        search: String,
        #[serde(default)]
        message_type: Option<MessageType>,
    },
    /// Open a viewer under `id` for a media reference. `message` is the
    /// chat text the media belongs to, scanned for a transcription.
    OpenMedia {
        id: String,
        #[serde(flatten)]
        reference: MediaReference,
        #[serde(default)]
        message: Option<String>,
    },
    Play {
        id: String,
    },
    Pause {
        id: String,
    },
    Seek {
        id: String,
        fraction: f64,
    },
    SetVolume {
        id: String,
        volume: f32,
    },
    Download {
        id: String,
        #[serde(default)]
        dest_dir: Option<String>,
    },
    CloseMedia {
        id: String,
    },
    ListAudioDevices {},
    GetState {
        #[serde(default)]
        id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use serde_json::json;

    #[test]
    fn events_use_event_and_data() {
        let json = serde_json::to_value(ViewerEvent::Pong {}).unwrap();
        assert_eq!(json, json!({"event": "pong", "data": {}}));

        let json = serde_json::to_value(ViewerEvent::PlaybackEnded { id: "m1".into() }).unwrap();
        assert_eq!(json, json!({"event": "playback_ended", "data": {"id": "m1"}}));

        let json = serde_json::to_value(ViewerEvent::Error {
            id: None,
            kind: Some(ErrorKind::Decode),
            message: "bad".into(),
        })
        .unwrap();
        assert_eq!(json, json!({"event": "error", "data": {"kind": "decode", "message": "bad"}}));
    }

    #[test]
    fn media_state_nests_view() {
        let json = serde_json::to_value(ViewerEvent::MediaState {
            id: "m1".into(),
            view: MediaView::Image { url: "http://x/p.jpg".into() },
        })
        .unwrap();
        assert_eq!(json["event"], "media_state");
        assert_eq!(json["data"]["view"]["status"], "image");
    }

    #[test]
    fn parses_open_media() {
        let cmd: ViewerCommand = serde_json::from_value(json!({
            "command": "open_media",
            "id": "m1",
            "collectionId": "col",
            "recordId": "rec",
            "fileName": "note.ogg",
            "kind": "audio",
            "message": "Nota de voz - Transcripción: hola"
        }))
        .unwrap();
        assert_eq!(
            cmd,
            ViewerCommand::OpenMedia {
                id: "m1".into(),
                reference: MediaReference::new("col", "rec", "note.ogg", MediaKind::Audio),
                message: Some("Nota de voz - Transcripción: hola".into()),
            }
        );
    }

    #[test]
    fn parses_simple_commands() {
        let cmd: ViewerCommand =
            serde_json::from_value(json!({"command": "seek", "id": "m1", "fraction": 0.5})).unwrap();
        assert_eq!(cmd, ViewerCommand::Seek { id: "m1".into(), fraction: 0.5 });

        let cmd: ViewerCommand = serde_json::from_value(json!({"command": "list_conversations"})).unwrap();
        assert_eq!(cmd, ViewerCommand::ListConversations { search: String::new() });

        let cmd: ViewerCommand = serde_json::from_value(json!({"command": "list_messages", "phone": "111"})).unwrap();
        assert_eq!(
            cmd,
            ViewerCommand::ListMessages { phone: "111".into(), search: String::new(), message_type: None }
        );

        let cmd: ViewerCommand = serde_json::from_value(
            json!({"command": "list_messages", "phone": "111", "search": "hola", "message_type": "voice"}),
        )
        .unwrap();
        assert_eq!(
            cmd,
            ViewerCommand::ListMessages {
                phone: "111".into(),
                search: "hola".into(),
                message_type: Some(MessageType::Voice),
            }
        );

        let cmd: ViewerCommand = serde_json::from_value(json!({"command": "get_state"})).unwrap();
        assert_eq!(cmd, ViewerCommand::GetState { id: None });

        assert!(serde_json::from_value::<ViewerCommand>(json!({"command": "fly"})).is_err());
    }
}
