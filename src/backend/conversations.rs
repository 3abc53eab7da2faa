//! Conversations: chat records grouped by phone number.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use super::client::{quote_filter_value, ListOptions, PocketBase};
use crate::error::{BackendError, ViewerError};
use crate::media::{MediaKind, MediaReference, Resolver};

pub const COLLECTION: &str = "conversations";
const FIELDS: &str = "id,collectionId,phone,name,message,media,timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Voice,
    Image,
    Document,
}

impl MessageType {
    pub fn media_kind(self) -> Option<MediaKind> {
        match self {
            Self::Voice => Some(MediaKind::Audio),
            Self::Image => Some(MediaKind::Image),
            Self::Document => Some(MediaKind::Document),
            Self::Text => None,
        }
    }

    fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Voice,
            MediaKind::Image => Self::Image,
            MediaKind::Document => Self::Document,
        }
    }
}

/// Per-type message tallies for one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageCounts {
    pub text: usize,
    pub voice: usize,
    pub image: usize,
    pub document: usize,
}

impl MessageCounts {
    pub fn add(&mut self, message_type: MessageType) {
        match message_type {
            MessageType::Text => self.text += 1,
            MessageType::Voice => self.voice += 1,
            MessageType::Image => self.image += 1,
            MessageType::Document => self.document += 1,
        }
    }

    pub fn of(messages: &[ChatMessage]) -> Self {
        let mut counts = Self::default();
        for message in messages {
            counts.add(message.message_type);
        }
        counts
    }
}

/// Classify a message by the keywords the bridge writes into its text.
pub fn classify_message(text: &str) -> MessageType {
    let lower = text.to_lowercase();
    if lower.contains("voice") || lower.contains("nota de voz") {
        MessageType::Voice
    } else if lower.contains("image") || lower.contains("archivo multimedia") {
        MessageType::Image
    } else if lower.contains("document") || lower.contains("documento") {
        MessageType::Document
    } else {
        MessageType::Text
    }
}

/// PocketBase datetimes look like `2024-01-15 10:30:00.123Z`; RFC 3339 is
/// accepted too.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

/// A `file` field is a string, or an array when the field allows several.
fn media_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Media {
        One(String),
        Many(Vec<String>),
    }
    let media = Option::<Media>::deserialize(deserializer)?;
    Ok(match media {
        Some(Media::One(name)) => Some(name),
        Some(Media::Many(names)) => names.into_iter().next(),
        None => None,
    }
    .filter(|name| !name.trim().is_empty()))
}

/// One chat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub collection_id: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "media_field")]
    pub media: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default = "default_type")]
    pub message_type: MessageType,
    /// Result of the existence probe; absent when not probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_available: Option<bool>,
}

fn default_type() -> MessageType {
    MessageType::Text
}

impl ChatMessage {
    fn classified(mut self) -> Self {
        self.message_type = classify_message(&self.message);
        self
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Media attached to `message`, for voice, image and document messages.
pub fn media_reference(message: &ChatMessage) -> Option<MediaReference> {
    let kind = message.message_type.media_kind()?;
    let file_name = message.media.as_deref()?;
    Some(MediaReference::new(
        message.collection_id.clone(),
        message.id.clone(),
        file_name,
        kind,
    ))
}

/// Check a host-supplied reference against the chat text it belongs to.
///
/// Goes through the same gate as [`media_reference`]: only voice, image and
/// document messages with a file name qualify, and the requested kind must
/// match the message. Without text the requested kind stands for the type.
pub fn openable_reference(
    reference: MediaReference,
    message: Option<&str>,
) -> Result<MediaReference, ViewerError> {
    let record = ChatMessage {
        id: reference.record_id.clone(),
        collection_id: reference.collection_id.clone(),
        phone: String::new(),
        name: String::new(),
        message: message.unwrap_or_default().to_string(),
        media: Some(reference.file_name.clone()).filter(|name| !name.trim().is_empty()),
        timestamp: String::new(),
        message_type: match message {
            Some(text) => classify_message(text),
            None => MessageType::for_kind(reference.kind),
        },
        media_available: None,
    };

    let gated = media_reference(&record).ok_or_else(|| {
        let reason = if record.media.is_none() {
            "has no media file"
        } else {
            "is not a voice, image or document message"
        };
        ViewerError::InvalidReference(format!("record {} {}", reference.record_id, reason))
    })?;
    if gated.kind != reference.kind {
        return Err(ViewerError::InvalidReference(format!(
            "record {} holds {} media, not {}",
            reference.record_id, gated.kind, reference.kind
        )));
    }
    Ok(reference)
}

/// Case-insensitive text search and type filter over classified messages.
pub fn filter_messages(
    messages: Vec<ChatMessage>,
    search: &str,
    message_type: Option<MessageType>,
) -> Vec<ChatMessage> {
    let needle = search.trim().to_lowercase();
    messages
        .into_iter()
        .filter(|m| needle.is_empty() || m.message.to_lowercase().contains(&needle))
        .filter(|m| message_type.map_or(true, |t| m.message_type == t))
        .collect()
}

/// Messages of one phone number, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub phone: String,
    pub name: String,
    pub last_message: String,
    pub last_timestamp: String,
    pub counts: MessageCounts,
    pub messages: Vec<ChatMessage>,
}

/// The messages of one conversation that passed a filter, with the
/// conversation-wide counts for the type tabs.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageList {
    pub messages: Vec<ChatMessage>,
    pub counts: MessageCounts,
}

/// Group records by phone, in first-seen order. The last message tracks
/// the newest timestamp.
pub fn group_conversations(records: Vec<ChatMessage>) -> Vec<Conversation> {
    let mut order: Vec<String> = Vec::new();
    let mut by_phone: HashMap<String, Conversation> = HashMap::new();

    for record in records {
        let record = record.classified();
        let conversation = by_phone.entry(record.phone.clone()).or_insert_with(|| {
            order.push(record.phone.clone());
            Conversation {
                phone: record.phone.clone(),
                name: record.name.clone(),
                last_message: record.message.clone(),
                last_timestamp: record.timestamp.clone(),
                counts: MessageCounts::default(),
                messages: Vec::new(),
            }
        });

        let newer = match (record.parsed_timestamp(), parse_timestamp(&conversation.last_timestamp)) {
            (Some(candidate), Some(current)) => candidate > current,
            (Some(_), None) => true,
            _ => false,
        };
        if newer {
            conversation.last_timestamp = record.timestamp.clone();
            conversation.last_message = record.message.clone();
        }
        conversation.counts.add(record.message_type);
        conversation.messages.push(record);
    }

    order
        .into_iter()
        .filter_map(|phone| by_phone.remove(&phone))
        .collect()
}

/// Queries over the `conversations` collection.
#[derive(Clone)]
pub struct ConversationService {
    client: PocketBase,
    resolver: Arc<Resolver>,
}

impl ConversationService {
    pub fn new(client: PocketBase, resolver: Arc<Resolver>) -> Self {
        Self { client, resolver }
    }

    /// All conversations, optionally narrowed by a search over name, phone
    /// and message text.
    pub async fn list_conversations(&self, search: &str) -> Result<Vec<Conversation>, BackendError> {
        let search = search.trim();
        let filter = if search.is_empty() {
            None
        } else {
            let quoted = quote_filter_value(search);
            Some(format!(
                "name ~ {q} || phone ~ {q} || message ~ {q}",
                q = quoted
            ))
        };
        let options = ListOptions {
            sort: Some("-timestamp".into()),
            filter,
            fields: Some(FIELDS.into()),
        };

        let records: Vec<ChatMessage> = self.client.get_full_list(COLLECTION, &options).await?;
        debug!(records = records.len(), "Conversation records fetched");
        let conversations = group_conversations(records);
        info!(count = conversations.len(), "Conversations listed");
        Ok(conversations)
    }

    /// Messages for `phone`, oldest first, narrowed by `search` over the
    /// message text and by `message_type`. Media of the kept messages is
    /// probed; the counts cover the whole conversation.
    pub async fn list_messages(
        &self,
        phone: &str,
        search: &str,
        message_type: Option<MessageType>,
    ) -> Result<MessageList, BackendError> {
        let options = ListOptions {
            sort: Some("timestamp".into()),
            filter: Some(format!("phone = {}", quote_filter_value(phone))),
            fields: Some(FIELDS.into()),
        };
        let records: Vec<ChatMessage> = self.client.get_full_list(COLLECTION, &options).await?;
        let messages: Vec<ChatMessage> = records.into_iter().map(ChatMessage::classified).collect();
        let counts = MessageCounts::of(&messages);
        let messages = filter_messages(messages, search, message_type);

        let probes = messages.into_iter().map(|message| self.probe_media(message));
        let messages = join_all(probes).await;
        info!(phone, count = messages.len(), ?message_type, "Messages listed");
        Ok(MessageList { messages, counts })
    }

    async fn probe_media(&self, mut message: ChatMessage) -> ChatMessage {
        let Some(file_name) = message.media.clone() else {
            return message;
        };
        // Probe any attachment, whatever the message type says.
        let kind = message.message_type.media_kind().unwrap_or(MediaKind::Document);
        let reference = MediaReference::new(
            message.collection_id.clone(),
            message.id.clone(),
            file_name,
            kind,
        );
        let available = match self.resolver.resolve(&reference) {
            Ok(url) => self.resolver.probe(&url).await,
            Err(_) => false,
        };
        if !available {
            warn!(id = %message.id, media = ?message.media, "Media file not found");
        }
        message.media_available = Some(available);
        message
    }
}
