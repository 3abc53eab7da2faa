//! Record store access: PocketBase client, conversations and auth.

pub mod auth;
pub mod client;
pub mod conversations;

pub use auth::{AuthSession, AuthStore};
pub use client::{ListOptions, PocketBase};
pub use conversations::{
    classify_message, filter_messages, media_reference, openable_reference, ChatMessage,
    Conversation, ConversationService, MessageCounts, MessageList, MessageType,
};
