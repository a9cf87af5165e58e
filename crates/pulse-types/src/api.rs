use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationSummary, Message};

// -- Threads --

#[derive(Debug, Deserialize)]
pub struct ThreadQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub from_user_id: Uuid,
    pub to_user_id: Option<Uuid>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    pub read: bool,
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            from_user_id: m.from_user_id,
            to_user_id: m.to_user_id,
            text: m.text,
            created_at: m.created_at,
            delivered: m.delivered,
            read: m.read,
        }
    }
}

// -- Conversations --

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub other_user_id: Uuid,
    pub other_display_name: String,
    pub last_message: MessageResponse,
    pub unread_count: u64,
}

impl From<ConversationSummary> for ConversationResponse {
    fn from(c: ConversationSummary) -> Self {
        Self {
            other_user_id: c.other_user_id,
            other_display_name: c.other_display_name,
            last_message: c.last_message.into(),
            unread_count: c.unread_count,
        }
    }
}
