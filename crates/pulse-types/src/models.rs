use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user identity as mirrored from the auth collaborator.
/// The messaging core never creates or mutates identities beyond
/// refreshing `display_name` on join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: Uuid,
    pub display_name: String,
}

/// A committed private (or public, when `to_user_id` is `None`) message.
///
/// `id` is assigned by the store at commit time and is monotonically
/// increasing in commit order, which makes it the authoritative tiebreak
/// whenever two messages share a `created_at` millisecond.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub from_user_id: Uuid,
    pub to_user_id: Option<Uuid>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    pub read: bool,
}

impl Message {
    /// Sort key used everywhere a message ordering is needed.
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.id)
    }
}

/// Derived per-peer summary for the conversation list. Never stored;
/// computed on demand from the message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub other_user_id: Uuid,
    pub other_display_name: String,
    pub last_message: Message,
    pub unread_count: u64,
}
