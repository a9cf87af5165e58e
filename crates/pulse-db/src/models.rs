//! Database row types — these map directly to SQLite rows.
//! Distinct from the pulse-types API models to keep the DB layer independent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pulse_types::models::Message;
use uuid::Uuid;

pub struct UserRow {
    pub id: String,
    pub display_name: String,
    pub last_seen_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub from_user_id: String,
    pub to_user_id: Option<String>,
    pub text: String,
    pub created_at: String,
    pub delivered: bool,
    pub read: bool,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        let from_user_id: Uuid = self
            .from_user_id
            .parse()
            .with_context(|| format!("corrupt from_user_id on message {}", self.id))?;
        let to_user_id = match &self.to_user_id {
            Some(raw) => Some(
                raw.parse()
                    .with_context(|| format!("corrupt to_user_id on message {}", self.id))?,
            ),
            None => None,
        };
        let created_at = self
            .created_at
            .parse::<DateTime<Utc>>()
            .with_context(|| format!("corrupt created_at on message {}", self.id))?;

        Ok(Message {
            id: self.id,
            from_user_id,
            to_user_id,
            text: self.text,
            created_at,
            delivered: self.delivered,
            read: self.read,
        })
    }
}
