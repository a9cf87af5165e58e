use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typing indicators are stateless on the server: receivers clear a peer's
/// indicator after this long without a follow-up `Typing` frame.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(6);

/// Frames sent FROM client TO server over the WebSocket gateway.
///
/// Every frame is a tagged JSON object `{"type": ..., "data": ...}` and is
/// validated at the connection boundary; anything that fails to parse is
/// answered with an `Error` frame and the connection stays open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Bind this connection to a collaborator-issued identity.
    /// Must be the first frame on a new connection.
    Join { user_id: Uuid, display_name: String },

    /// Send a message. `to_user_id: None` means public broadcast.
    SendMessage {
        to_user_id: Option<Uuid>,
        text: String,
    },

    /// Ephemeral typing indicator toward one recipient.
    Typing { to_user_id: Uuid, is_typing: bool },
}

/// Frames sent FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Acknowledges a successful `Join`.
    Joined { user_id: Uuid },

    /// Seeds a newly-joined client with everyone currently online.
    PresenceSnapshot { user_ids: Vec<Uuid> },

    /// A user came online or went offline.
    PresenceChanged { user_id: Uuid, online: bool },

    /// A committed message: the reply to the sender's own connection, the
    /// echo to the sender's other tabs, and the push to the recipient all
    /// carry this same frame.
    Message {
        id: i64,
        from_user_id: Uuid,
        to_user_id: Option<Uuid>,
        text: String,
        created_at: DateTime<Utc>,
    },

    /// Relayed typing indicator. Receivers clear it themselves after
    /// [`TYPING_EXPIRY`] if no follow-up arrives.
    Typing { from_user_id: Uuid, is_typing: bool },

    /// Request-scoped failure; the connection stays open.
    Error { code: String, message: String },
}

impl ServerFrame {
    pub fn message(msg: &crate::models::Message) -> Self {
        Self::Message {
            id: msg.id,
            from_user_id: msg.from_user_id,
            to_user_id: msg.to_user_id,
            text: msg.text.clone(),
            created_at: msg.created_at,
        }
    }

    pub fn error(err: &crate::error::CoreError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_round_trip_tagged_json() {
        let raw = r#"{"type":"SendMessage","data":{"to_user_id":null,"text":"hi all"}}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::SendMessage { to_user_id, text } => {
                assert!(to_user_id.is_none());
                assert_eq!(text, "hi all");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn malformed_frame_is_rejected() {
        let raw = r#"{"type":"SendMessage","data":{"text":42}}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }

    #[test]
    fn server_error_frame_carries_code() {
        let err = crate::error::CoreError::Validation("empty text".into());
        let frame = ServerFrame::error(&err);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""code":"validation""#));
    }
}
