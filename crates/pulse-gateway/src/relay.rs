use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use pulse_db::Database;
use pulse_types::error::{CoreError, CoreResult};
use pulse_types::frames::ServerFrame;
use pulse_types::models::Message;

use crate::presence::PresenceRegistry;

/// Hard cap on message text; anything longer is rejected up front.
pub const MAX_TEXT_LEN: usize = 4096;

/// Commits messages to the store and fans them out to live connections.
///
/// Per-sender ordering: each sender has its own async mutex held across
/// commit and fan-out, so two concurrent sends from the same user (even
/// from different tabs) can never commit out of invocation order.
/// Cross-sender interleaving is unordered; consumers sort by
/// `(created_at, id)`.
#[derive(Clone)]
pub struct MessageRelay {
    db: Arc<Database>,
    presence: PresenceRegistry,
    sender_locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MessageRelay {
    pub fn new(db: Arc<Database>, presence: PresenceRegistry) -> Self {
        Self {
            db,
            presence,
            sender_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate, commit, fan out, and return the confirmed message.
    ///
    /// `origin` is the connection the request arrived on; it gets the
    /// confirmed message via the return value rather than the fan-out, so
    /// it can reconcile its optimistic placeholder. A `None` recipient
    /// means public broadcast to every other live connection.
    ///
    /// Once the per-sender lock is held, commit and fan-out run on a
    /// detached task: dropping this future (a mid-send disconnect) cannot
    /// cancel a commit that already started.
    pub async fn send(
        &self,
        from: Uuid,
        to: Option<Uuid>,
        text: String,
        origin: Option<Uuid>,
    ) -> CoreResult<Message> {
        if text.trim().is_empty() {
            return Err(CoreError::Validation("message text is empty".into()));
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(CoreError::Validation(format!(
                "message text exceeds {} characters",
                MAX_TEXT_LEN
            )));
        }

        // Offline recipients are fine; unknown ones are not.
        if let Some(recipient) = to {
            let db = self.db.clone();
            let rid = recipient.to_string();
            let known = tokio::task::spawn_blocking(move || db.get_user(&rid))
                .await
                .map_err(|e| CoreError::Persistence(e.into()))??
                .is_some();
            if !known {
                return Err(CoreError::UnknownRecipient(recipient));
            }
        }

        let lock = self.sender_lock(from);
        let guard = lock.lock_owned().await;

        let relay = self.clone();
        let committed = tokio::spawn(async move {
            let result = relay.commit_and_fan_out(from, to, text, origin).await;
            drop(guard);
            result
        })
        .await
        .map_err(|e| {
            error!("relay task join error: {}", e);
            CoreError::Persistence(e.into())
        })??;

        Ok(committed)
    }

    async fn commit_and_fan_out(
        &self,
        from: Uuid,
        to: Option<Uuid>,
        text: String,
        origin: Option<Uuid>,
    ) -> CoreResult<Message> {
        let created_at = Utc::now();
        let db = self.db.clone();
        let from_s = from.to_string();
        let to_s = to.map(|u| u.to_string());
        let body = text.clone();
        let id = tokio::task::spawn_blocking(move || {
            db.insert_message(&from_s, to_s.as_deref(), &body, &created_at)
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            CoreError::Persistence(e.into())
        })?
        .map_err(|e| {
            error!("message commit failed: {}", e);
            CoreError::Persistence(e)
        })?;

        let message = Message {
            id,
            from_user_id: from,
            to_user_id: to,
            text,
            created_at,
            delivered: false,
            read: false,
        };
        let frame = ServerFrame::message(&message);

        match to {
            Some(recipient) => {
                // Recipient fan-out (skipped for self-sends, which are fully
                // covered by the multi-tab echo below).
                if recipient != from {
                    self.presence.send_to_user(recipient, frame.clone());
                }
                // Multi-tab echo: the sender's other connections.
                for (conn_id, tx) in self.presence.connections_of(from) {
                    if Some(conn_id) != origin {
                        let _ = tx.send(frame.clone());
                    }
                }
            }
            None => {
                self.presence.broadcast_except(origin, frame);
            }
        }

        Ok(message)
    }

    fn sender_lock(&self, sender: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.sender_locks.lock().expect("sender lock map poisoned");
        locks.entry(sender).or_default().clone()
    }
}
