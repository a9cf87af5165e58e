use tracing::trace;
use uuid::Uuid;

use pulse_types::frames::ServerFrame;

use crate::presence::PresenceRegistry;

/// Ephemeral typing-indicator relay.
///
/// Stateless by design: nothing is persisted or queued, and the server
/// keeps no per-pair timers. Receivers clear a stuck indicator after
/// [`pulse_types::frames::TYPING_EXPIRY`] without a follow-up frame. The
/// one piece of server-side bookkeeping lives in the connection loop, which
/// emits a synthetic `is_typing = false` when a connection drops mid-typing.
#[derive(Clone)]
pub struct TypingChannel {
    presence: PresenceRegistry,
}

impl TypingChannel {
    pub fn new(presence: PresenceRegistry) -> Self {
        Self { presence }
    }

    /// Relay the signal to the recipient's live connections only. Offline
    /// recipients simply never see it.
    pub fn set_typing(&self, from: Uuid, to: Uuid, is_typing: bool) {
        trace!("typing {} -> {}: {}", from, to, is_typing);
        self.presence.send_to_user(
            to,
            ServerFrame::Typing {
                from_user_id: from,
                is_typing,
            },
        );
    }
}
