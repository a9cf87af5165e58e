//! Client-side reconciliation of optimistic placeholders with
//! server-confirmed messages.
//!
//! A client may render a message immediately on submit, under a
//! locally-generated temporary id, before the server confirms the commit.
//! The confirmed frame (direct reply or multi-tab echo) is matched back to
//! the placeholder so exactly one message remains visible. Matching prefers
//! the canonical id once one has been seen; the field-match heuristic inside
//! [`DEDUP_WINDOW`] is a fallback for the first confirmation only.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::Message;

/// How far apart a placeholder's submit time and the confirmed message's
/// commit time may be for the heuristic match to apply.
pub const DEDUP_WINDOW_SECS: i64 = 5;

/// An optimistic placeholder awaiting server confirmation.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub local_id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Option<Uuid>,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

/// One entry in the client-visible thread.
#[derive(Debug, Clone)]
pub enum ThreadEntry {
    Pending(PendingSend),
    Confirmed(Message),
}

impl ThreadEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Outcome of applying a confirmed message to the view.
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    /// Replaced the placeholder with this local id.
    Reconciled(Uuid),
    /// No placeholder matched; appended as a new message.
    Inserted,
    /// Canonical id already seen; echo dropped.
    Duplicate,
}

/// Client-visible state of one thread.
#[derive(Debug, Default)]
pub struct ThreadView {
    entries: Vec<ThreadEntry>,
    seen_ids: HashSet<i64>,
}

impl ThreadView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ThreadEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render an optimistic placeholder immediately on submit.
    pub fn push_pending(&mut self, pending: PendingSend) {
        self.entries.push(ThreadEntry::Pending(pending));
    }

    /// Apply a server-confirmed message (direct reply, echo, or push).
    pub fn apply_confirmed(&mut self, msg: Message) -> Applied {
        if !self.seen_ids.insert(msg.id) {
            return Applied::Duplicate;
        }

        let window = Duration::seconds(DEDUP_WINDOW_SECS);
        let slot = self.entries.iter().position(|e| match e {
            ThreadEntry::Pending(p) => {
                p.from_user_id == msg.from_user_id
                    && p.to_user_id == msg.to_user_id
                    && p.text == msg.text
                    && (msg.created_at - p.submitted_at).abs() <= window
            }
            ThreadEntry::Confirmed(_) => false,
        });

        match slot {
            Some(i) => {
                let local_id = match &self.entries[i] {
                    ThreadEntry::Pending(p) => p.local_id,
                    ThreadEntry::Confirmed(_) => unreachable!(),
                };
                self.entries[i] = ThreadEntry::Confirmed(msg);
                Applied::Reconciled(local_id)
            }
            None => {
                self.entries.push(ThreadEntry::Confirmed(msg));
                Applied::Inserted
            }
        }
    }
}
