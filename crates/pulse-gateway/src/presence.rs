use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use pulse_types::frames::ServerFrame;

/// How long an emptied connection set waits before the offline notification
/// goes out. A reconnect inside this window (page refresh) suppresses it.
pub const OFFLINE_DEBOUNCE: Duration = Duration::from_secs(2);

/// In-memory map of user identity to live connections.
///
/// All mutations are synchronous and non-blocking: the mutex is only held
/// for map updates and unbounded channel sends, never across an await.
/// `leave` spawns the debounce timer onto the runtime, so the registry must
/// be used from within one.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    users: HashMap<Uuid, UserEntry>,
    /// connection_id -> user_id, so `leave` needs only the connection id.
    owners: HashMap<Uuid, Uuid>,
}

#[derive(Default)]
struct UserEntry {
    connections: HashMap<Uuid, UnboundedSender<ServerFrame>>,
    /// Bumped on every membership change; a debounce task only fires if the
    /// epoch it captured is still current.
    epoch: u64,
    /// What the rest of the server has been told. Stays true through the
    /// debounce window so a quick reconnect causes no flicker.
    reported_online: bool,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection. Idempotent per connection id. The first
    /// connection for a user announces them online to everyone else.
    pub fn join(&self, user_id: Uuid, connection_id: Uuid, tx: UnboundedSender<ServerFrame>) {
        let announce = {
            let mut reg = self.inner.lock().expect("presence lock poisoned");
            reg.owners.insert(connection_id, user_id);
            let entry = reg.users.entry(user_id).or_default();
            entry.connections.insert(connection_id, tx);
            entry.epoch += 1;

            if entry.reported_online {
                None
            } else {
                entry.reported_online = true;
                Some(reg.peers_of(user_id))
            }
        };

        if let Some(peers) = announce {
            debug!("user {} is now online", user_id);
            notify(&peers, ServerFrame::PresenceChanged { user_id, online: true });
        }
    }

    /// Drop a connection. Unknown connection ids are a no-op (the disconnect
    /// already got cleaned up). When the last connection goes, the offline
    /// notification is deferred by [`OFFLINE_DEBOUNCE`].
    pub fn leave(&self, connection_id: Uuid) {
        let pending = {
            let mut reg = self.inner.lock().expect("presence lock poisoned");
            let Some(user_id) = reg.owners.remove(&connection_id) else {
                return;
            };
            let Some(entry) = reg.users.get_mut(&user_id) else {
                return;
            };
            entry.connections.remove(&connection_id);
            entry.epoch += 1;

            if entry.connections.is_empty() {
                Some((user_id, entry.epoch))
            } else {
                None
            }
        };

        if let Some((user_id, epoch)) = pending {
            let registry = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(OFFLINE_DEBOUNCE).await;
                registry.finish_offline(user_id, epoch);
            });
        }
    }

    /// Runs after the debounce window; only takes effect if no connection
    /// came or went for this user in the meantime.
    fn finish_offline(&self, user_id: Uuid, epoch: u64) {
        let peers = {
            let mut reg = self.inner.lock().expect("presence lock poisoned");
            let still_gone = reg
                .users
                .get(&user_id)
                .map(|e| e.connections.is_empty() && e.epoch == epoch)
                .unwrap_or(false);
            if !still_gone {
                return;
            }
            reg.users.remove(&user_id);
            reg.peers_of(user_id)
        };

        debug!("user {} is now offline", user_id);
        notify(&peers, ServerFrame::PresenceChanged { user_id, online: false });
    }

    /// Currently-online user ids, used to seed a newly-joined client.
    pub fn snapshot(&self) -> Vec<Uuid> {
        let reg = self.inner.lock().expect("presence lock poisoned");
        reg.users
            .iter()
            .filter(|(_, e)| e.reported_online)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Live connections of one user, for fan-out.
    pub fn connections_of(&self, user_id: Uuid) -> Vec<(Uuid, UnboundedSender<ServerFrame>)> {
        let reg = self.inner.lock().expect("presence lock poisoned");
        reg.users
            .get(&user_id)
            .map(|e| {
                e.connections
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push a frame to every live connection of one user.
    pub fn send_to_user(&self, user_id: Uuid, frame: ServerFrame) {
        for (_, tx) in self.connections_of(user_id) {
            let _ = tx.send(frame.clone());
        }
    }

    /// Push a frame to every live connection except one (public fan-out).
    pub fn broadcast_except(&self, exclude_connection: Option<Uuid>, frame: ServerFrame) {
        let targets: Vec<_> = {
            let reg = self.inner.lock().expect("presence lock poisoned");
            reg.users
                .values()
                .flat_map(|e| e.connections.iter())
                .filter(|(id, _)| Some(**id) != exclude_connection)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        notify(&targets, frame);
    }
}

impl Registry {
    /// Every connection belonging to someone other than `user_id`.
    fn peers_of(&self, user_id: Uuid) -> Vec<UnboundedSender<ServerFrame>> {
        self.users
            .iter()
            .filter(|(id, _)| **id != user_id)
            .flat_map(|(_, e)| e.connections.values().cloned())
            .collect()
    }
}

fn notify(targets: &[UnboundedSender<ServerFrame>], frame: ServerFrame) {
    for tx in targets {
        // A closed receiver means the connection is tearing down; its own
        // leave() will clean up.
        let _ = tx.send(frame.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn() -> (Uuid, UnboundedSender<ServerFrame>, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), tx, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn second_tab_keeps_user_online() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (c1, tx1, _rx1) = conn();
        let (c2, tx2, _rx2) = conn();

        registry.join(user, c1, tx1);
        registry.join(user, c2, tx2);
        registry.leave(c1);

        tokio::time::sleep(OFFLINE_DEBOUNCE * 2).await;
        assert_eq!(registry.snapshot(), vec![user]);

        registry.leave(c2);
        tokio::time::sleep(OFFLINE_DEBOUNCE * 2).await;
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_reconnect_suppresses_offline_flicker() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let observer = Uuid::new_v4();
        let (oc, otx, mut orx) = conn();
        registry.join(observer, oc, otx);

        let (c1, tx1, _rx1) = conn();
        registry.join(user, c1, tx1);
        registry.leave(c1);

        // Page refresh: back before the debounce window closes.
        tokio::time::sleep(OFFLINE_DEBOUNCE / 2).await;
        let (c2, tx2, _rx2) = conn();
        registry.join(user, c2, tx2);

        tokio::time::sleep(OFFLINE_DEBOUNCE * 3).await;

        let frames = drain(&mut orx);
        let changes: Vec<bool> = frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::PresenceChanged { user_id, online } if *user_id == user => {
                    Some(*online)
                }
                _ => None,
            })
            .collect();
        // Exactly the initial online announcement; no offline, no re-online.
        assert_eq!(changes, vec![true]);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_is_announced_to_peers_after_debounce() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let observer = Uuid::new_v4();
        let (oc, otx, mut orx) = conn();
        registry.join(observer, oc, otx);

        let (c1, tx1, _rx1) = conn();
        registry.join(user, c1, tx1);
        registry.leave(c1);
        tokio::time::sleep(OFFLINE_DEBOUNCE * 2).await;

        let changes: Vec<bool> = drain(&mut orx)
            .iter()
            .filter_map(|f| match f {
                ServerFrame::PresenceChanged { user_id, online } if *user_id == user => {
                    Some(*online)
                }
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![true, false]);
    }

    #[tokio::test]
    async fn unknown_connection_leave_is_a_noop() {
        let registry = PresenceRegistry::new();
        registry.leave(Uuid::new_v4());
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn join_is_idempotent_per_connection() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (c1, tx1, _rx1) = conn();
        registry.join(user, c1, tx1.clone());
        registry.join(user, c1, tx1);
        assert_eq!(registry.connections_of(user).len(), 1);
    }
}
