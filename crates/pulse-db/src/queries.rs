use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use pulse_types::models::{ConversationSummary, Message};

use crate::Database;
use crate::models::{MessageRow, UserRow};

/// Canonical storage format for timestamps: RFC 3339 with millisecond
/// precision, always UTC. Lexicographic order equals chronological order.
pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    // -- Users --

    /// Refresh the identity mirror on join. Display names are owned by the
    /// auth collaborator; we only cache the latest value we were handed.
    pub fn upsert_user(&self, id: &str, display_name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                     display_name = excluded.display_name,
                     last_seen_at = datetime('now')",
                (id, display_name),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, display_name, last_seen_at FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        last_seen_at: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Messages --

    /// Append one message and return its assigned id. Commits are serialized
    /// by the connection mutex, so ids come back monotonic in commit order.
    pub fn insert_message(
        &self,
        from_user_id: &str,
        to_user_id: Option<&str>,
        text: &str,
        created_at: &DateTime<Utc>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (from_user_id, to_user_id, text, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![from_user_id, to_user_id, text, timestamp(created_at)],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// The most recent `limit` messages between `viewer` and `other`,
    /// oldest-first for display.
    ///
    /// Read-on-view side effect: every returned message addressed to
    /// `viewer` that was unread when the page was selected flips to
    /// delivered+read, in the same transaction as the SELECT. The update is
    /// bounded to the selected id range: a message committed after the query
    /// started is never silently marked read, and when `limit` truncates the
    /// page, unread messages older than the page stay unread until viewed.
    pub fn fetch_thread(&self, viewer: &str, other: &str, limit: u32) -> Result<Vec<Message>> {
        let mut rows = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let mut rows = {
                let mut stmt = tx.prepare(
                    "SELECT id, from_user_id, to_user_id, text, created_at, delivered, read
                     FROM messages
                     WHERE (from_user_id = ?1 AND to_user_id = ?2)
                        OR (from_user_id = ?2 AND to_user_id = ?1)
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?3",
                )?;
                stmt.query_map(rusqlite::params![viewer, other, limit], message_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            // The selected page bounds the read transition on both ends.
            let page = match (rows.last(), rows.first()) {
                (Some(oldest), Some(newest)) => Some((oldest.id, newest.id)),
                _ => None,
            };
            if let Some((oldest_id, newest_id)) = page {
                tx.execute(
                    "UPDATE messages SET delivered = 1, read = 1
                     WHERE from_user_id = ?1 AND to_user_id = ?2
                       AND read = 0 AND id BETWEEN ?3 AND ?4",
                    rusqlite::params![other, viewer, oldest_id, newest_id],
                )?;
            }

            tx.commit()?;

            // Reflect the transition in the returned page.
            for row in rows.iter_mut() {
                if row.to_user_id.as_deref() == Some(viewer) && !row.read {
                    row.delivered = true;
                    row.read = true;
                }
            }

            Ok(rows)
        })?;

        rows.reverse();
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Per-peer conversation summaries for `user`, most recent first.
    /// Public messages (to_user_id NULL) never form a conversation.
    pub fn list_conversations(&self, user: &str) -> Result<Vec<ConversationSummary>> {
        let mut summaries = self.with_conn(|conn| {
            let peers: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT
                        CASE WHEN from_user_id = ?1 THEN to_user_id ELSE from_user_id END
                     FROM messages
                     WHERE (from_user_id = ?1 OR to_user_id = ?1)
                       AND to_user_id IS NOT NULL",
                )?;
                stmt.query_map([user], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let mut summaries = Vec::with_capacity(peers.len());
            for peer in peers {
                let Some(last) = last_message_between(conn, user, &peer)? else {
                    continue;
                };

                let unread: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages
                     WHERE from_user_id = ?1 AND to_user_id = ?2 AND read = 0",
                    rusqlite::params![peer, user],
                    |row| row.get(0),
                )?;

                let display_name: Option<String> = conn
                    .query_row(
                        "SELECT display_name FROM users WHERE id = ?1",
                        [&peer],
                        |row| row.get(0),
                    )
                    .optional()?;

                summaries.push(ConversationSummary {
                    other_user_id: peer
                        .parse()
                        .map_err(|e| anyhow!("corrupt peer id '{}': {}", peer, e))?,
                    other_display_name: display_name.unwrap_or_else(|| "unknown".to_string()),
                    last_message: last.into_message()?,
                    unread_count: unread as u64,
                });
            }
            Ok(summaries)
        })?;

        summaries.sort_by(|a, b| b.last_message.sort_key().cmp(&a.last_message.sort_key()));
        Ok(summaries)
    }

    /// Unread count for one direction of one pair. The invariant checked by
    /// the conversation list and the tests.
    pub fn count_unread(&self, to_user: &str, from_user: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE from_user_id = ?1 AND to_user_id = ?2 AND read = 0",
                rusqlite::params![from_user, to_user],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

fn message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        from_user_id: row.get(1)?,
        to_user_id: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
        delivered: row.get::<_, i64>(5)? != 0,
        read: row.get::<_, i64>(6)? != 0,
    })
}

fn last_message_between(conn: &Connection, a: &str, b: &str) -> Result<Option<MessageRow>> {
    conn.query_row(
        "SELECT id, from_user_id, to_user_id, text, created_at, delivered, read
         FROM messages
         WHERE (from_user_id = ?1 AND to_user_id = ?2)
            OR (from_user_id = ?2 AND to_user_id = ?1)
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
        rusqlite::params![a, b],
        message_row,
    )
    .optional()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn open_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("pulse.db")).unwrap();
        (db, dir)
    }

    fn seed_user(db: &Database) -> String {
        let id = Uuid::new_v4().to_string();
        db.upsert_user(&id, "someone").unwrap();
        id
    }

    #[test]
    fn ids_are_monotonic_in_commit_order() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        let mut prev = 0;
        for i in 0..5 {
            let id = db
                .insert_message(&a, Some(&b), &format!("msg {}", i), &Utc::now())
                .unwrap();
            assert!(id > prev, "id {} not greater than {}", id, prev);
            prev = id;
        }
    }

    #[test]
    fn send_then_fetch_round_trips() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        let at = Utc::now();
        let id = db.insert_message(&a, Some(&b), "hello", &at).unwrap();

        let thread = db.fetch_thread(&a, &b, 50).unwrap();
        assert_eq!(thread.len(), 1);
        let msg = &thread[0];
        assert_eq!(msg.id, id);
        assert_eq!(msg.from_user_id.to_string(), a);
        assert_eq!(msg.to_user_id.unwrap().to_string(), b);
        assert_eq!(msg.text, "hello");
        assert_eq!(timestamp(&msg.created_at), timestamp(&at));
    }

    #[test]
    fn fetch_thread_marks_read_and_is_idempotent() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        db.insert_message(&a, Some(&b), "one", &Utc::now()).unwrap();
        db.insert_message(&a, Some(&b), "two", &Utc::now()).unwrap();
        assert_eq!(db.count_unread(&b, &a).unwrap(), 2);

        // B opens the thread: everything addressed to B flips to read.
        let thread = db.fetch_thread(&b, &a, 50).unwrap();
        assert!(thread.iter().all(|m| m.delivered && m.read));
        assert_eq!(db.count_unread(&b, &a).unwrap(), 0);

        // Second open finds nothing left to transition.
        let again = db.fetch_thread(&b, &a, 50).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(db.count_unread(&b, &a).unwrap(), 0);
    }

    #[test]
    fn truncated_page_leaves_older_messages_unread() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        for i in 0..3 {
            db.insert_message(&a, Some(&b), &format!("m{}", i), &Utc::now())
                .unwrap();
        }
        assert_eq!(db.count_unread(&b, &a).unwrap(), 3);

        // B only sees the newest message; the two older ones were never
        // returned and must stay unread.
        let page = db.fetch_thread(&b, &a, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].text, "m2");
        assert!(page[0].read);
        assert_eq!(db.count_unread(&b, &a).unwrap(), 2);

        // Viewing the full thread clears the rest.
        db.fetch_thread(&b, &a, 50).unwrap();
        assert_eq!(db.count_unread(&b, &a).unwrap(), 0);
    }

    #[test]
    fn read_transition_is_scoped_to_the_viewed_pair() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);
        let c = seed_user(&db);

        db.insert_message(&a, Some(&b), "from a", &Utc::now()).unwrap();
        db.insert_message(&c, Some(&b), "from c", &Utc::now()).unwrap();

        db.fetch_thread(&b, &a, 50).unwrap();
        assert_eq!(db.count_unread(&b, &a).unwrap(), 0);
        assert_eq!(db.count_unread(&b, &c).unwrap(), 1);
    }

    #[test]
    fn thread_is_returned_oldest_first() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        for i in 0..3 {
            db.insert_message(&a, Some(&b), &format!("m{}", i), &Utc::now())
                .unwrap();
        }

        let thread = db.fetch_thread(&a, &b, 50).unwrap();
        let ids: Vec<i64> = thread.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(thread[0].text, "m0");
        assert_eq!(thread[2].text, "m2");
    }

    #[test]
    fn equal_timestamps_tie_break_by_id() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        // Same millisecond for both commits.
        let at = Utc::now();
        db.insert_message(&a, Some(&b), "first", &at).unwrap();
        let second = db.insert_message(&a, Some(&b), "second", &at).unwrap();

        let convs = db.list_conversations(&b).unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].last_message.id, second);
        assert_eq!(convs[0].last_message.text, "second");
    }

    #[test]
    fn public_messages_never_form_conversations() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        db.insert_message(&a, None, "announcement", &Utc::now()).unwrap();
        assert!(db.list_conversations(&a).unwrap().is_empty());
        assert!(db.list_conversations(&b).unwrap().is_empty());
        assert!(db.fetch_thread(&a, &b, 50).unwrap().is_empty());
    }

    #[test]
    fn end_to_end_unread_bookkeeping() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);

        // A sends "hi" while B is offline; the commit succeeds regardless.
        db.insert_message(&a, Some(&b), "hi", &Utc::now()).unwrap();

        let a_convs = db.list_conversations(&a).unwrap();
        assert_eq!(a_convs.len(), 1);
        assert_eq!(a_convs[0].last_message.text, "hi");
        assert_eq!(a_convs[0].unread_count, 0);

        let b_convs = db.list_conversations(&b).unwrap();
        assert_eq!(b_convs[0].last_message.text, "hi");
        assert_eq!(b_convs[0].unread_count, 1);

        // B connects later and opens the thread.
        let thread = db.fetch_thread(&b, &a, 50).unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(db.list_conversations(&b).unwrap()[0].unread_count, 0);
    }

    #[test]
    fn conversations_sort_by_most_recent_activity() {
        let (db, _dir) = open_db();
        let a = seed_user(&db);
        let b = seed_user(&db);
        let c = seed_user(&db);

        db.insert_message(&b, Some(&a), "older", &Utc::now()).unwrap();
        db.insert_message(&c, Some(&a), "newer", &Utc::now()).unwrap();

        let convs = db.list_conversations(&a).unwrap();
        assert_eq!(convs.len(), 2);
        assert_eq!(convs[0].other_user_id.to_string(), c);
        assert_eq!(convs[1].other_user_id.to_string(), b);
    }
}
