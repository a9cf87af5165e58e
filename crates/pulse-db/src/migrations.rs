use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Identity mirror: owned by the auth collaborator, refreshed on join.
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            display_name  TEXT NOT NULL,
            last_seen_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Append-only message log. AUTOINCREMENT ids are assigned in commit
        -- order and serve as the tiebreak for equal created_at timestamps.
        -- to_user_id NULL means public broadcast.
        CREATE TABLE IF NOT EXISTS messages (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            from_user_id  TEXT NOT NULL REFERENCES users(id),
            to_user_id    TEXT REFERENCES users(id),
            text          TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            delivered     INTEGER NOT NULL DEFAULT 0,
            read          INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(from_user_id, to_user_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_pair_inverse
            ON messages(to_user_id, from_user_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
