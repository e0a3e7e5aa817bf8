use rusqlite::Connection;

use super::StoreError;

/// Create all tables and indexes if they don't already exist. Idempotent —
/// safe to call on every startup, matching `core-rs::db::migrate`.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            password_hash TEXT NOT NULL DEFAULT '',
            api_token TEXT UNIQUE NOT NULL,
            plan TEXT NOT NULL DEFAULT 'basic',
            devices_limit INTEGER NOT NULL DEFAULT 5,
            created_at INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_users_api_token ON users(api_token);

        CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            device_token TEXT UNIQUE NOT NULL,
            cloud INTEGER NOT NULL DEFAULT 1,
            added INTEGER NOT NULL,
            last_seen INTEGER,
            poll_count INTEGER NOT NULL DEFAULT 0,
            last_request_counter INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_device_id ON devices(device_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_device_token ON devices(device_token);
        CREATE INDEX IF NOT EXISTS idx_devices_user_id ON devices(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            device_token TEXT,
            message_type TEXT NOT NULL,
            message_data TEXT NOT NULL,
            signature TEXT,
            direction TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_device_id ON messages(device_id);
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_direction ON messages(direction);

        CREATE TABLE IF NOT EXISTS server_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}
