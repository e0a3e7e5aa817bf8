//! Entity store: users, devices, envelopes, server config. One `rusqlite`
//! connection pool behind a thin CRUD layer — mirrors `core-rs::db`'s shape
//! (settings table, `DbPool` type alias) generalized to the relay schema.

pub mod migrations;
pub mod models;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use ulid::Ulid;

pub use models::{Device, Direction, Envelope, MessageType, User};

/// Pool of sqlite connections shared across the cooperative runtime's worker
/// threads. Blocking database calls are offloaded via `spawn_blocking` at the
/// call site in `relay-server`.
pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("device limit exceeded: maximum {0}")]
    DeviceLimitExceeded(i64),
}

/// Open (or create) the sqlite file at `path` and run migrations.
pub fn open_pool(path: &str) -> Result<DbPool, StoreError> {
    let manager = SqliteConnectionManager::file(path);
    let pool = r2d2::Pool::new(manager)?;
    let conn = pool.get()?;
    migrations::migrate(&conn)?;
    Ok(pool)
}

/// In-memory pool, for tests — each connection in the pool would otherwise
/// see its own private database, so cap the pool at one connection.
pub fn open_memory_pool() -> Result<DbPool, StoreError> {
    let manager = SqliteConnectionManager::memory();
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    migrations::migrate(&conn)?;
    Ok(pool)
}

// --- settings ---

pub fn get_setting(pool: &DbPool, key: &str) -> Result<Option<String>, StoreError> {
    let conn = pool.get()?;
    let value = conn
        .query_row("SELECT value FROM server_config WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

pub fn set_setting(pool: &DbPool, key: &str, value: &str) -> Result<(), StoreError> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO server_config (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    Ok(())
}

/// Seed `base_url` if unset, matching the original's `init_db`.
pub fn ensure_base_url(pool: &DbPool, default_url: &str) -> Result<(), StoreError> {
    if get_setting(pool, "base_url")?.is_none() {
        set_setting(pool, "base_url", default_url)?;
        tracing::info!(base_url = default_url, "seeded default base_url");
    }
    Ok(())
}

// --- users ---

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        api_token: row.get(2)?,
        plan: row.get(3)?,
        devices_limit: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const USER_COLUMNS: &str = "id, username, api_token, plan, devices_limit, created_at";

/// Create a user directly (registration itself is an external collaborator's
/// concern; this exists so tests and embedders can seed users without going
/// through an out-of-scope signup flow).
pub fn create_user(
    pool: &DbPool,
    username: &str,
    devices_limit: i64,
) -> Result<User, StoreError> {
    let conn = pool.get()?;
    let id = Ulid::new().to_string();
    let api_token = generate_token(32);
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO users (id, username, api_token, plan, devices_limit, created_at)
         VALUES (?1, ?2, ?3, 'basic', ?4, ?5)",
        params![id, username, api_token, devices_limit, now],
    )?;
    Ok(User {
        id,
        username: username.to_string(),
        api_token,
        plan: "basic".to_string(),
        devices_limit,
        created_at: now,
    })
}

pub fn find_user_by_token(pool: &DbPool, api_token: &str) -> Result<Option<User>, StoreError> {
    let conn = pool.get()?;
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE api_token = ?1"),
            [api_token],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

// --- devices ---

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: row.get(0)?,
        user_id: row.get(1)?,
        device_token: row.get(2)?,
        cloud: row.get(3)?,
        added: row.get(4)?,
        last_seen: row.get(5)?,
        poll_count: row.get(6)?,
        last_request_counter: row.get(7)?,
    })
}

const DEVICE_COLUMNS: &str =
    "device_id, user_id, device_token, cloud, added, last_seen, poll_count, last_request_counter";

pub fn find_device(pool: &DbPool, device_id: &str) -> Result<Option<Device>, StoreError> {
    let conn = pool.get()?;
    let device = conn
        .query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1"),
            [device_id],
            row_to_device,
        )
        .optional()?;
    Ok(device)
}

pub fn find_device_owned_by(
    pool: &DbPool,
    device_id: &str,
    user_id: &str,
) -> Result<Option<Device>, StoreError> {
    let conn = pool.get()?;
    let device = conn
        .query_row(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1 AND user_id = ?2"
            ),
            params![device_id, user_id],
            row_to_device,
        )
        .optional()?;
    Ok(device)
}

pub fn list_devices_for_user(pool: &DbPool, user_id: &str) -> Result<Vec<Device>, StoreError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = ?1 ORDER BY added ASC"
    ))?;
    let devices = stmt
        .query_map([user_id], row_to_device)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(devices)
}

/// Register or update a device for `user_id`. Enforces `devices_limit` on
/// first registration only — re-registering an already-owned device never
/// counts against the limit, matching the original's `save_device`.
pub fn upsert_device(
    pool: &DbPool,
    user: &User,
    device_id: &str,
    device_token: Option<String>,
) -> Result<Device, StoreError> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp();

    let existing = conn
        .query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1 AND user_id = ?2"),
            params![device_id, &user.id],
            row_to_device,
        )
        .optional()?;

    let token = device_token.unwrap_or_else(|| generate_token(16));

    if let Some(mut device) = existing {
        conn.execute(
            "UPDATE devices SET device_token = ?1, cloud = 1, last_seen = ?2 WHERE device_id = ?3",
            params![token, now, device_id],
        )?;
        device.device_token = token;
        device.last_seen = Some(now);
        return Ok(device);
    }

    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM devices WHERE user_id = ?1",
        [&user.id],
        |row| row.get(0),
    )?;
    if count >= user.devices_limit {
        return Err(StoreError::DeviceLimitExceeded(user.devices_limit));
    }

    conn.execute(
        "INSERT INTO devices (device_id, user_id, device_token, cloud, added, last_seen, poll_count, last_request_counter)
         VALUES (?1, ?2, ?3, 1, ?4, NULL, 0, 0)",
        params![device_id, &user.id, token, now],
    )?;

    Ok(Device {
        device_id: device_id.to_string(),
        user_id: user.id.clone(),
        device_token: token,
        cloud: true,
        added: now,
        last_seen: None,
        poll_count: 0,
        last_request_counter: 0,
    })
}

/// Delete a device and cascade-delete its envelopes, in one transaction.
pub fn delete_device(pool: &DbPool, device_id: &str, user_id: &str) -> Result<bool, StoreError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let affected = tx.execute(
        "DELETE FROM devices WHERE device_id = ?1 AND user_id = ?2",
        params![device_id, user_id],
    )?;
    if affected == 0 {
        tx.rollback()?;
        return Ok(false);
    }
    tx.execute("DELETE FROM messages WHERE device_id = ?1", [device_id])?;
    tx.commit()?;
    Ok(true)
}

pub fn touch_device_last_seen(pool: &DbPool, device_id: &str) -> Result<(), StoreError> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "UPDATE devices SET last_seen = ?1 WHERE device_id = ?2",
        params![now, device_id],
    )?;
    Ok(())
}

/// Raise `last_request_counter` to `counter` unless it's already higher —
/// strictly monotonic; a lower counter is silently ignored, never an error,
/// as re-deliveries are legitimate.
pub fn bump_request_counter(pool: &DbPool, device_id: &str, counter: i64) -> Result<(), StoreError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE devices SET last_request_counter = ?1
         WHERE device_id = ?2 AND last_request_counter <= ?1",
        params![counter, device_id],
    )?;
    Ok(())
}

pub fn increment_poll_count(pool: &DbPool, device_id: &str) -> Result<(), StoreError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE devices SET poll_count = poll_count + 1 WHERE device_id = ?1",
        [device_id],
    )?;
    Ok(())
}

pub fn count_devices(pool: &DbPool) -> Result<i64, StoreError> {
    let conn = pool.get()?;
    Ok(conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?)
}

pub fn count_online_devices(pool: &DbPool) -> Result<i64, StoreError> {
    let conn = pool.get()?;
    let cutoff = chrono::Utc::now().timestamp() - crate::PRESENCE_WINDOW_SECS;
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM devices WHERE last_seen >= ?1",
        [cutoff],
        |row| row.get(0),
    )?)
}

pub fn count_users(pool: &DbPool) -> Result<i64, StoreError> {
    let conn = pool.get()?;
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
}

// --- envelopes ---

fn row_to_envelope(row: &rusqlite::Row) -> rusqlite::Result<Envelope> {
    let message_type_str: String = row.get(3)?;
    let direction_str: String = row.get(6)?;
    Ok(Envelope {
        id: row.get(0)?,
        device_id: row.get(1)?,
        device_token: row.get(2)?,
        message_type: if message_type_str == "command" {
            MessageType::Command
        } else {
            MessageType::Response
        },
        message_data: row.get(4)?,
        signature: row.get(5)?,
        direction: Direction::parse(&direction_str).unwrap_or(Direction::ToDevice),
        timestamp: row.get(7)?,
    })
}

const ENVELOPE_COLUMNS: &str =
    "id, device_id, device_token, message_type, message_data, signature, direction, timestamp";

/// Append a durable envelope row. `direction` fully determines
/// `message_type` (see `Direction::message_type`), enforcing that invariant
/// by construction.
pub fn insert_envelope(
    pool: &DbPool,
    device_id: &str,
    device_token: Option<&str>,
    message_data: &str,
    signature: Option<&str>,
    direction: Direction,
) -> Result<Envelope, StoreError> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp();
    let message_type = match direction.message_type() {
        MessageType::Command => "command",
        MessageType::Response => "response",
    };
    conn.execute(
        "INSERT INTO messages (device_id, device_token, message_type, message_data, signature, direction, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![device_id, device_token, message_type, message_data, signature, direction.as_str(), now],
    )?;
    let id = conn.last_insert_rowid();
    Ok(Envelope {
        id,
        device_id: device_id.to_string(),
        device_token: device_token.map(str::to_string),
        message_type: direction.message_type(),
        message_data: message_data.to_string(),
        signature: signature.map(str::to_string),
        direction,
        timestamp: now,
    })
}

/// All envelopes for `(device_id, direction)` in ascending timestamp order —
/// strict FIFO delivery order.
pub fn list_envelopes(
    pool: &DbPool,
    device_id: &str,
    direction: Direction,
) -> Result<Vec<Envelope>, StoreError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENVELOPE_COLUMNS} FROM messages WHERE device_id = ?1 AND direction = ?2 ORDER BY timestamp ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map(params![device_id, direction.as_str()], row_to_envelope)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete a specific set of envelopes by id — used to make "read and delete"
/// an atomic pull, not a window where a concurrent sweep could double-delete.
pub fn delete_envelopes(pool: &DbPool, ids: &[i64]) -> Result<(), StoreError> {
    if ids.is_empty() {
        return Ok(());
    }
    let conn = pool.get()?;
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!("DELETE FROM messages WHERE id IN ({placeholders})");
    let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    conn.execute(&sql, params.as_slice())?;
    Ok(())
}

/// Retention sweep: delete every envelope older than `cutoff` (unix seconds).
/// Runs in its own transaction so it never blocks a concurrent pull's delete.
pub fn delete_envelopes_older_than(pool: &DbPool, cutoff: i64) -> Result<usize, StoreError> {
    let conn = pool.get()?;
    let deleted = conn.execute("DELETE FROM messages WHERE timestamp < ?1", [cutoff])?;
    Ok(deleted)
}

pub fn count_envelopes_by_direction(pool: &DbPool, direction: Direction) -> Result<i64, StoreError> {
    let conn = pool.get()?;
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE direction = ?1",
        [direction.as_str()],
        |row| row.get(0),
    )?)
}

fn generate_token(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
