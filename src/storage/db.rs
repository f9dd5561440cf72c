use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Result;

use crate::core::error::AppResult;

/// A user row with per-chat delivery preferences.
pub struct User {
    /// Telegram chat ID (private chats: equals the user ID)
    pub chat_id: i64,
    /// Telegram username, if available
    pub username: Option<String>,
    /// Plan: "free" or "vip"
    pub plan: String,
    /// Preferred quality: "high", "medium", "low", "audio", "custom"
    pub quality: String,
    /// Preferred delivery kind: "video", "audio", "document"
    pub send_as: String,
    /// Download mode: "local" (run immediately) or "queued" (priority queue)
    pub mode: String,
    /// Height cap in pixels when quality is "custom"
    pub custom_height: Option<i64>,
    /// Whether completed downloads are recorded to history (0/1)
    pub history_enabled: i64,
}

impl User {
    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn is_vip(&self) -> bool {
        self.plan == "vip"
    }

    pub fn history_enabled(&self) -> bool {
        self.history_enabled == 1
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Create a new database connection pool
///
/// Initializes a connection pool with up to 10 connections and runs schema
/// migrations. Migration failure is fatal: the payments table's UNIQUE
/// constraint is what makes redemption at-most-once, so a partially
/// migrated database must not serve traffic.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
///
/// # Example
///
/// ```no_run
/// use tubegrab::storage::db;
///
/// let pool = db::create_pool("tubegrab.sqlite")?;
/// # Ok::<(), tubegrab::core::error::AppError>(())
/// ```
pub fn create_pool(database_path: &str) -> AppResult<DbPool> {
    let manager = SqliteConnectionManager::file(database_path);
    let pool = Pool::builder().max_size(10).build(manager)?;

    let conn = pool.get()?;
    migrate_schema(&conn)?;

    Ok(pool)
}

/// Get a connection from the pool
///
/// The connection is automatically returned to the pool when dropped.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

/// Migrate database schema to ensure all required tables and columns exist.
///
/// Safe to run repeatedly: tables are created with IF NOT EXISTS and new
/// columns are added only after checking PRAGMA table_info.
pub fn migrate_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            chat_id INTEGER PRIMARY KEY,
            username TEXT,
            plan TEXT NOT NULL DEFAULT 'free',
            quality TEXT NOT NULL DEFAULT 'high',
            send_as TEXT NOT NULL DEFAULT 'video',
            mode TEXT NOT NULL DEFAULT 'local',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payment_id TEXT NOT NULL UNIQUE,
            chat_id INTEGER NOT NULL,
            provider TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            tokens_left INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'redeemed',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_payments_chat_id ON payments(chat_id);

        CREATE TABLE IF NOT EXISTS delivery_cache (
            fingerprint TEXT PRIMARY KEY,
            canonical_url TEXT NOT NULL,
            file_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            caption TEXT,
            width INTEGER,
            height INTEGER,
            duration INTEGER,
            file_size INTEGER,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_cache_url ON delivery_cache(canonical_url);

        CREATE TABLE IF NOT EXISTS free_quota (
            chat_id INTEGER PRIMARY KEY,
            remaining INTEGER NOT NULL,
            resets_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS download_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            kind TEXT NOT NULL,
            downloaded_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_history_chat_id ON download_history(chat_id);

        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_url TEXT NOT NULL UNIQUE,
            channel_id TEXT NOT NULL,
            title TEXT,
            last_video_id TEXT,
            checked_at DATETIME
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            chat_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL REFERENCES channels(id),
            PRIMARY KEY (chat_id, channel_id)
        );",
    )?;

    let mut stmt = conn.prepare("PRAGMA table_info(users)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }

    // Columns added after the initial release; old databases gain them here.
    if !columns.contains(&"custom_height".to_string()) {
        log::info!("Adding missing column: custom_height to users table");
        conn.execute("ALTER TABLE users ADD COLUMN custom_height INTEGER DEFAULT NULL", [])?;
    }

    if !columns.contains(&"history_enabled".to_string()) {
        log::info!("Adding missing column: history_enabled to users table");
        conn.execute("ALTER TABLE users ADD COLUMN history_enabled INTEGER DEFAULT 0", [])?;
    }

    Ok(())
}

/// Creates the user row with default settings if it does not exist yet.
pub fn ensure_user(conn: &DbConnection, chat_id: i64, username: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users (chat_id, username) VALUES (?1, ?2)",
        rusqlite::params![chat_id, username],
    )?;
    // Keep the username current; people rename themselves
    if username.is_some() {
        conn.execute(
            "UPDATE users SET username = ?1 WHERE chat_id = ?2",
            rusqlite::params![username, chat_id],
        )?;
    }
    Ok(())
}

/// Fetches a user row, or `None` if the chat has never talked to the bot.
pub fn get_user(conn: &DbConnection, chat_id: i64) -> Result<Option<User>> {
    let mut stmt = conn.prepare(
        "SELECT chat_id, username, plan, quality, send_as, mode, custom_height, history_enabled
         FROM users WHERE chat_id = ?",
    )?;
    let mut rows = stmt.query(rusqlite::params![chat_id])?;

    if let Some(row) = rows.next()? {
        Ok(Some(User {
            chat_id: row.get(0)?,
            username: row.get(1)?,
            plan: row.get(2)?,
            quality: row.get(3)?,
            send_as: row.get(4)?,
            mode: row.get(5)?,
            custom_height: row.get(6).unwrap_or(None),
            history_enabled: row.get(7).unwrap_or(0),
        }))
    } else {
        Ok(None)
    }
}

pub fn set_user_plan(conn: &DbConnection, chat_id: i64, plan: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET plan = ?1 WHERE chat_id = ?2",
        rusqlite::params![plan, chat_id],
    )?;
    Ok(())
}

pub fn set_user_quality(conn: &DbConnection, chat_id: i64, quality: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET quality = ?1 WHERE chat_id = ?2",
        rusqlite::params![quality, chat_id],
    )?;
    Ok(())
}

pub fn set_user_send_as(conn: &DbConnection, chat_id: i64, send_as: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET send_as = ?1 WHERE chat_id = ?2",
        rusqlite::params![send_as, chat_id],
    )?;
    Ok(())
}

pub fn set_user_mode(conn: &DbConnection, chat_id: i64, mode: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET mode = ?1 WHERE chat_id = ?2",
        rusqlite::params![mode, chat_id],
    )?;
    Ok(())
}

/// Sets the custom height cap and switches quality to "custom" in one step.
pub fn set_user_custom_height(conn: &DbConnection, chat_id: i64, height: i64) -> Result<()> {
    conn.execute(
        "UPDATE users SET quality = 'custom', custom_height = ?1 WHERE chat_id = ?2",
        rusqlite::params![height, chat_id],
    )?;
    Ok(())
}

pub fn set_user_history_enabled(conn: &DbConnection, chat_id: i64, enabled: bool) -> Result<()> {
    let value = if enabled { 1 } else { 0 };
    conn.execute(
        "UPDATE users SET history_enabled = ?1 WHERE chat_id = ?2",
        rusqlite::params![value, chat_id],
    )?;
    Ok(())
}

/// A completed download, kept only for users who opted in.
#[derive(Debug, Clone)]
pub struct DownloadHistoryEntry {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub kind: String,
    pub downloaded_at: String,
}

pub fn save_download_history(
    conn: &DbConnection,
    chat_id: i64,
    url: &str,
    title: &str,
    kind: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO download_history (chat_id, url, title, kind) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![chat_id, url, title, kind],
    )?;
    Ok(())
}

/// Returns the most recent history entries, newest first.
pub fn get_download_history(
    conn: &DbConnection,
    chat_id: i64,
    limit: Option<i32>,
) -> Result<Vec<DownloadHistoryEntry>> {
    let limit = limit.unwrap_or(20);
    let mut stmt = conn.prepare(
        "SELECT id, url, title, kind, downloaded_at FROM download_history
         WHERE chat_id = ? ORDER BY downloaded_at DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(rusqlite::params![chat_id, limit], |row| {
        Ok(DownloadHistoryEntry {
            id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            kind: row.get(3)?,
            downloaded_at: row.get(4)?,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

pub fn clear_download_history(conn: &DbConnection, chat_id: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM download_history WHERE chat_id = ?1",
        rusqlite::params![chat_id],
    )
}

/// A tracked channel that subscribers get new-video notifications for.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub channel_url: String,
    pub channel_id: String,
    pub title: Option<String>,
    pub last_video_id: Option<String>,
}

/// Inserts the channel if unknown and returns its row ID either way.
pub fn upsert_channel(
    conn: &DbConnection,
    channel_url: &str,
    channel_id: &str,
    title: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO channels (channel_url, channel_id, title) VALUES (?1, ?2, ?3)
         ON CONFLICT(channel_url) DO UPDATE SET channel_id = ?2, title = COALESCE(?3, title)",
        rusqlite::params![channel_url, channel_id, title],
    )?;
    conn.query_row(
        "SELECT id FROM channels WHERE channel_url = ?1",
        rusqlite::params![channel_url],
        |row| row.get(0),
    )
}

pub fn subscribe(conn: &DbConnection, chat_id: i64, channel_row_id: i64) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO subscriptions (chat_id, channel_id) VALUES (?1, ?2)",
        rusqlite::params![chat_id, channel_row_id],
    )?;
    Ok(inserted > 0)
}

pub fn unsubscribe(conn: &DbConnection, chat_id: i64, channel_row_id: i64) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM subscriptions WHERE chat_id = ?1 AND channel_id = ?2",
        rusqlite::params![chat_id, channel_row_id],
    )?;
    Ok(removed > 0)
}

/// Channels a chat is subscribed to.
pub fn user_subscriptions(conn: &DbConnection, chat_id: i64) -> Result<Vec<Channel>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.channel_url, c.channel_id, c.title, c.last_video_id
         FROM channels c JOIN subscriptions s ON s.channel_id = c.id
         WHERE s.chat_id = ? ORDER BY c.id",
    )?;
    let rows = stmt.query_map(rusqlite::params![chat_id], |row| {
        Ok(Channel {
            id: row.get(0)?,
            channel_url: row.get(1)?,
            channel_id: row.get(2)?,
            title: row.get(3)?,
            last_video_id: row.get(4)?,
        })
    })?;

    let mut channels = Vec::new();
    for row in rows {
        channels.push(row?);
    }
    Ok(channels)
}

/// All channels that have at least one subscriber (for the poller).
pub fn channels_with_subscribers(conn: &DbConnection) -> Result<Vec<Channel>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.id, c.channel_url, c.channel_id, c.title, c.last_video_id
         FROM channels c JOIN subscriptions s ON s.channel_id = c.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Channel {
            id: row.get(0)?,
            channel_url: row.get(1)?,
            channel_id: row.get(2)?,
            title: row.get(3)?,
            last_video_id: row.get(4)?,
        })
    })?;

    let mut channels = Vec::new();
    for row in rows {
        channels.push(row?);
    }
    Ok(channels)
}

pub fn channel_subscribers(conn: &DbConnection, channel_row_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT chat_id FROM subscriptions WHERE channel_id = ?")?;
    let rows = stmt.query_map(rusqlite::params![channel_row_id], |row| row.get(0))?;

    let mut chat_ids = Vec::new();
    for row in rows {
        chat_ids.push(row?);
    }
    Ok(chat_ids)
}

pub fn set_channel_last_video(
    conn: &DbConnection,
    channel_row_id: i64,
    video_id: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE channels SET last_video_id = ?1, checked_at = CURRENT_TIMESTAMP WHERE id = ?2",
        rusqlite::params![video_id, channel_row_id],
    )?;
    Ok(())
}

pub fn count_users(conn: &DbConnection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        let pool = create_pool(path.to_str().unwrap()).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_dir, pool) = test_pool();
        let conn = get_connection(&pool).unwrap();
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();
    }

    #[test]
    fn test_ensure_user_defaults() {
        let (_dir, pool) = test_pool();
        let conn = get_connection(&pool).unwrap();

        ensure_user(&conn, 42, Some("alice")).unwrap();
        let user = get_user(&conn, 42).unwrap().unwrap();
        assert_eq!(user.plan, "free");
        assert_eq!(user.quality, "high");
        assert_eq!(user.send_as, "video");
        assert_eq!(user.mode, "local");
        assert_eq!(user.custom_height, None);
        assert!(!user.history_enabled());

        // Second call must not reset anything, but refreshes the username
        set_user_quality(&conn, 42, "medium").unwrap();
        ensure_user(&conn, 42, Some("alice_renamed")).unwrap();
        let user = get_user(&conn, 42).unwrap().unwrap();
        assert_eq!(user.quality, "medium");
        assert_eq!(user.username.as_deref(), Some("alice_renamed"));
    }

    #[test]
    fn test_settings_roundtrip() {
        let (_dir, pool) = test_pool();
        let conn = get_connection(&pool).unwrap();

        ensure_user(&conn, 7, None).unwrap();
        set_user_plan(&conn, 7, "vip").unwrap();
        set_user_send_as(&conn, 7, "document").unwrap();
        set_user_custom_height(&conn, 7, 480).unwrap();
        set_user_history_enabled(&conn, 7, true).unwrap();

        let user = get_user(&conn, 7).unwrap().unwrap();
        assert!(user.is_vip());
        assert_eq!(user.send_as, "document");
        assert_eq!(user.quality, "custom");
        assert_eq!(user.custom_height, Some(480));
        assert!(user.history_enabled());
    }

    #[test]
    fn test_subscriptions() {
        let (_dir, pool) = test_pool();
        let conn = get_connection(&pool).unwrap();

        let ch = upsert_channel(&conn, "https://youtube.com/@rustvideos", "UC123", Some("Rust Videos")).unwrap();
        // Upsert with the same URL returns the same row
        let ch2 = upsert_channel(&conn, "https://youtube.com/@rustvideos", "UC123", None).unwrap();
        assert_eq!(ch, ch2);

        assert!(subscribe(&conn, 1, ch).unwrap());
        assert!(!subscribe(&conn, 1, ch).unwrap()); // duplicate is a no-op
        assert!(subscribe(&conn, 2, ch).unwrap());

        let subs = user_subscriptions(&conn, 1).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].title.as_deref(), Some("Rust Videos"));

        assert_eq!(channel_subscribers(&conn, ch).unwrap(), vec![1, 2]);

        assert!(unsubscribe(&conn, 1, ch).unwrap());
        assert!(!unsubscribe(&conn, 1, ch).unwrap());
        assert!(user_subscriptions(&conn, 1).unwrap().is_empty());
    }

    #[test]
    fn test_download_history() {
        let (_dir, pool) = test_pool();
        let conn = get_connection(&pool).unwrap();

        ensure_user(&conn, 9, None).unwrap();
        save_download_history(&conn, 9, "https://youtu.be/abc", "Some Video", "video").unwrap();
        save_download_history(&conn, 9, "https://youtu.be/def", "Another", "audio").unwrap();

        let entries = get_download_history(&conn, 9, None).unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(clear_download_history(&conn, 9).unwrap(), 2);
        assert!(get_download_history(&conn, 9, None).unwrap().is_empty());
    }
}
