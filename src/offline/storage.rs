//! Offline storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::types::{from_ms, now_ms, DeadLetter, NewAction, QueuedAction, StoredEntry};

/// Trait for durable offline storage backends.
///
/// One backend holds both the key-value cache and the action queue.
pub trait OfflineStorage: Send + Sync {
  /// Write or overwrite the entry for `key`.
  fn put_entry(&self, key: &str, value: &Value, expires_at: Option<i64>) -> Result<()>;

  /// Read an entry as stored, expired or not.
  fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>>;

  fn delete_entry(&self, key: &str) -> Result<()>;

  /// Delete expired entries, then evict the oldest expiring entries until at
  /// most `max_entries` of them remain. Entries without an expiry are kept.
  ///
  /// Returns the number of entries removed.
  fn sweep_entries(&self, now_ms: i64, max_entries: usize) -> Result<usize>;

  fn entry_count(&self) -> Result<usize>;

  /// Append an action to the tail of the queue.
  fn append_action(&self, action: &NewAction) -> Result<QueuedAction>;

  /// All queued actions in FIFO order.
  fn pending_actions(&self) -> Result<Vec<QueuedAction>>;

  fn pending_count(&self) -> Result<usize>;

  /// Remove an action. Removing an unknown sequence number is not an error.
  fn remove_action(&self, seq: i64) -> Result<bool>;

  /// Record a failed replay. Returns the updated attempt count.
  fn record_failure(&self, seq: i64, error: &str) -> Result<u32>;

  /// Replace the bearer token an action will be replayed with.
  fn update_action_token(&self, seq: i64, token: Option<&str>) -> Result<()>;

  /// Move an action from the queue to the dead-letter table.
  fn dead_letter(&self, seq: i64) -> Result<()>;

  fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

/// SQLite-based offline storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open storage at an explicit path, creating parent directories.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open offline database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("prepdash").join("offline.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(OFFLINE_SCHEMA)
      .map_err(|e| eyre!("Failed to run offline migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for the cache and queue tables.
const OFFLINE_SCHEMA: &str = r#"
-- Key-value cache with optional absolute expiry (epoch ms)
CREATE TABLE IF NOT EXISTS offline_data (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER,
    stored_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_data_expires ON offline_data(expires_at);

-- Pending mutations; seq gives FIFO order
CREATE TABLE IF NOT EXISTS offline_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    type_tag TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    payload TEXT,
    auth_token TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    queued_at INTEGER NOT NULL
);

-- Actions that exhausted their replay attempts
CREATE TABLE IF NOT EXISTS dead_letters (
    seq INTEGER PRIMARY KEY,
    type_tag TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    payload TEXT,
    auth_token TEXT,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    queued_at INTEGER NOT NULL,
    dead_at INTEGER NOT NULL
);
"#;

const ACTION_COLUMNS: &str =
  "seq, type_tag, url, method, payload, auth_token, attempts, last_error, queued_at";

/// Action columns as read from SQLite, before JSON and enum decoding.
struct ActionRow {
  seq: i64,
  type_tag: String,
  url: String,
  method: String,
  payload: Option<String>,
  auth_token: Option<String>,
  attempts: u32,
  last_error: Option<String>,
  queued_at: i64,
}

impl ActionRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq: row.get(0)?,
      type_tag: row.get(1)?,
      url: row.get(2)?,
      method: row.get(3)?,
      payload: row.get(4)?,
      auth_token: row.get(5)?,
      attempts: row.get(6)?,
      last_error: row.get(7)?,
      queued_at: row.get(8)?,
    })
  }

  fn decode(self) -> Result<QueuedAction> {
    let payload = self
      .payload
      .map(|p| serde_json::from_str(&p))
      .transpose()
      .map_err(|e| eyre!("Failed to deserialize payload of action {}: {}", self.seq, e))?;

    Ok(QueuedAction {
      seq: self.seq,
      type_tag: self.type_tag,
      url: self.url,
      method: self.method.parse()?,
      payload,
      auth_token: self.auth_token,
      attempts: self.attempts,
      last_error: self.last_error,
      queued_at: from_ms(self.queued_at)?,
    })
  }
}

impl OfflineStorage for SqliteStorage {
  fn put_entry(&self, key: &str, value: &Value, expires_at: Option<i64>) -> Result<()> {
    let data =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO offline_data (key, value, expires_at, stored_at)
         VALUES (?, ?, ?, ?)",
        params![key, data, expires_at, now_ms()],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

    Ok(())
  }

  fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
    let conn = self.lock()?;

    let row: Option<(String, Option<i64>, i64)> = conn
      .query_row(
        "SELECT value, expires_at, stored_at FROM offline_data WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((data, expires_at, stored_at)) => {
        let value = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize entry {}: {}", key, e))?;
        Ok(Some(StoredEntry {
          key: key.to_string(),
          value,
          expires_at,
          stored_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete_entry(&self, key: &str) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM offline_data WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;
    Ok(())
  }

  fn sweep_entries(&self, now_ms: i64, max_entries: usize) -> Result<usize> {
    let conn = self.lock()?;

    let expired = conn
      .execute(
        "DELETE FROM offline_data WHERE expires_at IS NOT NULL AND expires_at < ?",
        params![now_ms],
      )
      .map_err(|e| eyre!("Failed to sweep expired entries: {}", e))?;

    // Entries stored without an expiry (the session token) are never evicted
    let count: usize = conn
      .query_row(
        "SELECT COUNT(*) FROM offline_data WHERE expires_at IS NOT NULL",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    let mut evicted = 0;
    if count > max_entries {
      evicted = conn
        .execute(
          "DELETE FROM offline_data WHERE key IN (
             SELECT key FROM offline_data WHERE expires_at IS NOT NULL
             ORDER BY stored_at ASC, rowid ASC LIMIT ?
           )",
          params![count - max_entries],
        )
        .map_err(|e| eyre!("Failed to evict entries: {}", e))?;
    }

    Ok(expired + evicted)
  }

  fn entry_count(&self) -> Result<usize> {
    self
      .lock()?
      .query_row("SELECT COUNT(*) FROM offline_data", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count entries: {}", e))
  }

  fn append_action(&self, action: &NewAction) -> Result<QueuedAction> {
    let payload = action
      .payload
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
    let queued_at = now_ms();

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO offline_actions (type_tag, url, method, payload, auth_token, queued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          action.type_tag,
          action.url,
          action.method.as_str(),
          payload,
          action.auth_token,
          queued_at
        ],
      )
      .map_err(|e| eyre!("Failed to queue action {}: {}", action.type_tag, e))?;

    Ok(QueuedAction {
      seq: conn.last_insert_rowid(),
      type_tag: action.type_tag.clone(),
      url: action.url.clone(),
      method: action.method,
      payload: action.payload.clone(),
      auth_token: action.auth_token.clone(),
      attempts: 0,
      last_error: None,
      queued_at: from_ms(queued_at)?,
    })
  }

  fn pending_actions(&self) -> Result<Vec<QueuedAction>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM offline_actions ORDER BY seq",
        ACTION_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map([], ActionRow::from_row)
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued action: {}", e))?;

    rows.into_iter().map(ActionRow::decode).collect()
  }

  fn pending_count(&self) -> Result<usize> {
    self
      .lock()?
      .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queued actions: {}", e))
  }

  fn remove_action(&self, seq: i64) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM offline_actions WHERE seq = ?", params![seq])
      .map_err(|e| eyre!("Failed to remove action {}: {}", seq, e))?;
    Ok(removed > 0)
  }

  fn record_failure(&self, seq: i64, error: &str) -> Result<u32> {
    let conn = self.lock()?;

    conn
      .execute(
        "UPDATE offline_actions SET attempts = attempts + 1, last_error = ? WHERE seq = ?",
        params![error, seq],
      )
      .map_err(|e| eyre!("Failed to record failure for action {}: {}", seq, e))?;

    let attempts: Option<u32> = conn
      .query_row(
        "SELECT attempts FROM offline_actions WHERE seq = ?",
        params![seq],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read attempts for action {}: {}", seq, e))?;

    attempts.ok_or_else(|| eyre!("Action {} is no longer queued", seq))
  }

  fn update_action_token(&self, seq: i64, token: Option<&str>) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE offline_actions SET auth_token = ? WHERE seq = ?",
        params![token, seq],
      )
      .map_err(|e| eyre!("Failed to update token for action {}: {}", seq, e))?;
    Ok(())
  }

  fn dead_letter(&self, seq: i64) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      &format!(
        "INSERT OR REPLACE INTO dead_letters ({cols}, dead_at)
         SELECT {cols}, ? FROM offline_actions WHERE seq = ?",
        cols = ACTION_COLUMNS
      ),
      params![now_ms(), seq],
    )
    .map_err(|e| eyre!("Failed to dead-letter action {}: {}", seq, e))?;

    tx.execute("DELETE FROM offline_actions WHERE seq = ?", params![seq])
      .map_err(|e| eyre!("Failed to remove dead-lettered action {}: {}", seq, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {}, dead_at FROM dead_letters ORDER BY seq",
        ACTION_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare dead-letter query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((ActionRow::from_row(row)?, row.get::<_, i64>(9)?)))
      .map_err(|e| eyre!("Failed to query dead letters: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read dead letter: {}", e))?;

    rows
      .into_iter()
      .map(|(row, dead_at)| {
        Ok(DeadLetter {
          action: row.decode()?,
          dead_at: from_ms(dead_at)?,
        })
      })
      .collect()
  }
}
