//! Response store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{CachedEntry, HttpResponse, RequestKey};

/// Trait for response cache backends.
pub trait ResponseStore: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open_named(&self, name: &str) -> Result<()>;

  /// Delete a named cache and every entry in it. Returns whether it existed.
  fn delete_named(&self, name: &str) -> Result<bool>;

  /// Names of all caches, oldest first.
  fn list_names(&self) -> Result<Vec<String>>;

  /// Exact match on method + URL across every cache, oldest cache first.
  fn match_request(&self, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Exact match on method + URL within one cache.
  fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Store a full copy of `response` in the named cache, replacing any previous entry.
  fn put(&self, name: &str, key: &RequestKey, response: &HttpResponse) -> Result<()>;

  /// Number of entries in a cache.
  fn entry_count(&self, name: &str) -> Result<usize>;

  /// Generation tag that last activated, if any.
  fn active_generation(&self) -> Result<Option<String>>;

  /// Record the generation tag that is now active.
  fn set_active_generation(&self, name: &str) -> Result<()>;

  /// Delete every cache except `keep`. Returns the names deleted.
  fn retain_only(&self, keep: &str) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.list_names()? {
      if name != keep && self.delete_named(&name)? {
        deleted.push(name);
      }
    }
    Ok(deleted)
  }
}

/// SQLite-based response store.
pub struct SqliteResponseStore {
  conn: Mutex<Connection>,
}

impl SqliteResponseStore {
  /// Open (or create) the response store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory store.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  /// Default store file inside the data directory.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("responses.db")
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named caches (one per generation), creation order by id
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_hash ON cache_entries(request_hash);

-- Lifecycle bookkeeping
CREATE TABLE IF NOT EXISTS cache_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ACTIVE_GENERATION_KEY: &str = "active_generation";

type EntryRow = (u16, String, Vec<u8>, String, String);

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

fn into_entry((status, headers, body, stored_at, cache_name): EntryRow) -> Result<CachedEntry> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

  Ok(CachedEntry {
    response: HttpResponse::new(status, headers, body),
    cache_name,
    stored_at: parse_datetime(&stored_at)?,
  })
}

impl ResponseStore for SqliteResponseStore {
  fn open_named(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;
    Ok(())
  }

  fn delete_named(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let entries = tx
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;
    let existed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?
      > 0;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache deletion: {}", e))?;

    debug!(cache = name, entries, "deleted cache");
    Ok(existed)
  }

  fn list_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn match_request(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        "SELECT e.status, e.headers, e.body, e.stored_at, e.cache_name
         FROM cache_entries e
         INNER JOIN caches c ON c.name = e.cache_name
         WHERE e.request_hash = ?
         ORDER BY c.id
         LIMIT 1",
        params![key.cache_hash()],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(into_entry).transpose()
  }

  fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        "SELECT status, headers, body, stored_at, cache_name
         FROM cache_entries
         WHERE cache_name = ? AND request_hash = ?",
        params![name, key.cache_hash()],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, name, e))?;

    row.map(into_entry).transpose()
  }

  fn put(&self, name: &str, key: &RequestKey, response: &HttpResponse) -> Result<()> {
    if !key.is_get() {
      return Err(eyre!("Only GET responses can be cached, got {}", key));
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("INSERT OR IGNORE INTO caches (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_hash, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.cache_hash(),
        key.method(),
        key.url(),
        response.status,
        headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache entry: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;
    Ok(count as usize)
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT value FROM cache_meta WHERE key = ?",
        params![ACTIVE_GENERATION_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active generation: {}", e))
  }

  fn set_active_generation(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?, ?)",
        params![ACTIVE_GENERATION_KEY, name],
      )
      .map_err(|e| eyre!("Failed to record active generation: {}", e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
