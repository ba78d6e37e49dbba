//! Local store: durable practice words and user settings.

pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::api::types::{Difficulty, Word};

/// Outcome of a bulk word write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutReport {
  pub stored: usize,
  pub skipped: usize,
}

/// SQLite-backed word and settings store
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the database at `path`, migrating it to the current schema.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run raw SQL against the store, for fault injection in tests.
  #[cfg(test)]
  pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
    self
      .conn()?
      .execute_batch(sql)
      .map_err(|e| eyre!("Failed to execute batch: {}", e))
  }

  /// Bring the on-disk schema up to `SCHEMA_VERSION` without touching existing rows.
  fn run_migrations(&self) -> Result<()> {
    let mut conn = self.conn()?;

    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    if version > schema::SCHEMA_VERSION {
      return Err(eyre!(
        "Database schema version {} is newer than supported version {}",
        version,
        schema::SCHEMA_VERSION
      ));
    }

    for (target, sql) in schema::MIGRATIONS.iter().filter(|(v, _)| *v > version) {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin migration: {}", e))?;
      tx.execute_batch(sql)
        .map_err(|e| eyre!("Failed to run migration {}: {}", target, e))?;
      tx.pragma_update(None, "user_version", target)
        .map_err(|e| eyre!("Failed to record schema version {}: {}", target, e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit migration {}: {}", target, e))?;
      debug!(version = target, "migrated offline database");
    }

    Ok(())
  }

  /// Upsert words by id. A record that fails to write is skipped without
  /// blocking the rest; the batch is committed as a whole.
  pub fn put_words(&self, words: &[Word]) -> Result<PutReport> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut report = PutReport::default();
    {
      let mut stmt = tx
        .prepare_cached(
          "INSERT OR REPLACE INTO words
             (id, word, definition, example, difficulty, category, is_custom, user_id, created_at, stored_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        )
        .map_err(|e| eyre!("Failed to prepare word insert: {}", e))?;

      for word in words {
        let result = stmt.execute(params![
          word.id,
          word.word,
          word.definition,
          word.example,
          word.difficulty,
          word.category,
          word.is_custom,
          word.user_id,
          word.created_at,
        ]);
        match result {
          Ok(_) => report.stored += 1,
          Err(e) => {
            warn!(id = word.id, error = %e, "skipping word that failed to store");
            report.skipped += 1;
          }
        }
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit words: {}", e))?;

    Ok(report)
  }

  /// Every stored word, in no particular order.
  pub fn get_all_words(&self) -> Result<Vec<Word>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, word, definition, example, difficulty, category, is_custom, user_id, created_at
         FROM words",
      )
      .map_err(|e| eyre!("Failed to prepare word query: {}", e))?;

    let words = stmt
      .query_map([], |row| {
        Ok(Word {
          id: row.get(0)?,
          word: row.get(1)?,
          definition: row.get(2)?,
          example: row.get(3)?,
          difficulty: row.get(4)?,
          category: row.get(5)?,
          is_custom: row.get(6)?,
          user_id: row.get(7)?,
          created_at: row.get(8)?,
        })
      })
      .map_err(|e| eyre!("Failed to query words: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read word: {}", e))?;

    Ok(words)
  }

  /// Number of stored words.
  pub fn word_count(&self) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM words", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count words: {}", e))?;
    Ok(count as usize)
  }

  /// Delete every stored word. Settings are left alone.
  pub fn clear_words(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM words", [])
      .map_err(|e| eyre!("Failed to clear words: {}", e))?;
    Ok(())
  }

  /// Store a setting, replacing any previous value.
  pub fn put_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
    let json =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize setting {}: {}", key, e))?;

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, json],
      )
      .map_err(|e| eyre!("Failed to store setting {}: {}", key, e))?;
    Ok(())
  }

  /// Read a setting. An absent key is `Ok(None)`.
  pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let conn = self.conn()?;
    let json: Option<String> = conn
      .query_row(
        "SELECT value FROM settings WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read setting {}: {}", key, e))?;

    json
      .map(|s| serde_json::from_str(&s))
      .transpose()
      .map_err(|e| eyre!("Failed to parse setting {}: {}", key, e))
  }
}

impl ToSql for Difficulty {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(ToSqlOutput::from(self.as_str()))
  }
}

impl FromSql for Difficulty {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    value
      .as_str()?
      .parse()
      .map_err(|e: String| FromSqlError::Other(e.into()))
  }
}

/// Process-wide handle to the local store.
///
/// The first caller of `open` performs the open; concurrent callers wait on
/// the same initialisation and all receive the same `Arc`. A failed open
/// leaves the handle empty so a later call can retry.
pub struct SharedStore {
  path: PathBuf,
  cell: OnceCell<Arc<LocalStore>>,
}

impl SharedStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      cell: OnceCell::new(),
    }
  }

  /// Default database file inside the data directory.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("offline.db")
  }

  pub async fn open(&self) -> Result<Arc<LocalStore>> {
    self
      .cell
      .get_or_try_init(|| async {
        let path = self.path.clone();
        let store = tokio::task::spawn_blocking(move || LocalStore::open(&path))
          .await
          .map_err(|e| eyre!("Database open task failed: {}", e))??;
        debug!(path = %self.path.display(), "opened offline database");
        Ok::<_, color_eyre::Report>(Arc::new(store))
      })
      .await
      .cloned()
  }
}
