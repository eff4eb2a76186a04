//! Durable key/value store contract and its SQLite implementation

use super::Storage;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, trace};

/// Durable store the coordinator mirrors its state into
///
/// A key holds a map of fields, an ordered list of `(seq, payload)` entries,
/// or both. An expired key behaves exactly like a missing one.
#[cfg_attr(test, mockall::automock)]
pub trait StateStore: Send + Sync {
    /// Upsert fields of a key
    fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// All fields of a key; empty when the key is missing
    fn get_fields(&self, key: &str) -> Result<HashMap<String, String>>;

    fn append_ordered(&self, key: &str, seq: i64, payload: &str) -> Result<()>;

    /// Entries with `from_seq <= seq <= to_seq`, ordered by seq then insertion
    fn range_query(&self, key: &str, from_seq: i64, to_seq: i64) -> Result<Vec<(i64, String)>>;

    /// Expire the key `ttl` from now. Missing keys are ignored.
    fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// [`StateStore`] on the pooled SQLite database. Expiry is enforced lazily
/// whenever a key is touched.
pub struct SqliteStateStore {
    storage: Storage,
}

impl SqliteStateStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Storage::new_with_path(data_dir)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Storage::in_memory()?))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn delete_key(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM store_entries WHERE key = ?1", [key])?;
    conn.execute("DELETE FROM store_fields WHERE key = ?1", [key])?;
    conn.execute("DELETE FROM store_keys WHERE key = ?1", [key])?;
    Ok(())
}

/// Drop the key if its expiry has passed. Returns whether it was dropped.
fn purge_if_expired(conn: &Connection, key: &str) -> Result<bool> {
    let expires_at: Option<Option<i64>> = conn
        .query_row(
            "SELECT expires_at FROM store_keys WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;

    match expires_at {
        Some(Some(at)) if at <= now_millis() => {
            trace!("Key {} expired", key);
            delete_key(conn, key)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn ensure_key(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO store_keys (key, expires_at) VALUES (?1, NULL)",
        [key],
    )?;
    Ok(())
}

impl StateStore for SqliteStateStore {
    fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut conn = self.storage.connection()?;
        let tx = conn.transaction()?;
        purge_if_expired(&tx, key)?;
        ensure_key(&tx, key)?;
        for (field, value) in fields {
            tx.execute(
                "INSERT INTO store_fields (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_fields(&self, key: &str) -> Result<HashMap<String, String>> {
        let conn = self.storage.connection()?;
        if purge_if_expired(&conn, key)? {
            return Ok(HashMap::new());
        }

        let mut stmt = conn.prepare("SELECT field, value FROM store_fields WHERE key = ?1")?;
        let rows = stmt.query_map([key], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut fields = HashMap::new();
        for row in rows {
            let (field, value): (String, String) = row?;
            fields.insert(field, value);
        }
        Ok(fields)
    }

    fn append_ordered(&self, key: &str, seq: i64, payload: &str) -> Result<()> {
        let mut conn = self.storage.connection()?;
        let tx = conn.transaction()?;
        purge_if_expired(&tx, key)?;
        ensure_key(&tx, key)?;
        tx.execute(
            "INSERT INTO store_entries (key, seq, payload) VALUES (?1, ?2, ?3)",
            params![key, seq, payload],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn range_query(&self, key: &str, from_seq: i64, to_seq: i64) -> Result<Vec<(i64, String)>> {
        let conn = self.storage.connection()?;
        if purge_if_expired(&conn, key)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT seq, payload FROM store_entries
             WHERE key = ?1 AND seq BETWEEN ?2 AND ?3
             ORDER BY seq, id",
        )?;
        let rows = stmt.query_map(params![key, from_seq, to_seq], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_millis().saturating_add(ttl_ms);
        let conn = self.storage.connection()?;
        let updated = conn.execute(
            "UPDATE store_keys SET expires_at = ?2 WHERE key = ?1",
            params![key, expires_at],
        )?;
        if updated == 0 {
            debug!("Ignoring expire for missing key {}", key);
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.storage.connection()?;
        if purge_if_expired(&conn, key)? {
            return Ok(false);
        }
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM store_keys WHERE key = ?1",
            [key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.storage.connection()?;
        delete_key(&conn, key)
    }
}
