//! Database migrations

use crate::error::{Error, Result, StorageError};
use rusqlite::Connection;
use tracing::{debug, info};

/// Run all pending migrations in order
pub fn run_migrations(conn: &Connection) -> Result<()> {
    debug!("Running database migrations");

    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;

    let migrations: [(&str, &str); 2] = [
        ("001_keys_and_fields", MIGRATION_001_KEYS_AND_FIELDS),
        ("002_ordered_entries", MIGRATION_002_ORDERED_ENTRIES),
    ];

    for (name, sql) in migrations {
        if migration_applied(conn, name)? {
            continue;
        }
        debug!("Applying migration: {}", name);
        conn.execute_batch(sql).map_err(|e| {
            Error::Storage(StorageError::MigrationFailed(format!("{}: {}", name, e)))
        })?;
        mark_migration_applied(conn, name)?;
        info!("Applied migration: {}", name);
    }

    Ok(())
}

fn migration_applied(conn: &Connection, name: &str) -> Result<bool> {
    let count: i32 = conn.query_row(
        "SELECT COUNT(*) FROM migrations WHERE name = ?",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn mark_migration_applied(conn: &Connection, name: &str) -> Result<()> {
    conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    Ok(())
}

const MIGRATION_001_KEYS_AND_FIELDS: &str = r#"
-- One row per logical key; expires_at is unix millis
CREATE TABLE IF NOT EXISTS store_keys (
    key TEXT PRIMARY KEY,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS store_fields (
    key TEXT NOT NULL REFERENCES store_keys(key) ON DELETE CASCADE,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, field)
);
"#;

const MIGRATION_002_ORDERED_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS store_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL REFERENCES store_keys(key) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_store_entries_key_seq ON store_entries(key, seq, id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i32 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 2);
    }
}
