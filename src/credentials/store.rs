//! SQLite persistence for credentials and their access log.
//!
//! Every call opens its own connection; concurrent writers are serialized by
//! SQLite's locking, with a busy timeout so they wait rather than fail.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::audit::{AccessAction, AccessLogEntry};
use crate::error::{GatehouseError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    encrypted  INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credential_access_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    credential_key TEXT NOT NULL,
    action         TEXT NOT NULL,
    timestamp      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_log_key ON credential_access_log (credential_key);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A stored credential row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    /// Ciphertext when `encrypted`, the plain value otherwise
    pub value: String,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Handle to the credentials database file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl CredentialStore {
    /// Open the database at `path`, creating its directory and schema if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { path };
        store.connect()?.execute_batch(SCHEMA)?;
        debug!(path = %store.path.display(), "Credential store ready");
        Ok(store)
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Insert or overwrite `key` and record a `STORE` entry, atomically.
    pub fn upsert(&self, key: &str, value: &str, encrypted: bool, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let ts = format_timestamp(now);
        tx.execute(
            "INSERT INTO credentials (key, value, encrypted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 encrypted = excluded.encrypted,
                 updated_at = excluded.updated_at",
            params![key, value, encrypted, ts],
        )?;
        append_log(&tx, key, AccessAction::Store, &ts)?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch the row for `key`.
    pub fn fetch(&self, key: &str) -> Result<Option<Credential>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT key, value, encrypted, created_at, updated_at FROM credentials WHERE key = ?1",
            params![key],
            |row| {
                Ok(Credential {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    encrypted: row.get(2)?,
                    created_at: parse_timestamp(&row.get::<_, String>(3)?)?,
                    updated_at: parse_timestamp(&row.get::<_, String>(4)?)?,
                })
            },
        )
        .optional()
        .map_err(GatehouseError::from)
    }

    /// Delete `key` if present and record a `DELETE` entry either way.
    ///
    /// Returns whether a row was removed.
    pub fn remove(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM credentials WHERE key = ?1", params![key])?;
        append_log(&tx, key, AccessAction::Delete, &format_timestamp(now))?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Append an access log entry on its own.
    pub fn log_access(&self, key: &str, action: AccessAction, now: DateTime<Utc>) -> Result<()> {
        let conn = self.connect()?;
        append_log(&conn, key, action, &format_timestamp(now))
    }

    /// Every stored key.
    pub fn keys(&self) -> Result<BTreeSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT key FROM credentials")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(keys)
    }

    /// Whether a row exists for `key`.
    pub fn contains(&self, key: &str) -> Result<bool> {
        let conn = self.connect()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM credentials WHERE key = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Newest access log entries first, optionally for one key.
    pub fn access_log(&self, key: Option<&str>, limit: usize) -> Result<Vec<AccessLogEntry>> {
        let conn = self.connect()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT credential_key, action, timestamp FROM credential_access_log
             WHERE ?1 IS NULL OR credential_key = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![key, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                parse_timestamp(&row.get::<_, String>(2)?)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (credential_key, action, timestamp) = row?;
            entries.push(AccessLogEntry {
                credential_key,
                action: action.parse()?,
                timestamp,
            });
        }
        Ok(entries)
    }

    /// Trim the access log to the newest `keep` entries. Returns rows removed.
    pub fn prune_access_log(&self, keep: usize) -> Result<usize> {
        let conn = self.connect()?;
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let removed = conn.execute(
            "DELETE FROM credential_access_log WHERE id NOT IN (
                 SELECT id FROM credential_access_log ORDER BY timestamp DESC, id DESC LIMIT ?1
             )",
            params![keep],
        )?;
        Ok(removed)
    }
}

fn append_log(conn: &Connection, key: &str, action: AccessAction, ts: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO credential_access_log (credential_key, action, timestamp) VALUES (?1, ?2, ?3)",
        params![key, action.as_str(), ts],
    )?;
    Ok(())
}
