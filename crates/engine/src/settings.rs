use anyhow::{bail, Context};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use turtledash_protocol::DEFAULT_API_BASE_URL;

const KEY_API_BASE_URL: &str = "api_base_url";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

/// Persistent dashboard settings, one row per key.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    db_path: PathBuf,
}

impl SettingsStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(conn)
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("read setting {key}"))?;
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
            (key, value, now_ms()),
        )
        .with_context(|| format!("write setting {key}"))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.open()?;
        let n = conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(n > 0)
    }

    /// The configured turtle API base URL, or the default when none is stored.
    pub fn api_base_url(&self) -> anyhow::Result<String> {
        Ok(self
            .get(KEY_API_BASE_URL)?
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()))
    }

    /// Stores `input` after normalizing it to end with `/api`; returns the stored value.
    pub fn set_api_base_url(&self, input: &str) -> anyhow::Result<String> {
        let url = normalize_api_base_url(input)?;
        self.put(KEY_API_BASE_URL, &url)?;
        Ok(url)
    }

    pub fn reset_api_base_url(&self) -> anyhow::Result<String> {
        self.delete(KEY_API_BASE_URL)?;
        Ok(DEFAULT_API_BASE_URL.to_string())
    }
}

pub fn normalize_api_base_url(input: &str) -> anyhow::Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("api base url must not be empty");
    }
    if trimmed.ends_with("/api") {
        Ok(trimmed.to_string())
    } else if trimmed.ends_with('/') {
        Ok(format!("{trimmed}api"))
    } else {
        Ok(format!("{trimmed}/api"))
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at_ms INTEGER NOT NULL
);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}
