use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::Database;
use crate::error::DbResult;
use crate::models::timestamp;

impl Database {
    pub fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
                .optional()?)
        })
    }

    /// Every stored key/value pair.
    pub fn all_settings(&self) -> DbResult<HashMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let pairs = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<HashMap<_, _>, _>>()?;
            Ok(pairs)
        })
    }

    pub fn upsert_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, timestamp(now)],
            )?;
            Ok(())
        })
    }

    /// Insert only if absent; existing values win.
    pub fn seed_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, timestamp(now)],
            )?;
            Ok(())
        })
    }
}
