use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::Database;
use crate::error::DbResult;
use crate::models::{RefreshSessionRow, UserRow, timestamp};
use crate::users::query_user_by_id;

/// Provenance recorded on a session row.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

const SESSION_SELECT: &str = "
    SELECT t.id, s.id, t.user_id, s.ip_address, s.user_agent,
           t.expires_at, s.last_activity_at, s.created_at
    FROM refresh_tokens t
    JOIN sessions s ON s.refresh_token_id = t.id";

impl Database {
    /// Store a refresh credential digest and open its linked session.
    pub fn insert_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> DbResult<RefreshSessionRow> {
        self.with_tx(|tx| insert_refresh(tx, &user_id.to_string(), token_hash, expires_at, client, now))
    }

    /// Non-revoked, non-expired credential matching `token_hash`, if any.
    pub fn find_active_refresh(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Option<RefreshSessionRow>> {
        self.with_conn(|conn| query_active(conn, token_hash, &timestamp(now)))
    }

    /// Atomically revoke the presented credential and mint its successor.
    ///
    /// The revoke is a compare-and-set on `revoked_at IS NULL`, so of two
    /// concurrent rotations with the same secret exactly one sees a changed
    /// row; the other gets `None` and nothing is inserted for it.
    pub fn rotate_refresh_token(
        &self,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> DbResult<Option<(UserRow, RefreshSessionRow)>> {
        let now_ts = timestamp(now);
        self.with_tx(|tx| {
            let Some(old) = query_active(tx, old_hash, &now_ts)? else {
                return Ok(None);
            };

            let revoked = tx.execute(
                "UPDATE refresh_tokens SET revoked_at = ?2
                 WHERE token_hash = ?1 AND revoked_at IS NULL AND expires_at > ?2",
                params![old_hash, now_ts],
            )?;
            if revoked != 1 {
                return Ok(None);
            }

            let Some(user) = query_user_by_id(tx, &old.user_id)? else {
                return Ok(None);
            };

            // Carry provenance forward when the refreshing client sends none.
            let client = ClientInfo {
                ip_address: client.ip_address.clone().or(old.ip_address),
                user_agent: client.user_agent.clone().or(old.user_agent),
            };
            let fresh = insert_refresh(tx, &old.user_id, new_hash, expires_at, &client, now)?;
            Ok(Some((user, fresh)))
        })
    }

    /// Mark a credential revoked. Returns whether a live credential was hit;
    /// unknown or already-revoked digests are not an error.
    pub fn revoke_refresh_token(&self, token_hash: &str, now: DateTime<Utc>) -> DbResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE refresh_tokens SET revoked_at = ?2
                 WHERE token_hash = ?1 AND revoked_at IS NULL",
                params![token_hash, timestamp(now)],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn active_sessions_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<RefreshSessionRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{SESSION_SELECT}
                 WHERE t.user_id = ?1 AND t.revoked_at IS NULL AND t.expires_at > ?2
                 ORDER BY s.last_activity_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id.to_string(), timestamp(now)], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn insert_refresh(
    conn: &Connection,
    user_id: &str,
    token_hash: &str,
    expires_at: DateTime<Utc>,
    client: &ClientInfo,
    now: DateTime<Utc>,
) -> DbResult<RefreshSessionRow> {
    let token_id = Uuid::new_v4().to_string();
    let session_id = Uuid::new_v4().to_string();
    let now_ts = timestamp(now);
    let expires_ts = timestamp(expires_at);

    conn.execute(
        "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![token_id, user_id, token_hash, expires_ts, now_ts],
    )?;
    conn.execute(
        "INSERT INTO sessions (id, user_id, refresh_token_id, ip_address, user_agent, last_activity_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![session_id, user_id, token_id, client.ip_address, client.user_agent, now_ts],
    )?;

    Ok(RefreshSessionRow {
        token_id,
        session_id,
        user_id: user_id.to_string(),
        ip_address: client.ip_address.clone(),
        user_agent: client.user_agent.clone(),
        expires_at: expires_ts,
        last_activity_at: now_ts.clone(),
        created_at: now_ts,
    })
}

fn query_active(conn: &Connection, token_hash: &str, now_ts: &str) -> DbResult<Option<RefreshSessionRow>> {
    let sql = format!(
        "{SESSION_SELECT}
         WHERE t.token_hash = ?1 AND t.revoked_at IS NULL AND t.expires_at > ?2"
    );
    Ok(conn
        .query_row(&sql, params![token_hash, now_ts], session_from_row)
        .optional()?)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<RefreshSessionRow> {
    Ok(RefreshSessionRow {
        token_id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        ip_address: row.get(3)?,
        user_agent: row.get(4)?,
        expires_at: row.get(5)?,
        last_activity_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}
