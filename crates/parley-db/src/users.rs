use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use parley_types::Role;

use crate::Database;
use crate::error::{DbError, DbResult};
use crate::models::{NewUser, UserRow, timestamp};

const USER_COLUMNS: &str =
    "id, username, email, password, display_name, avatar_url, role, is_online, created_at";

/// Login handle of the synthetic assistant.
pub const BOT_USERNAME: &str = "assistant";
const BOT_EMAIL: &str = "assistant@system.local";
const BOT_DISPLAY_NAME: &str = "AI Assistant";
/// Not a PHC string, so no password ever verifies against it.
const BOT_PASSWORD_PLACEHOLDER: &str = "!";

impl Database {
    pub fn create_user(&self, user: &NewUser<'_>, now: DateTime<Utc>) -> DbResult<UserRow> {
        let id = Uuid::new_v4().to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, password, display_name, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    user.username,
                    user.email,
                    user.password_hash,
                    user.display_name,
                    user.role.as_str(),
                    timestamp(now),
                ],
            )
            .map_err(DbError::from)
            .map_err(|e| {
                if e.is_unique_violation() {
                    DbError::Conflict("username or email already taken".into())
                } else {
                    e
                }
            })?;

            query_user_by_id(conn, &id)?.ok_or(DbError::NotFound("user"))
        })
    }

    /// Look a user up by username OR email.
    /// Username matches exactly; email matches case-insensitively, since
    /// emails are stored lowercased.
    pub fn get_user_by_identity(&self, identity: &str) -> DbResult<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users WHERE username = ?1 OR email = ?2 LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![identity, identity.to_lowercase()], user_from_row)
                .optional()?)
        })
    }

    pub fn get_user_by_id(&self, id: Uuid) -> DbResult<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, &id.to_string()))
    }

    pub fn set_user_online(&self, id: Uuid, online: bool) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_online = ?2 WHERE id = ?1",
                params![id.to_string(), online],
            )?;
            Ok(())
        })
    }

    /// Give an existing human account the `admin` role. `false` when no such
    /// user exists. The bot identity is never promoted.
    pub fn promote_to_admin(&self, username: &str) -> DbResult<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET role = 'admin' WHERE username = ?1 AND role != 'bot'",
                [username],
            )?;
            Ok(changed > 0)
        })
    }

    /// Create the assistant identity if it does not exist yet and return it.
    /// Safe to call from several processes: the partial unique index on
    /// `role = 'bot'` makes the insert a no-op for every caller but the first.
    pub fn ensure_bot_user(&self, now: DateTime<Utc>) -> DbResult<UserRow> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO users (id, username, email, password, display_name, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'bot', ?6)
                 ON CONFLICT DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    BOT_USERNAME,
                    BOT_EMAIL,
                    BOT_PASSWORD_PLACEHOLDER,
                    BOT_DISPLAY_NAME,
                    timestamp(now),
                ],
            )?;

            let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE role = ?1");
            Ok(tx.query_row(&sql, [Role::Bot.as_str()], user_from_row)?)
        })
    }
}

pub(crate) fn query_user_by_id(conn: &Connection, id: &str) -> DbResult<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], user_from_row).optional()?)
}

pub(crate) fn user_role(conn: &Connection, id: &str) -> DbResult<Option<Role>> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    role.map(|r| {
        r.parse()
            .map_err(|e: parley_types::UnknownVariant| DbError::Corrupt(e.to_string()))
    })
    .transpose()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        display_name: row.get(4)?,
        avatar_url: row.get(5)?,
        role: row.get(6)?,
        is_online: row.get(7)?,
        created_at: row.get(8)?,
    })
}
