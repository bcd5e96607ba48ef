use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use parley_types::{Message, MessageKind, Role};

use crate::Database;
use crate::conversations::{member_role, query_conversation};
use crate::error::{DbError, DbResult};
use crate::models::{MessageRow, parse_timestamp, timestamp};
use crate::users::user_role;

const MESSAGE_SELECT: &str = "
    SELECT m.id, m.conversation_id, m.sender_id,
           u.display_name, u.avatar_url, u.role,
           m.content, m.kind, m.is_recalled, m.metadata,
           (SELECT group_concat(d.user_id) FROM message_deletions d WHERE d.message_id = m.id),
           m.created_at
    FROM messages m
    LEFT JOIN users u ON u.id = m.sender_id";

pub struct NewMessage<'a> {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: &'a str,
    pub kind: MessageKind,
    pub metadata: Option<&'a serde_json::Value>,
}

impl Database {
    /// Persist a message and advance the conversation's last-message pointer
    /// in one transaction. Human senders must be members; the bot identity
    /// posts without a membership row.
    pub fn send_message(&self, msg: &NewMessage<'_>, now: DateTime<Utc>) -> DbResult<Message> {
        let cid = msg.conversation_id.to_string();
        let sid = msg.sender_id.to_string();
        self.with_tx(|tx| {
            if query_conversation(tx, &cid)?.is_none() {
                return Err(DbError::NotFound("conversation"));
            }
            let role = user_role(tx, &sid)?.ok_or(DbError::NotFound("user"))?;
            if role != Role::Bot && member_role(tx, &cid, &sid)?.is_none() {
                return Err(DbError::Forbidden(
                    "not a member of this conversation".into(),
                ));
            }
            insert_message(tx, &cid, &sid, msg.content, msg.kind, msg.metadata, now)
        })
    }

    pub fn get_message(&self, id: Uuid) -> DbResult<Option<Message>> {
        self.with_conn(|conn| {
            query_message(conn, &id.to_string())?
                .map(MessageRow::into_model)
                .transpose()
        })
    }

    /// Sender-only, within `window` of creation. Recalling twice is a no-op.
    /// The returned message has its content blanked.
    pub fn recall_message(
        &self,
        message_id: Uuid,
        caller_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> DbResult<Message> {
        let mid = message_id.to_string();
        self.with_tx(|tx| {
            let row = query_message(tx, &mid)?.ok_or(DbError::NotFound("message"))?;
            if row.sender_id != caller_id.to_string() {
                return Err(DbError::Forbidden(
                    "only the sender can recall a message".into(),
                ));
            }

            if !row.is_recalled {
                let created_at = parse_timestamp(&row.created_at)?;
                if now - created_at > window {
                    return Err(DbError::Policy(format!(
                        "messages can only be recalled within {} minutes",
                        window.num_minutes()
                    )));
                }
                tx.execute("UPDATE messages SET is_recalled = 1 WHERE id = ?1", [&mid])?;
            }

            let mut message = query_message(tx, &mid)?
                .ok_or(DbError::NotFound("message"))?
                .into_model()?;
            redact_recalled(&mut message);
            Ok(message)
        })
    }

    /// Hide a message from `user_id`'s own view. Allowed for members of the
    /// conversation and for the sender; repeating it changes nothing.
    pub fn delete_message_for(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let mid = message_id.to_string();
        let uid = user_id.to_string();
        self.with_tx(|tx| {
            let row = query_message(tx, &mid)?.ok_or(DbError::NotFound("message"))?;
            if row.sender_id != uid && member_role(tx, &row.conversation_id, &uid)?.is_none() {
                return Err(DbError::Forbidden(
                    "not a member of this conversation".into(),
                ));
            }
            tx.execute(
                "INSERT OR IGNORE INTO message_deletions (message_id, user_id, deleted_at)
                 VALUES (?1, ?2, ?3)",
                params![mid, uid, timestamp(now)],
            )?;
            Ok(())
        })
    }

    /// A page of history as `viewer_id` sees it, oldest first: at most
    /// `limit` messages strictly before the `before` cursor, minus the ones
    /// the viewer deleted, with recalled content blanked.
    pub fn messages_for_viewer(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        limit: u32,
        before: Option<Uuid>,
    ) -> DbResult<Vec<Message>> {
        let cid = conversation_id.to_string();
        let vid = viewer_id.to_string();
        let before = before.map(|id| id.to_string());

        self.with_conn(|conn| {
            if query_conversation(conn, &cid)?.is_none() {
                return Err(DbError::NotFound("conversation"));
            }
            if member_role(conn, &cid, &vid)?.is_none() {
                return Err(DbError::Forbidden(
                    "not a member of this conversation".into(),
                ));
            }
            if let Some(cursor) = before.as_deref() {
                let in_conversation: Option<String> = conn
                    .query_row(
                        "SELECT id FROM messages WHERE id = ?1 AND conversation_id = ?2",
                        [cursor, cid.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if in_conversation.is_none() {
                    return Err(DbError::NotFound("message"));
                }
            }

            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM message_deletions d
                       WHERE d.message_id = m.id AND d.user_id = ?2)
                   AND (?3 IS NULL OR (m.created_at, m.rowid) <
                        (SELECT created_at, rowid FROM messages WHERE id = ?3))
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![cid, vid, before, limit], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut messages = rows
                .into_iter()
                .rev()
                .map(MessageRow::into_model)
                .collect::<DbResult<Vec<_>>>()?;
            messages.iter_mut().for_each(redact_recalled);
            Ok(messages)
        })
    }

    /// The newest `limit` non-recalled messages, oldest first. Used as the
    /// assistant's context window.
    pub fn recent_messages(&self, conversation_id: Uuid, limit: u32) -> DbResult<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1 AND m.is_recalled = 0
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![conversation_id.to_string(), limit], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().rev().map(MessageRow::into_model).collect()
        })
    }
}

/// Insert without permission checks and move the conversation pointer.
/// Callers run this inside a transaction.
pub(crate) fn insert_message(
    conn: &Connection,
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    kind: MessageKind,
    metadata: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> DbResult<Message> {
    let id = Uuid::new_v4().to_string();
    let now_ts = timestamp(now);
    let metadata = metadata.map(|m| m.to_string());

    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, content, kind, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, conversation_id, sender_id, content, kind.as_str(), metadata, now_ts],
    )?;
    let updated = conn.execute(
        "UPDATE conversations SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![conversation_id, id, now_ts],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound("conversation"));
    }

    query_message(conn, &id)?
        .ok_or(DbError::NotFound("message"))?
        .into_model()
}

pub(crate) fn query_message(conn: &Connection, id: &str) -> DbResult<Option<MessageRow>> {
    let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?1");
    Ok(conn.query_row(&sql, [id], message_from_row).optional()?)
}

fn redact_recalled(message: &mut Message) {
    if message.is_recalled {
        message.content.clear();
        message.metadata = None;
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_display_name: row.get(3)?,
        sender_avatar_url: row.get(4)?,
        sender_role: row.get(5)?,
        content: row.get(6)?,
        kind: row.get(7)?,
        is_recalled: row.get(8)?,
        metadata: row.get(9)?,
        deleted_for: row.get(10)?,
        created_at: row.get(11)?,
    })
}
