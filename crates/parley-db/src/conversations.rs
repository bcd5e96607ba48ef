use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::{
    Conversation, ConversationKind, ConversationMember, ConversationSummary, MemberRole, Message,
    MessageKind, UserSummary,
};

use crate::Database;
use crate::error::{DbError, DbResult};
use crate::messages::{insert_message, query_message};
use crate::models::{ConversationRow, MemberRow, parse_uuid, timestamp};
use crate::users::user_role;

const CONVERSATION_COLUMNS: &str =
    "c.id, c.kind, c.title, c.owner_id, c.is_bot_active, c.last_message_id, c.created_at, c.updated_at";

/// Upper bound on find-or-create retries after losing a pair-key race.
const PRIVATE_CREATE_ATTEMPTS: usize = 3;

const MAX_TITLE_LEN: usize = 100;

/// Result of a member leaving a group.
#[derive(Debug, Clone)]
pub enum LeaveOutcome {
    /// Others remain. `notice` is the departure system message.
    Left {
        notice: Message,
        new_owner: Option<Uuid>,
    },
    /// The last member left; the conversation and its history are gone.
    Dissolved,
}

/// Unordered user pair as a single unique key.
fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

impl Database {
    /// Return the private conversation between `a` and `b`, creating it (and
    /// both memberships) in one transaction if it does not exist.
    ///
    /// Concurrent creators are resolved by the UNIQUE `pair_key`: the loser's
    /// transaction rolls back and its retry finds the winner's row. The bool is
    /// true when this call created the conversation.
    pub fn find_or_create_private(
        &self,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> DbResult<(Conversation, bool)> {
        if a == b {
            return Err(DbError::Invalid(
                "a private conversation needs two distinct users".into(),
            ));
        }
        let key = pair_key(a, b);

        let mut attempt = 1;
        loop {
            match self.with_tx(|tx| find_or_create_private_tx(tx, a, b, &key, now)) {
                Err(e) if e.is_unique_violation() && attempt < PRIVATE_CREATE_ATTEMPTS => {
                    debug!("Lost private conversation race for {}, retrying", key);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Create a group with `creator_id` as owner/admin, everyone else as
    /// member, plus the creation notice. Duplicate ids are collapsed.
    /// Returns the conversation and every member id, creator first.
    pub fn create_group(
        &self,
        title: &str,
        creator_id: Uuid,
        member_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> DbResult<(Conversation, Vec<Uuid>)> {
        let title = title.trim();
        if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
            return Err(DbError::Invalid(format!(
                "group title must be 1-{MAX_TITLE_LEN} characters"
            )));
        }

        let mut members = vec![creator_id];
        for id in member_ids {
            if !members.contains(id) {
                members.push(*id);
            }
        }

        self.with_tx(|tx| {
            for id in &members {
                if user_role(tx, &id.to_string())?.is_none() {
                    return Err(DbError::NotFound("user"));
                }
            }

            let conversation_id = Uuid::new_v4().to_string();
            let now_ts = timestamp(now);
            tx.execute(
                "INSERT INTO conversations (id, kind, title, owner_id, created_at, updated_at)
                 VALUES (?1, 'group', ?2, ?3, ?4, ?4)",
                params![conversation_id, title, creator_id.to_string(), now_ts],
            )?;

            for id in &members {
                let role = if *id == creator_id {
                    MemberRole::Admin
                } else {
                    MemberRole::Member
                };
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![conversation_id, id.to_string(), role.as_str(), now_ts],
                )?;
            }

            insert_message(
                tx,
                &conversation_id,
                &creator_id.to_string(),
                &format!("created group \"{title}\""),
                MessageKind::System,
                None,
                now,
            )?;

            let conversation = query_conversation(tx, &conversation_id)?
                .ok_or(DbError::NotFound("conversation"))?
                .into_model()?;
            Ok((conversation, members))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> DbResult<Option<Conversation>> {
        self.with_conn(|conn| {
            query_conversation(conn, &id.to_string())?
                .map(ConversationRow::into_model)
                .transpose()
        })
    }

    pub fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> DbResult<bool> {
        self.with_conn(|conn| {
            Ok(member_role(conn, &conversation_id.to_string(), &user_id.to_string())?.is_some())
        })
    }

    pub fn member_ids(&self, conversation_id: Uuid) -> DbResult<Vec<Uuid>> {
        self.with_conn(|conn| {
            query_member_ids(conn, &conversation_id.to_string())?
                .iter()
                .map(|id| parse_uuid(id))
                .collect()
        })
    }

    /// Members in join order (earliest first).
    pub fn members(&self, conversation_id: Uuid) -> DbResult<Vec<ConversationMember>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, role, joined_at, last_read_at
                 FROM conversation_members
                 WHERE conversation_id = ?1
                 ORDER BY joined_at ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map([conversation_id.to_string()], member_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(MemberRow::into_model).collect()
        })
    }

    /// Every conversation id `user_id` belongs to; the gateway's auto-join set.
    pub fn conversation_ids_for_user(&self, user_id: Uuid) -> DbResult<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM conversation_members WHERE user_id = ?1",
            )?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.iter().map(|id| parse_uuid(id)).collect()
        })
    }

    /// Sidebar listing: newest activity first, with members and last message.
    pub fn list_conversations(&self, user_id: Uuid) -> DbResult<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversations c
                 JOIN conversation_members m ON m.conversation_id = c.id
                 WHERE m.user_id = ?1
                 ORDER BY c.updated_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], conversation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut member_stmt = conn.prepare(
                "SELECT u.id, u.display_name, u.avatar_url, u.role
                 FROM conversation_members m
                 JOIN users u ON u.id = m.user_id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.joined_at ASC, m.rowid ASC",
            )?;

            let mut summaries = Vec::with_capacity(rows.len());
            for row in rows {
                let members = member_stmt
                    .query_map([&row.id], |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, Option<String>>(2)?,
                            r.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .map(|(id, display_name, avatar_url, role)| {
                        Ok(UserSummary {
                            id: parse_uuid(&id)?,
                            display_name,
                            avatar_url,
                            role: role
                                .parse()
                                .map_err(|e: parley_types::UnknownVariant| DbError::Corrupt(e.to_string()))?,
                        })
                    })
                    .collect::<DbResult<Vec<_>>>()?;

                let last_message = match row.last_message_id.as_deref() {
                    Some(id) => query_message(conn, id)?.map(|m| m.into_model()).transpose()?,
                    None => None,
                };

                summaries.push(ConversationSummary {
                    conversation: row.into_model()?,
                    members,
                    last_message,
                });
            }
            Ok(summaries)
        })
    }

    /// Remove `user_id` from a group in one transaction. An owner hands the
    /// group to the remaining member who joined earliest (promoted to admin);
    /// the last member out deletes the conversation outright.
    pub fn leave_group(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> DbResult<LeaveOutcome> {
        let cid = conversation_id.to_string();
        let uid = user_id.to_string();

        self.with_tx(|tx| {
            let conversation = query_conversation(tx, &cid)?
                .ok_or(DbError::NotFound("conversation"))?
                .into_model()?;
            if conversation.kind != ConversationKind::Group {
                return Err(DbError::Policy(
                    "private conversations cannot be left".into(),
                ));
            }

            let removed = tx.execute(
                "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
                params![cid, uid],
            )?;
            if removed == 0 {
                return Err(DbError::NotFound("membership"));
            }

            let remaining = query_member_ids(tx, &cid)?;
            let Some(earliest) = remaining.first() else {
                tx.execute("DELETE FROM conversations WHERE id = ?1", [&cid])?;
                info!("Group {} dissolved after its last member left", cid);
                return Ok(LeaveOutcome::Dissolved);
            };

            let new_owner = if conversation.owner_id == Some(user_id) {
                tx.execute(
                    "UPDATE conversations SET owner_id = ?2 WHERE id = ?1",
                    params![cid, earliest],
                )?;
                tx.execute(
                    "UPDATE conversation_members SET role = 'admin'
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![cid, earliest],
                )?;
                info!("Group {} ownership passed to {}", cid, earliest);
                Some(parse_uuid(earliest)?)
            } else {
                None
            };

            let notice = insert_message(tx, &cid, &uid, "left the group", MessageKind::System, None, now)?;
            Ok(LeaveOutcome::Left { notice, new_owner })
        })
    }

    /// Owner-only. Cascades to memberships and messages. Returns the ids of
    /// everyone who was a member.
    pub fn delete_group(&self, conversation_id: Uuid, caller_id: Uuid) -> DbResult<Vec<Uuid>> {
        let cid = conversation_id.to_string();
        self.with_tx(|tx| {
            let conversation = query_conversation(tx, &cid)?
                .ok_or(DbError::NotFound("conversation"))?
                .into_model()?;
            if conversation.kind != ConversationKind::Group {
                return Err(DbError::Policy(
                    "private conversations cannot be deleted".into(),
                ));
            }
            if conversation.owner_id != Some(caller_id) {
                return Err(DbError::Forbidden(
                    "only the group owner can delete the group".into(),
                ));
            }

            let members = query_member_ids(tx, &cid)?
                .iter()
                .map(|id| parse_uuid(id))
                .collect::<DbResult<Vec<_>>>()?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", [&cid])?;
            info!("Group {} deleted by owner {}", cid, caller_id);
            Ok(members)
        })
    }

    /// Flip `is_bot_active`. The caller must be a member.
    pub fn set_bot_active(
        &self,
        conversation_id: Uuid,
        caller_id: Uuid,
        active: bool,
    ) -> DbResult<Conversation> {
        let cid = conversation_id.to_string();
        self.with_tx(|tx| {
            if query_conversation(tx, &cid)?.is_none() {
                return Err(DbError::NotFound("conversation"));
            }
            if member_role(tx, &cid, &caller_id.to_string())?.is_none() {
                return Err(DbError::Forbidden(
                    "not a member of this conversation".into(),
                ));
            }
            tx.execute(
                "UPDATE conversations SET is_bot_active = ?2 WHERE id = ?1",
                params![cid, active],
            )?;
            query_conversation(tx, &cid)?
                .ok_or(DbError::NotFound("conversation"))?
                .into_model()
        })
    }

    pub fn mark_read(&self, conversation_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> DbResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversation_members SET last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string(), timestamp(now)],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound("membership"));
            }
            Ok(())
        })
    }
}

fn find_or_create_private_tx(
    conn: &Connection,
    a: Uuid,
    b: Uuid,
    key: &str,
    now: DateTime<Utc>,
) -> DbResult<(Conversation, bool)> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.pair_key = ?1");
    if let Some(existing) = conn.query_row(&sql, [key], conversation_from_row).optional()? {
        return Ok((existing.into_model()?, false));
    }

    for id in [a, b] {
        if user_role(conn, &id.to_string())?.is_none() {
            return Err(DbError::NotFound("user"));
        }
    }

    let id = Uuid::new_v4().to_string();
    let now_ts = timestamp(now);
    conn.execute(
        "INSERT INTO conversations (id, kind, pair_key, created_at, updated_at)
         VALUES (?1, 'private', ?2, ?3, ?3)",
        params![id, key, now_ts],
    )?;
    for user in [a, b] {
        conn.execute(
            "INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
             VALUES (?1, ?2, 'member', ?3)",
            params![id, user.to_string(), now_ts],
        )?;
    }

    let conversation = query_conversation(conn, &id)?
        .ok_or(DbError::NotFound("conversation"))?
        .into_model()?;
    Ok((conversation, true))
}

pub(crate) fn query_conversation(conn: &Connection, id: &str) -> DbResult<Option<ConversationRow>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1");
    Ok(conn.query_row(&sql, [id], conversation_from_row).optional()?)
}

pub(crate) fn member_role(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> DbResult<Option<MemberRole>> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    role.map(|r| {
        r.parse()
            .map_err(|e: parley_types::UnknownVariant| DbError::Corrupt(e.to_string()))
    })
    .transpose()
}

/// Member ids ordered by join time, earliest first.
fn query_member_ids(conn: &Connection, conversation_id: &str) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_members
         WHERE conversation_id = ?1
         ORDER BY joined_at ASC, rowid ASC",
    )?;
    let ids = stmt
        .query_map([conversation_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        title: row.get(2)?,
        owner_id: row.get(3)?,
        is_bot_active: row.get(4)?,
        last_message_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        joined_at: row.get(3)?,
        last_read_at: row.get(4)?,
    })
}
