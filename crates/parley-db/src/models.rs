//! Database row types. These map directly to SQLite rows and are kept apart
//! from the parley-types models so the store owns its own representation.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_types::api::SessionInfo;
use parley_types::{Conversation, ConversationMember, Message, Role, User, UserSummary};

use crate::error::{DbError, DbResult};

/// Fixed-width RFC 3339 with milliseconds, so text order matches time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> DbResult<Uuid> {
    raw.parse()
        .map_err(|e| DbError::Corrupt(format!("uuid {raw:?}: {e}")))
}

fn parse_enum<T>(raw: &str) -> DbResult<T>
where
    T: std::str::FromStr<Err = parley_types::UnknownVariant>,
{
    raw.parse().map_err(|e: parley_types::UnknownVariant| DbError::Corrupt(e.to_string()))
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: String,
    pub is_online: bool,
    pub created_at: String,
}

impl UserRow {
    pub fn user_id(&self) -> DbResult<Uuid> {
        parse_uuid(&self.id)
    }

    pub fn role(&self) -> DbResult<Role> {
        parse_enum(&self.role)
    }

    pub fn to_model(&self) -> DbResult<User> {
        Ok(User {
            id: self.user_id()?,
            username: self.username.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
            role: self.role()?,
            is_online: self.is_online,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub display_name: &'a str,
    pub role: Role,
}

/// A live refresh credential joined with its session.
pub struct RefreshSessionRow {
    pub token_id: String,
    pub session_id: String,
    pub user_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: String,
    pub last_activity_at: String,
    pub created_at: String,
}

impl RefreshSessionRow {
    pub fn user_id(&self) -> DbResult<Uuid> {
        parse_uuid(&self.user_id)
    }

    pub fn to_info(&self) -> DbResult<SessionInfo> {
        Ok(SessionInfo {
            id: parse_uuid(&self.session_id)?,
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            created_at: parse_timestamp(&self.created_at)?,
            last_activity_at: parse_timestamp(&self.last_activity_at)?,
            expires_at: parse_timestamp(&self.expires_at)?,
        })
    }
}

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub title: Option<String>,
    pub owner_id: Option<String>,
    pub is_bot_active: bool,
    pub last_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub fn into_model(self) -> DbResult<Conversation> {
        Ok(Conversation {
            id: parse_uuid(&self.id)?,
            kind: parse_enum(&self.kind)?,
            title: self.title,
            owner_id: self.owner_id.as_deref().map(parse_uuid).transpose()?,
            is_bot_active: self.is_bot_active,
            last_message_id: self.last_message_id.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

pub struct MemberRow {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub joined_at: String,
    pub last_read_at: Option<String>,
}

impl MemberRow {
    pub fn into_model(self) -> DbResult<ConversationMember> {
        Ok(ConversationMember {
            conversation_id: parse_uuid(&self.conversation_id)?,
            user_id: parse_uuid(&self.user_id)?,
            role: parse_enum(&self.role)?,
            joined_at: parse_timestamp(&self.joined_at)?,
            last_read_at: self.last_read_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_display_name: Option<String>,
    pub sender_avatar_url: Option<String>,
    pub sender_role: Option<String>,
    pub content: String,
    pub kind: String,
    pub is_recalled: bool,
    pub metadata: Option<String>,
    /// Comma-joined user ids from message_deletions.
    pub deleted_for: Option<String>,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_model(self) -> DbResult<Message> {
        let sender_id = parse_uuid(&self.sender_id)?;
        let sender = match (self.sender_display_name, self.sender_role) {
            (Some(display_name), Some(role)) => Some(UserSummary {
                id: sender_id,
                display_name,
                avatar_url: self.sender_avatar_url,
                role: parse_enum(&role)?,
            }),
            _ => None,
        };

        let metadata: Option<serde_json::Value> = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DbError::Corrupt(format!("metadata on message {}: {e}", self.id)))?;

        let mut deleted_for = match self.deleted_for.as_deref() {
            Some(joined) if !joined.is_empty() => joined
                .split(',')
                .map(parse_uuid)
                .collect::<DbResult<Vec<_>>>()?,
            _ => Vec::new(),
        };
        deleted_for.sort();

        Ok(Message {
            id: parse_uuid(&self.id)?,
            conversation_id: parse_uuid(&self.conversation_id)?,
            sender_id,
            sender,
            content: self.content,
            kind: parse_enum(&self.kind)?,
            is_recalled: self.is_recalled,
            metadata,
            deleted_for,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}
