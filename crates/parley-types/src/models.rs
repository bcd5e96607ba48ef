use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored string did not name any variant of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Closed string-backed enums share one shape: lowercase wire form, `as_str`
/// for SQL parameters, and `FromStr` for reading rows back.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    /// The synthetic assistant identity. Exactly one exists.
    Bot,
}

string_enum!(Role, "role", { Admin => "admin", User => "user", Bot => "bot" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

string_enum!(ConversationKind, "conversation kind", { Private => "private", Group => "group" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Admin,
}

string_enum!(MemberRole, "member role", { Member => "member", Admin => "admin" });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    /// Server-authored notices (group created, member left).
    System,
    /// Replies injected by the assistant.
    Ai,
}

string_enum!(MessageKind, "message kind", {
    Text => "text",
    Image => "image",
    Audio => "audio",
    System => "system",
    Ai => "ai",
});

impl MessageKind {
    /// Kinds a client is allowed to submit. `System` and `Ai` are server-produced.
    pub const fn is_client_sendable(self) -> bool {
        match self {
            Self::Text | Self::Image | Self::Audio => true,
            Self::System | Self::Ai => false,
        }
    }

    /// Kinds that carry an uploaded attachment and need the multimedia capability.
    pub const fn is_media(self) -> bool {
        match self {
            Self::Image | Self::Audio => true,
            Self::Text | Self::System | Self::Ai => false,
        }
    }

    /// Only plain human text wakes the assistant.
    pub const fn wakes_assistant(self) -> bool {
        match self {
            Self::Text => true,
            Self::Image | Self::Audio | Self::System | Self::Ai => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
    pub is_online: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
            role: self.role,
        }
    }
}

/// Display data attached to messages and conversation listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub title: Option<String>,
    /// Set for groups only.
    pub owner_id: Option<Uuid>,
    pub is_bot_active: bool,
    pub last_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender: Option<UserSummary>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub is_recalled: bool,
    pub metadata: Option<serde_json::Value>,
    /// Users for whom this message is hidden. Only ever grows.
    pub deleted_for: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A conversation as listed in a member's sidebar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub members: Vec<UserSummary>,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    Core,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub key: String,
    pub enabled: bool,
    pub label: String,
    #[serde(rename = "type")]
    pub tier: CapabilityTier,
}
