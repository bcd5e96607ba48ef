use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, MessageKind, Presence};

/// Events sent FROM the server TO connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Handshake accepted; lists the rooms the connection was auto-joined to.
    #[serde(rename = "ready")]
    Ready {
        #[serde(rename = "userId")]
        user_id: Uuid,
        username: String,
        rooms: Vec<Uuid>,
    },

    /// A message was persisted. Delivered to the whole room, sender included.
    #[serde(rename = "message:new")]
    MessageNew(Message),

    #[serde(rename = "message:recalled", rename_all = "camelCase")]
    MessageRecalled {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    #[serde(rename = "typing:status", rename_all = "camelCase")]
    TypingStatus {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    #[serde(rename = "user:status", rename_all = "camelCase")]
    UserStatus { user_id: Uuid, status: Presence },

    /// Pushed to members of a freshly created conversation; the server has
    /// already joined their connections to its room.
    #[serde(rename = "conversation:new")]
    ConversationNew(Conversation),

    /// Scoped failure of a single client event.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Events sent FROM clients TO the server. Anything that does not parse into
/// one of these is rejected before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin(Uuid),

    #[serde(rename = "room:leave")]
    RoomLeave(Uuid),

    #[serde(rename = "message:send")]
    MessageSend(SendMessage),

    #[serde(rename = "message:recall")]
    MessageRecall(RecallNotice),

    #[serde(rename = "typing:start")]
    TypingStart(Uuid),

    #[serde(rename = "typing:stop")]
    TypingStop(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: Uuid,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallNotice {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}
