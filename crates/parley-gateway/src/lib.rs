pub mod assistant;
pub mod connection;
pub mod dispatcher;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use parley_core::Result;
use parley_core::chat::{ChatService, LeaveOutcome};
use parley_types::events::ServerEvent;
use parley_types::{Conversation, Message, MessageKind, Presence};

use crate::assistant::Assistant;
use crate::dispatcher::Dispatcher;

/// The send pipeline and room maintenance, shared by REST handlers and
/// socket connections so both paths behave identically.
#[derive(Clone)]
pub struct Gateway {
    chat: ChatService,
    dispatcher: Dispatcher,
    assistant: Assistant,
    /// Users last announced online. The lock serializes presence transitions.
    announced: Arc<Mutex<HashSet<Uuid>>>,
}

impl Gateway {
    pub fn new(chat: ChatService, dispatcher: Dispatcher, assistant: Assistant) -> Self {
        Self {
            chat,
            dispatcher,
            assistant,
            announced: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn assistant(&self) -> &Assistant {
        &self.assistant
    }

    /// Persist, deliver to the whole room (sender included), then wake the
    /// assistant without waiting for it.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        content: &str,
        kind: MessageKind,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        let message = self
            .chat
            .send(conversation_id, sender_id, content, kind, metadata)
            .await?;
        self.dispatcher
            .send_to_room(conversation_id, ServerEvent::MessageNew(message.clone()), None)
            .await;
        if kind.wakes_assistant() {
            self.assistant.spawn(message.clone());
        }
        Ok(message)
    }

    /// Bring the stored and announced presence of `user_id` in line with the
    /// live connection table. Run after every register and unregister; the
    /// last call to take the lock always sees the latest table.
    pub async fn sync_presence(&self, user_id: Uuid) {
        let mut announced = self.announced.lock().await;
        let online = self.dispatcher.is_online(user_id).await;
        if announced.contains(&user_id) == online {
            return;
        }

        if let Err(e) = self.chat.set_presence(user_id, online).await {
            warn!("Could not persist presence for {}: {}", user_id, e);
        }
        let status = if online {
            announced.insert(user_id);
            Presence::Online
        } else {
            announced.remove(&user_id);
            Presence::Offline
        };
        self.dispatcher.broadcast(ServerEvent::UserStatus { user_id, status });
    }

    /// Join every member's live connections to the new room and tell them.
    pub async fn announce_conversation(&self, conversation: &Conversation, members: &[Uuid]) {
        for member in members {
            self.dispatcher.join_user(*member, conversation.id).await;
            self.dispatcher
                .send_to_user(*member, ServerEvent::ConversationNew(conversation.clone()))
                .await;
        }
    }

    pub async fn announce_recall(&self, message: &Message) {
        self.dispatcher
            .send_to_room(
                message.conversation_id,
                ServerEvent::MessageRecalled {
                    conversation_id: message.conversation_id,
                    message_id: message.id,
                },
                None,
            )
            .await;
    }

    /// Room bookkeeping after `user_id` left a group.
    pub async fn member_left(&self, conversation_id: Uuid, user_id: Uuid, outcome: &LeaveOutcome) {
        self.dispatcher.evict_user(user_id, conversation_id).await;
        match outcome {
            LeaveOutcome::Left { notice, .. } => {
                self.dispatcher
                    .send_to_room(conversation_id, ServerEvent::MessageNew(notice.clone()), None)
                    .await;
            }
            LeaveOutcome::Dissolved => self.dispatcher.drop_room(conversation_id).await,
        }
    }

    pub async fn group_deleted(&self, conversation_id: Uuid) {
        self.dispatcher.drop_room(conversation_id).await;
    }
}
