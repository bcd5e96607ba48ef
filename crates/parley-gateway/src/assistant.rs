use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_core::capabilities;
use parley_core::chat::{ChatService, chat_lines};
use parley_core::provider::{NOT_CONFIGURED_REPLY, ProviderError, REPLY_FALLBACK, ReplyProvider};
use parley_types::Message;
use parley_types::events::ServerEvent;

use crate::dispatcher::Dispatcher;

/// Produces bot replies for conversations with the assistant switched on.
///
/// Runs off the connection path: [`Assistant::spawn`] is fire-and-forget, so
/// a slow provider only delays the bot's own reply.
#[derive(Clone)]
pub struct Assistant {
    chat: ChatService,
    dispatcher: Dispatcher,
    provider: Arc<dyn ReplyProvider>,
    bot_id: Uuid,
    history_limit: u32,
    timeout: Duration,
}

impl Assistant {
    pub fn new(
        chat: ChatService,
        dispatcher: Dispatcher,
        bot_id: Uuid,
        history_limit: u32,
        timeout: Duration,
    ) -> Self {
        let provider = chat.provider().clone();
        Self {
            chat,
            dispatcher,
            provider,
            bot_id,
            history_limit,
            timeout,
        }
    }

    pub fn bot_id(&self) -> Uuid {
        self.bot_id
    }

    pub fn spawn(&self, trigger: Message) {
        let this = self.clone();
        tokio::spawn(async move {
            this.respond(&trigger).await;
        });
    }

    /// Reply to `trigger` if every gate passes. Returns the bot message that
    /// was persisted and broadcast, if any.
    pub async fn respond(&self, trigger: &Message) -> Option<Message> {
        if trigger.sender_id == self.bot_id || !trigger.kind.wakes_assistant() {
            return None;
        }
        if !self.active_in(trigger.conversation_id).await {
            return None;
        }

        let room = trigger.conversation_id;
        self.typing(room, true).await;
        let reply = self.generate(trigger).await;
        self.typing(room, false).await;

        // The toggle may have flipped while the provider was working.
        if !self.active_in(room).await {
            debug!("Assistant switched off in {} during generation, dropping reply", room);
            return None;
        }

        match self.chat.send_as_bot(room, self.bot_id, reply).await {
            Ok(message) => {
                self.dispatcher
                    .send_to_room(room, ServerEvent::MessageNew(message.clone()), None)
                    .await;
                info!("Assistant replied in {}", room);
                Some(message)
            }
            Err(e) => {
                warn!("Assistant reply in {} not stored: {}", room, e);
                None
            }
        }
    }

    async fn active_in(&self, conversation_id: Uuid) -> bool {
        if !self.chat.gate().is_enabled(capabilities::AI_BOT) {
            return false;
        }
        match self.chat.conversation(conversation_id).await {
            Ok(conversation) => conversation.is_bot_active,
            Err(e) => {
                debug!("Assistant skipped {}: {}", conversation_id, e);
                false
            }
        }
    }

    async fn generate(&self, trigger: &Message) -> String {
        let history = match self
            .chat
            .recent_history(trigger.conversation_id, self.history_limit.saturating_add(1))
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Assistant could not read history: {}", e);
                Vec::new()
            }
        };
        let earlier: Vec<Message> = history
            .into_iter()
            .filter(|m| m.id != trigger.id)
            .collect();
        let skip = earlier.len().saturating_sub(self.history_limit as usize);
        let lines = chat_lines(&earlier[skip..]);

        match tokio::time::timeout(self.timeout, self.provider.reply(&lines, &trigger.content)).await {
            Ok(Ok(text)) => text,
            Ok(Err(ProviderError::NotConfigured)) => NOT_CONFIGURED_REPLY.to_string(),
            Ok(Err(e)) => {
                warn!("Provider {} failed: {}", self.provider.name(), e);
                REPLY_FALLBACK.to_string()
            }
            Err(_) => {
                warn!("Provider {} timed out after {:?}", self.provider.name(), self.timeout);
                REPLY_FALLBACK.to_string()
            }
        }
    }

    async fn typing(&self, room: Uuid, is_typing: bool) {
        self.dispatcher
            .send_to_room(
                room,
                ServerEvent::TypingStatus {
                    conversation_id: room,
                    user_id: self.bot_id,
                    is_typing,
                },
                None,
            )
            .await;
    }
}
