use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::Database;
pub use parley_db::conversations::LeaveOutcome;
use parley_db::messages::NewMessage;
use parley_types::{Conversation, ConversationSummary, Message, MessageKind, User};

use crate::capabilities::{self, CapabilityGate};
use crate::error::{Error, Result};
use crate::provider::{ChatLine, ReplyProvider, SUGGESTION_FALLBACK};
use crate::store::blocking;

pub const RECALL_WINDOW_MINUTES: i64 = 10;
pub const MAX_CONTENT_CHARS: usize = 4000;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;
const SUGGESTION_CONTEXT: u32 = 10;

/// Async facade over the conversation store with capability and input rules
/// applied. Shared by the REST handlers, the gateway and the assistant.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    gate: CapabilityGate,
    provider: Arc<dyn ReplyProvider>,
}

impl ChatService {
    pub fn new(db: Arc<Database>, gate: CapabilityGate, provider: Arc<dyn ReplyProvider>) -> Self {
        Self { db, gate, provider }
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    pub fn provider(&self) -> &Arc<dyn ReplyProvider> {
        &self.provider
    }

    pub async fn user(&self, user_id: Uuid) -> Result<User> {
        let row = blocking(&self.db, move |db| db.get_user_by_id(user_id)).await?;
        Ok(row.ok_or(Error::NotFound("user"))?.to_model()?)
    }

    pub async fn set_presence(&self, user_id: Uuid, online: bool) -> Result<()> {
        blocking(&self.db, move |db| db.set_user_online(user_id, online)).await
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Conversation> {
        blocking(&self.db, move |db| db.get_conversation(id))
            .await?
            .ok_or(Error::NotFound("conversation"))
    }

    pub async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        blocking(&self.db, move |db| db.list_conversations(user_id)).await
    }

    pub async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        blocking(&self.db, move |db| db.is_member(conversation_id, user_id)).await
    }

    pub async fn member_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        blocking(&self.db, move |db| db.member_ids(conversation_id)).await
    }

    pub async fn conversation_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        blocking(&self.db, move |db| db.conversation_ids_for_user(user_id)).await
    }

    /// Returns the conversation and whether it was just created.
    pub async fn open_private(&self, caller: Uuid, target: Uuid) -> Result<(Conversation, bool)> {
        self.gate.require(capabilities::PRIVATE_CHAT)?;
        blocking(&self.db, move |db| db.find_or_create_private(caller, target, Utc::now())).await
    }

    pub async fn create_group(
        &self,
        creator: Uuid,
        title: String,
        member_ids: Vec<Uuid>,
    ) -> Result<(Conversation, Vec<Uuid>)> {
        self.gate.require(capabilities::GROUP_CHAT)?;
        blocking(&self.db, move |db| {
            db.create_group(&title, creator, &member_ids, Utc::now())
        })
        .await
    }

    pub async fn leave_group(&self, conversation_id: Uuid, user_id: Uuid) -> Result<LeaveOutcome> {
        self.gate.require(capabilities::GROUP_CHAT)?;
        blocking(&self.db, move |db| db.leave_group(conversation_id, user_id, Utc::now())).await
    }

    /// Returns the former member ids.
    pub async fn delete_group(&self, conversation_id: Uuid, caller: Uuid) -> Result<Vec<Uuid>> {
        self.gate.require(capabilities::GROUP_CHAT)?;
        blocking(&self.db, move |db| db.delete_group(conversation_id, caller)).await
    }

    pub async fn toggle_bot(&self, conversation_id: Uuid, caller: Uuid, active: bool) -> Result<Conversation> {
        self.gate.require(capabilities::AI_BOT)?;
        blocking(&self.db, move |db| db.set_bot_active(conversation_id, caller, active)).await
    }

    pub async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        blocking(&self.db, move |db| db.mark_read(conversation_id, user_id, Utc::now())).await
    }

    /// History as `viewer` sees it. `limit` defaults to 50 and is capped at 200.
    pub async fn messages(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        limit: Option<u32>,
        before: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        blocking(&self.db, move |db| {
            db.messages_for_viewer(conversation_id, viewer, limit, before)
        })
        .await
    }

    /// Newest `limit` live messages, oldest first.
    pub async fn recent_history(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        blocking(&self.db, move |db| db.recent_messages(conversation_id, limit)).await
    }

    pub async fn message(&self, message_id: Uuid) -> Result<Message> {
        blocking(&self.db, move |db| db.get_message(message_id))
            .await?
            .ok_or(Error::NotFound("message"))
    }

    /// Human send path: only client kinds, trimmed non-empty content within
    /// the length cap, media behind the multimedia capability.
    pub async fn send(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        kind: MessageKind,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        if !kind.is_client_sendable() {
            return Err(Error::Validation(format!("clients cannot send {kind} messages")));
        }
        if kind.is_media() {
            self.gate.require(capabilities::MULTIMEDIA)?;
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Validation("message content is empty".into()));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(Error::Validation(format!(
                "message content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }

        self.persist(conversation_id, sender_id, content.to_string(), kind, metadata)
            .await
    }

    /// Assistant send path. The bot needs no membership row.
    pub async fn send_as_bot(&self, conversation_id: Uuid, bot_id: Uuid, content: String) -> Result<Message> {
        self.persist(conversation_id, bot_id, content, MessageKind::Ai, None).await
    }

    async fn persist(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
        kind: MessageKind,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        let message = blocking(&self.db, move |db| {
            db.send_message(
                &NewMessage {
                    conversation_id,
                    sender_id,
                    content: &content,
                    kind,
                    metadata: metadata.as_ref(),
                },
                Utc::now(),
            )
        })
        .await?;
        debug!("Message {} stored in {}", message.id, conversation_id);
        Ok(message)
    }

    pub async fn recall(&self, message_id: Uuid, caller: Uuid) -> Result<Message> {
        self.gate.require(capabilities::MESSAGE_RECALL)?;
        blocking(&self.db, move |db| {
            db.recall_message(message_id, caller, Utc::now(), Duration::minutes(RECALL_WINDOW_MINUTES))
        })
        .await
    }

    pub async fn delete_for_me(&self, message_id: Uuid, caller: Uuid) -> Result<()> {
        self.gate.require(capabilities::MESSAGE_DELETE)?;
        blocking(&self.db, move |db| db.delete_message_for(message_id, caller, Utc::now())).await
    }

    /// A reply suggestion for `viewer`, never persisted. Provider failures
    /// yield a fixed fallback text.
    pub async fn suggest_reply(&self, conversation_id: Uuid, viewer: Uuid) -> Result<String> {
        self.gate.require(capabilities::AI_SUGGEST)?;
        let history = self
            .messages(conversation_id, viewer, Some(SUGGESTION_CONTEXT), None)
            .await?;
        let lines = chat_lines(&history);

        match self.provider.suggest(&lines).await {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!("Suggestion via {} failed: {}", self.provider.name(), e);
                Ok(SUGGESTION_FALLBACK.to_string())
            }
        }
    }
}

/// Provider context from stored messages. Recalled and system lines are skipped.
pub fn chat_lines(history: &[Message]) -> Vec<ChatLine> {
    history
        .iter()
        .filter(|m| !m.is_recalled && m.kind != MessageKind::System)
        .map(|m| ChatLine {
            speaker: m
                .sender
                .as_ref()
                .map(|s| s.display_name.clone())
                .unwrap_or_else(|| "User".to_string()),
            content: match m.kind {
                MessageKind::Image => "[image]".to_string(),
                MessageKind::Audio => "[voice message]".to_string(),
                MessageKind::Text | MessageKind::Ai | MessageKind::System => m.content.clone(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;

    use parley_db::models::NewUser;
    use parley_types::Role;

    use super::*;
    use crate::provider::ProviderError;

    struct Canned(std::result::Result<&'static str, ()>);

    impl ReplyProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn reply<'a>(&'a self, _: &'a [ChatLine], _: &'a str) -> BoxFuture<'a, std::result::Result<String, ProviderError>> {
            let out = self.0.map(str::to_string).map_err(|_| ProviderError::Empty);
            async move { out }.boxed()
        }

        fn suggest<'a>(&'a self, _: &'a [ChatLine]) -> BoxFuture<'a, std::result::Result<String, ProviderError>> {
            let out = self.0.map(str::to_string).map_err(|_| ProviderError::Empty);
            async move { out }.boxed()
        }
    }

    fn service(provider: Canned) -> (ChatService, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let gate = CapabilityGate::new(db.clone());
        (ChatService::new(db.clone(), gate, Arc::new(provider)), db)
    }

    fn user(db: &Database, name: &str) -> Uuid {
        db.create_user(
            &NewUser {
                username: name,
                email: &format!("{name}@example.com"),
                password_hash: "hash",
                display_name: name,
                role: Role::User,
            },
            Utc::now(),
        )
        .unwrap()
        .user_id()
        .unwrap()
    }

    #[tokio::test]
    async fn send_enforces_input_rules() {
        let (chat, db) = service(Canned(Ok("ok")));
        let a = user(&db, "alice");
        let b = user(&db, "bob");
        let (conv, _) = chat.open_private(a, b).await.unwrap();

        let sent = chat.send(conv.id, a, "  hello  ", MessageKind::Text, None).await.unwrap();
        assert_eq!(sent.content, "hello");

        assert!(matches!(chat.send(conv.id, a, "   ", MessageKind::Text, None).await, Err(Error::Validation(_))));
        assert!(matches!(chat.send(conv.id, a, "hi", MessageKind::Ai, None).await, Err(Error::Validation(_))));
        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(chat.send(conv.id, a, &long, MessageKind::Text, None).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn media_requires_multimedia_capability() {
        let (chat, db) = service(Canned(Ok("ok")));
        let a = user(&db, "alice");
        let b = user(&db, "bob");
        let (conv, _) = chat.open_private(a, b).await.unwrap();

        chat.send(conv.id, a, "/uploads/cat.png", MessageKind::Image, None).await.unwrap();
        chat.gate().set(capabilities::MULTIMEDIA, false).await.unwrap();
        assert!(matches!(
            chat.send(conv.id, a, "/uploads/dog.png", MessageKind::Image, None).await,
            Err(Error::Policy(_))
        ));
        chat.send(conv.id, a, "text still works", MessageKind::Text, None).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_group_chat_blocks_group_operations() {
        let (chat, db) = service(Canned(Ok("ok")));
        let a = user(&db, "alice");
        chat.gate().set(capabilities::GROUP_CHAT, false).await.unwrap();
        assert!(matches!(chat.create_group(a, "Team".into(), vec![]).await, Err(Error::Policy(_))));
    }

    #[tokio::test]
    async fn history_limit_is_capped() {
        let (chat, db) = service(Canned(Ok("ok")));
        let a = user(&db, "alice");
        let b = user(&db, "bob");
        let (conv, _) = chat.open_private(a, b).await.unwrap();
        for i in 0..3 {
            chat.send(conv.id, a, &format!("m{i}"), MessageKind::Text, None).await.unwrap();
        }
        assert_eq!(chat.messages(conv.id, b, Some(0), None).await.unwrap().len(), 1);
        assert_eq!(chat.messages(conv.id, b, Some(10_000), None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn suggestion_falls_back_on_provider_failure() {
        let (chat, db) = service(Canned(Err(())));
        let a = user(&db, "alice");
        let b = user(&db, "bob");
        let (conv, _) = chat.open_private(a, b).await.unwrap();
        chat.send(conv.id, a, "hello?", MessageKind::Text, None).await.unwrap();

        assert_eq!(chat.suggest_reply(conv.id, b).await.unwrap(), SUGGESTION_FALLBACK);
        let outsider = user(&db, "eve");
        assert!(matches!(chat.suggest_reply(conv.id, outsider).await, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn suggestion_is_not_persisted() {
        let (chat, db) = service(Canned(Ok("Sounds good!")));
        let a = user(&db, "alice");
        let b = user(&db, "bob");
        let (conv, _) = chat.open_private(a, b).await.unwrap();
        chat.send(conv.id, a, "lunch?", MessageKind::Text, None).await.unwrap();

        assert_eq!(chat.suggest_reply(conv.id, b).await.unwrap(), "Sounds good!");
        assert_eq!(chat.messages(conv.id, b, None, None).await.unwrap().len(), 1);
    }
}
