pub mod api;
pub mod events;
pub mod models;

pub use models::{
    Capability, CapabilityTier, Conversation, ConversationKind, ConversationMember,
    ConversationSummary, MemberRole, Message, MessageKind, Presence, Role, UnknownVariant, User,
    UserSummary,
};
