//! Core domain types and the client/server wire protocol.

pub mod conversation;
pub mod event;
pub mod message;

pub use conversation::{snippet, Conversation, ParticipantPair, SNIPPET_CHARS};
pub use event::{
    ClientEvent, ErrorCode, FanoutFrame, NotificationEvent, PresenceStatus, ServerEvent,
    StatusUpdate,
};
pub use message::{
    AttachmentDescriptor, AttachmentKind, Message, MessageStatus, StatusError, MAX_CONTENT_CHARS,
};
