use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{AttachmentDescriptor, Message, MessageStatus};

/// Events a client may send over its messaging connection. Frames are JSON
/// objects tagged by `event` with the payload under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "message:send")]
    MessageSend {
        receiver_id: Uuid,
        content: String,
        #[serde(default)]
        attachments: Vec<AttachmentDescriptor>,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered { message_id: Uuid },
    #[serde(rename = "message:read")]
    MessageRead {
        message_ids: Vec<Uuid>,
        conversation_id: Uuid,
    },
    #[serde(rename = "typing:start")]
    TypingStart {
        conversation_id: Uuid,
        receiver_id: Uuid,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        conversation_id: Uuid,
        receiver_id: Uuid,
    },
    #[serde(rename = "conversation:join")]
    ConversationJoin { conversation_id: Uuid },
    #[serde(rename = "conversation:leave")]
    ConversationLeave { conversation_id: Uuid },
}

/// Status acknowledgement payload shared by the socket protocol and the
/// cross-instance fan-out channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub message_ids: Vec<Uuid>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_by: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Events the server pushes to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:receive")]
    MessageReceive(Message),
    #[serde(rename = "message:status")]
    MessageStatus(StatusUpdate),
    #[serde(rename = "typing:indicator")]
    TypingIndicator {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },
    #[serde(rename = "user:status")]
    UserStatus {
        user_id: Uuid,
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "offline:messages")]
    OfflineMessages(Vec<Message>),
    #[serde(rename = "error:message")]
    ErrorMessage { code: ErrorCode, message: String },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::ErrorMessage {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Forbidden,
    RateLimited,
    NotFound,
    InvalidPayload,
    InternalError,
}

/// Frames published on the shared fan-out channel so that every gateway
/// instance can deliver to the sockets it holds locally. `recipient` (or
/// `recipients`) names the user(s) an instance should deliver to if
/// connected there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FanoutFrame {
    NewMessage {
        message: Message,
    },
    StatusChanged {
        recipient: Uuid,
        update: StatusUpdate,
    },
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        recipient: Uuid,
        is_typing: bool,
    },
    PresenceChanged {
        user_id: Uuid,
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
        recipients: Vec<Uuid>,
    },
}

/// Typed record emitted toward the platform's notification pipeline. This
/// core only produces these; a consumer elsewhere decides the delivery
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    MessageSent {
        message_id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        preview: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_parse_by_tag() {
        let receiver = Uuid::new_v4();
        let frame = json!({
            "event": "message:send",
            "data": { "receiver_id": receiver, "content": "hello" }
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        match event {
            ClientEvent::MessageSend {
                receiver_id,
                content,
                attachments,
            } => {
                assert_eq!(receiver_id, receiver);
                assert_eq!(content, "hello");
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn server_events_carry_their_tag() {
        let event = ServerEvent::error(ErrorCode::RateLimited, "slow down");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "error:message");
        assert_eq!(value["data"]["code"], "RATE_LIMITED");
    }

    #[test]
    fn typing_indicator_round_trips() {
        let event = ServerEvent::TypingIndicator {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            is_typing: true,
        };
        let text = serde_json::to_string(&event).unwrap();
        let parsed: ServerEvent = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            parsed,
            ServerEvent::TypingIndicator { is_typing: true, .. }
        ));
    }

    #[test]
    fn unknown_event_tag_is_rejected() {
        let frame = json!({ "event": "message:recall", "data": {} });
        assert!(serde_json::from_value::<ClientEvent>(frame).is_err());
    }
}
