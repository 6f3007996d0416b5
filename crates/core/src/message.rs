use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on message content, in characters.
pub const MAX_CONTENT_CHARS: usize = 5000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("status cannot move backward from {current:?} to {requested:?}")]
    Regression {
        current: MessageStatus,
        requested: MessageStatus,
    },
}

/// Delivery lifecycle of a message. Transitions are monotonic:
/// `Sent -> Delivered -> Read`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }

    /// Guarded transition: advances to `requested` only when it is strictly
    /// later in the lifecycle. Requesting the current status (or an earlier
    /// one that equals the current rank) yields `Ok(None)` so acknowledgement
    /// retries are no-ops; a genuinely backward request is an error the
    /// caller may log and discard.
    pub fn try_advance(self, requested: MessageStatus) -> Result<Option<MessageStatus>, StatusError> {
        match requested.rank().cmp(&self.rank()) {
            std::cmp::Ordering::Greater => Ok(Some(requested)),
            std::cmp::Ordering::Equal => Ok(None),
            std::cmp::Ordering::Less => Err(StatusError::Regression {
                current: self,
                requested,
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(MessageStatus::Sent),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "READ" => Ok(MessageStatus::Read),
            other => Err(format!("unknown message status '{other}'")),
        }
    }
}

/// Broad media category of an attachment, as classified by the upload
/// handler. Recorded verbatim; this crate performs no validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
    Video,
    Audio,
}

/// Opaque descriptor of an uploaded file attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub file_name: String,
    pub kind: AttachmentKind,
    pub size_bytes: u64,
    pub storage_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Entry id in the coordination store's recent-message cache, when the
    /// cache write succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_entry_id: Option<String>,
}
