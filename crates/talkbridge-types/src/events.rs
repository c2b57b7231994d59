use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events sent over the collector channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Envelope {
    /// A new row from the message store
    Message {
        msg_id: i64,
        chat_id: i64,
        /// Decrypted room name, the still-encrypted name, or the chat id
        room: String,
        /// `name/id`, or just the id when no name is known
        sender: String,
        sender_id: Option<i64>,
        /// Decrypted body, or the raw body when undetermined
        body: String,
        created_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        type_code: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachment: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        raw: RawFields,
    },

    /// The reaction counter on an existing message went up
    ReactionCountUpdate {
        chat_id: i64,
        room: String,
        msg_id: i64,
        old_count: i64,
        new_count: i64,
        observed_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        supplement: Option<String>,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ReactionCountUpdate { .. } => "reaction-count-update",
        }
    }

    pub fn msg_id(&self) -> i64 {
        match self {
            Self::Message { msg_id, .. } | Self::ReactionCountUpdate { msg_id, .. } => *msg_id,
        }
    }
}

/// Raw inputs forwarded so the collector can retry what the relay could not
/// decrypt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enc_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub own_account_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<UndeterminedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<UndeterminedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<UndeterminedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<UndeterminedField>,
}

impl RawFields {
    pub fn has_undetermined(&self) -> bool {
        self.body.is_some()
            || self.room_name.is_some()
            || self.sender_name.is_some()
            || self.attachment.is_some()
    }
}

/// A field whose candidate search ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndeterminedField {
    pub ciphertext: String,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub enc: i64,
    pub account_id: i64,
}
