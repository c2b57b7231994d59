use std::sync::Arc;

use serde_json::Value;
use talkbridge_crypto::{Candidate, CandidateDecryptor, DecryptOutcome, FieldKind};
use talkbridge_store::{MessageStore, StoredName};
use talkbridge_types::events::{AttemptRecord, Envelope, RawFields, UndeterminedField};
use talkbridge_types::models::{MessageMeta, MessageRow, json_i64};
use tracing::{debug, warn};

use crate::reactions::ReactionDelta;

/// Reply (26), reactions (70-79) and images (2, 12, 27).
pub fn attachment_whitelisted(type_code: i64) -> bool {
    matches!(type_code, 26 | 70..=79 | 2 | 12 | 27)
}

fn is_image(type_code: i64) -> bool {
    matches!(type_code, 2 | 12 | 27)
}

const GIFT_TYPE: i64 = 71;
const GIFT_MARKER: &str = "선물";
const IMAGE_KEYS: [&str; 8] = ["url", "path", "path_1", "thumbnailUrl", "xl", "l", "m", "s"];

/// A field after the candidate search.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Not encrypted, passed through as is.
    Plain(String),
    Decrypted { text: String, via: AttemptRecord },
    Undetermined(UndeterminedField),
}

impl FieldValue {
    /// Decrypted text, or the original ciphertext when undetermined.
    pub fn display(&self) -> &str {
        match self {
            Self::Plain(s) | Self::Decrypted { text: s, .. } => s,
            Self::Undetermined(u) => &u.ciphertext,
        }
    }

    fn into_parts(self) -> (String, Option<UndeterminedField>) {
        match self {
            Self::Plain(s) | Self::Decrypted { text: s, .. } => (s, None),
            Self::Undetermined(u) => (u.ciphertext.clone(), Some(u)),
        }
    }
}

/// Turns store rows into outbound envelopes, decrypting every field it can.
#[derive(Clone)]
pub struct EventAssembler {
    store: Arc<MessageStore>,
    decryptor: Arc<CandidateDecryptor>,
}

impl EventAssembler {
    pub fn new(store: Arc<MessageStore>, decryptor: Arc<CandidateDecryptor>) -> Self {
        Self { store, decryptor }
    }

    pub fn decryptor(&self) -> &CandidateDecryptor {
        &self.decryptor
    }

    /// Run the candidate search for one field value.
    pub fn field(
        &self,
        kind: FieldKind,
        value: &str,
        hints: &[Option<i64>],
        sender_id: Option<i64>,
    ) -> FieldValue {
        match self.decryptor.decrypt(kind, value, hints, sender_id) {
            DecryptOutcome::Decrypted {
                plaintext,
                candidate,
                attempts,
            } => {
                debug!(
                    "{:?} decrypted with enc={} account={} after {} attempt(s), {} chars",
                    kind,
                    candidate.enc,
                    candidate.account_id,
                    attempts,
                    plaintext.chars().count()
                );
                FieldValue::Decrypted {
                    text: plaintext,
                    via: record(&candidate),
                }
            }
            DecryptOutcome::NotEncrypted => FieldValue::Plain(value.to_string()),
            DecryptOutcome::Undetermined {
                attempts,
                last_failure,
            } => {
                warn!(
                    "{:?} undetermined after {} attempt(s), last failure: {}",
                    kind,
                    attempts.len(),
                    last_failure.map_or_else(|| "none".to_string(), |f| f.to_string())
                );
                FieldValue::Undetermined(UndeterminedField {
                    ciphertext: value.to_string(),
                    attempts: attempts.iter().map(record).collect(),
                })
            }
        }
    }

    /// Room display name, decrypted when possible. `None` when the store
    /// knows no name for the room.
    pub fn room_name(&self, chat_id: i64, sender_id: Option<i64>) -> Option<FieldValue> {
        let stored = match self.store.room_name(chat_id) {
            Ok(name) => name?,
            Err(e) => {
                warn!("Room name lookup for {} failed: {}", chat_id, e);
                return None;
            }
        };
        Some(self.stored_name(FieldKind::RoomName, stored, sender_id))
    }

    pub fn sender_name(&self, sender_id: i64) -> Option<FieldValue> {
        let stored = match self.store.sender_name(sender_id) {
            Ok(name) => name?,
            Err(e) => {
                warn!("Sender name lookup for {} failed: {}", sender_id, e);
                return None;
            }
        };
        Some(self.stored_name(FieldKind::SenderName, stored, Some(sender_id)))
    }

    fn stored_name(&self, kind: FieldKind, stored: StoredName, sender_id: Option<i64>) -> FieldValue {
        let hint = stored.enc.filter(|enc| *enc > 0);
        self.field(kind, &stored.value, &[hint], sender_id)
    }

    /// Build the `message` envelope for a row.
    pub fn message(&self, row: &MessageRow) -> Envelope {
        let meta = row.meta();
        let sender_id = row.valid_sender_id();
        let hints = [meta.enc, row.enc_type];
        let mut raw = RawFields::default();

        let body = match row.body.as_deref().filter(|b| !b.is_empty()) {
            Some(body) => {
                let (text, undetermined) = self.field(FieldKind::Body, body, &hints, sender_id).into_parts();
                raw.body = undetermined;
                text
            }
            None => String::new(),
        };

        let room = match self.room_name(row.chat_id, sender_id) {
            Some(value) => {
                let (text, undetermined) = value.into_parts();
                raw.room_name = undetermined;
                text
            }
            None => row.chat_id.to_string(),
        };

        let sender = match sender_id {
            Some(id) => match self.sender_name(id) {
                Some(value) => {
                    let (text, undetermined) = value.into_parts();
                    raw.sender_name = undetermined;
                    format!("{}/{}", text, id)
                }
                None => id.to_string(),
            },
            None => row.sender_id.map_or_else(|| "unknown".to_string(), |id| id.to_string()),
        };

        let attachment = self.attachment(row, &hints, sender_id, &mut raw);
        let reply_to = row.reply_ref.or_else(|| reply_from_attachment(attachment.as_ref()));
        let image_url = row
            .type_code
            .filter(|t| is_image(*t))
            .and_then(|_| image_url(attachment.as_ref()));

        if raw.has_undetermined() {
            raw.metadata = row.metadata.clone();
            raw.enc_type = row.enc_type;
            raw.own_account_id = self.decryptor.own_account_id();
        }

        Envelope::Message {
            msg_id: row.id,
            chat_id: row.chat_id,
            room,
            sender,
            sender_id: row.sender_id,
            body,
            created_at: row.created_at,
            type_code: row.type_code,
            reply_to,
            origin: meta_origin(&meta),
            attachment,
            image_url,
            raw,
        }
    }

    /// Build the `reaction-count-update` envelope for a delta.
    pub fn reaction(&self, delta: &ReactionDelta) -> Envelope {
        let room = self
            .room_name(delta.chat_id, delta.sender_id)
            .map_or_else(|| delta.chat_id.to_string(), |v| v.display().to_string());

        Envelope::ReactionCountUpdate {
            chat_id: delta.chat_id,
            room,
            msg_id: delta.msg_id,
            old_count: delta.old_count,
            new_count: delta.new_count,
            observed_at: chrono::Utc::now(),
            sender_id: delta.sender_id,
            supplement: delta.supplement.clone(),
        }
    }

    fn attachment(
        &self,
        row: &MessageRow,
        hints: &[Option<i64>],
        sender_id: Option<i64>,
        raw: &mut RawFields,
    ) -> Option<Value> {
        let value = row.attachment.as_deref().map(str::trim).filter(|a| !a.is_empty())?;

        if let Some(parsed) = parse_json(value) {
            return Some(parsed);
        }

        let type_code = row.type_code?;
        if !attachment_whitelisted(type_code) {
            return None;
        }
        if type_code == GIFT_TYPE && value.contains(GIFT_MARKER) {
            debug!("Skipping gift attachment on {}", row.id);
            return None;
        }

        match self.field(FieldKind::Attachment, value, hints, sender_id) {
            FieldValue::Plain(text) => Some(parse_json(&text).unwrap_or(Value::String(text))),
            FieldValue::Decrypted { text, via } => match parse_json(&text) {
                Some(parsed) => Some(parsed),
                // decrypted to something that is not JSON: treat as a miss
                None => {
                    debug!("Attachment on {} decrypted to non-JSON, forwarding raw", row.id);
                    raw.attachment = Some(UndeterminedField {
                        ciphertext: value.to_string(),
                        attempts: vec![via],
                    });
                    None
                }
            },
            FieldValue::Undetermined(u) => {
                raw.attachment = Some(u);
                None
            }
        }
    }
}

fn record(candidate: &Candidate) -> AttemptRecord {
    AttemptRecord {
        enc: candidate.enc,
        account_id: candidate.account_id,
    }
}

fn meta_origin(meta: &MessageMeta) -> Option<String> {
    meta.origin.clone()
}

fn parse_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn reply_from_attachment(attachment: Option<&Value>) -> Option<i64> {
    let obj = attachment?.as_object()?;
    obj.get("src_message")
        .and_then(json_i64)
        .or_else(|| obj.get("logId").and_then(json_i64))
}

fn image_url(attachment: Option<&Value>) -> Option<String> {
    let obj = attachment?.as_object()?;
    IMAGE_KEYS
        .iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
