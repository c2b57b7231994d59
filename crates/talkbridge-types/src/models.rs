use serde_json::Value;

/// One row of the message store, as read by the poll loop.
///
/// Optional fields are `None` either because the value is NULL or because the
/// store's schema version does not carry that column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRow {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub body: Option<String>,
    pub created_at: i64,
    /// `v` column: JSON carrying `enc`, `isMine`, `origin`, reaction counters.
    pub metadata: Option<String>,
    /// Store-level encoding column (`encType`), when present.
    pub enc_type: Option<i64>,
    pub type_code: Option<i64>,
    pub attachment: Option<String>,
    pub reply_ref: Option<i64>,
    pub supplement: Option<String>,
}

impl MessageRow {
    pub fn meta(&self) -> MessageMeta {
        self.metadata
            .as_deref()
            .map(MessageMeta::parse)
            .unwrap_or_default()
    }

    /// Sender id usable as a key-derivation input.
    pub fn valid_sender_id(&self) -> Option<i64> {
        self.sender_id.filter(|id| *id > 0)
    }
}

/// Fields extracted from a row's `v` metadata blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub enc: Option<i64>,
    pub is_mine: bool,
    pub origin: Option<String>,
    pub reaction_count: i64,
}

impl MessageMeta {
    /// Lenient parse: malformed JSON yields the default (no enc, zero reactions).
    pub fn parse(raw: &str) -> Self {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
            return Self::default();
        };

        Self {
            enc: map.get("enc").and_then(json_i64),
            is_mine: map.get("isMine").and_then(Value::as_bool).unwrap_or(false),
            origin: map.get("origin").and_then(Value::as_str).map(str::to_string),
            reaction_count: map
                .get("defaultEmoticonsCount")
                .and_then(json_i64)
                .unwrap_or(0),
        }
    }
}

/// Numeric JSON value, accepting integers and digit strings.
pub fn json_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A row observed by the reaction scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionSample {
    pub msg_id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub count: i64,
    pub created_at: i64,
    pub supplement: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_reads_known_keys() {
        let meta = MessageMeta::parse(
            r#"{"enc":31,"isMine":true,"origin":"MSG","defaultEmoticonsCount":4}"#,
        );
        assert_eq!(meta.enc, Some(31));
        assert!(meta.is_mine);
        assert_eq!(meta.origin.as_deref(), Some("MSG"));
        assert_eq!(meta.reaction_count, 4);
    }

    #[test]
    fn meta_tolerates_garbage() {
        assert_eq!(MessageMeta::parse("not json"), MessageMeta::default());
        assert_eq!(MessageMeta::parse("[1,2]"), MessageMeta::default());
        assert_eq!(MessageMeta::parse(r#"{"enc":null}"#).enc, None);
        assert_eq!(MessageMeta::parse(r#"{"enc":"30"}"#).enc, Some(30));
    }

    #[test]
    fn sender_id_must_be_positive() {
        let mut row = MessageRow { sender_id: Some(0), ..Default::default() };
        assert_eq!(row.valid_sender_id(), None);
        row.sender_id = Some(42);
        assert_eq!(row.valid_sender_id(), Some(42));
    }
}
