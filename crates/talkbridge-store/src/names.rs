use crate::schema::{lenient_i64, lenient_text, table_columns};
use crate::{MessageStore, StoreError};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use talkbridge_types::models::json_i64;

/// A display name as stored, possibly still encrypted, with the encoding
/// index recorded next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredName {
    pub value: String,
    pub enc: Option<i64>,
}

impl MessageStore {
    /// Room name from `private_meta`, then the open-chat link, then the plain
    /// `name` column.
    pub fn room_name(&self, chat_id: i64) -> Result<Option<StoredName>, StoreError> {
        let has_name_column = self.room_name_column();
        self.with_conn(|conn| {
            if let Some(name) = private_meta_name(conn, chat_id)? {
                return Ok(Some(name));
            }

            if MessageStore::has_secondary(conn)
                && let Some(value) = optional_text(
                    conn,
                    "SELECT name FROM db2.open_link WHERE id = (SELECT link_id FROM chat_rooms WHERE id = ?1)",
                    chat_id,
                )?
            {
                return Ok(Some(StoredName { value, enc: None }));
            }

            if has_name_column
                && let Some(value) =
                    optional_text(conn, "SELECT name FROM chat_rooms WHERE id = ?1", chat_id)?
            {
                return Ok(Some(StoredName { value, enc: None }));
            }

            Ok(None)
        })
    }

    /// Sender nickname from the open-chat member list or the friends list.
    /// When both exist the longer value wins.
    pub fn sender_name(&self, user_id: i64) -> Result<Option<StoredName>, StoreError> {
        self.with_conn(|conn| {
            if !MessageStore::has_secondary(conn) {
                return Ok(None);
            }

            let member = name_with_enc(
                conn,
                "SELECT nickname, enc FROM db2.open_chat_member WHERE user_id = ?1",
                user_id,
            )?;
            let friend = name_with_enc(conn, "SELECT name, enc FROM db2.friends WHERE id = ?1", user_id)?;

            Ok(match (member, friend) {
                (Some(m), Some(f)) if f.value.chars().count() > m.value.chars().count() => Some(f),
                (Some(m), _) => Some(m),
                (None, f) => f,
            })
        })
    }

    fn room_name_column(&self) -> bool {
        if let Some(has) = self.room_name_column.get() {
            return *has;
        }
        match self.with_conn(|conn| Ok(table_columns(conn, "chat_rooms")?)) {
            Ok(columns) => *self
                .room_name_column
                .get_or_init(|| columns.iter().any(|c| c == "name")),
            Err(_) => false,
        }
    }
}

fn private_meta_name(conn: &Connection, chat_id: i64) -> Result<Option<StoredName>, StoreError> {
    let raw = optional_text(conn, "SELECT private_meta FROM chat_rooms WHERE id = ?1", chat_id)?;
    Ok(raw.as_deref().and_then(parse_private_meta))
}

/// `name` (string, or an object carrying `content`/`value`) and `enc` from a
/// room's `private_meta` JSON.
pub fn parse_private_meta(raw: &str) -> Option<StoredName> {
    let Ok(Value::Object(meta)) = serde_json::from_str::<Value>(raw.trim()) else {
        return None;
    };

    let value = match meta.get("name")? {
        Value::String(s) => s.clone(),
        Value::Object(inner) => inner
            .get("content")
            .or_else(|| inner.get("value"))
            .and_then(Value::as_str)?
            .to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    if value.is_empty() {
        return None;
    }

    Some(StoredName {
        value,
        enc: meta.get("enc").and_then(json_i64),
    })
}

/// Missing tables or columns (older schemas) read as "no value".
fn is_schema_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::Unknown
    )
}

fn optional_text(conn: &Connection, sql: &str, id: i64) -> Result<Option<String>, StoreError> {
    match conn.query_row(sql, [id], |row| lenient_text(row, 0)).optional() {
        Ok(value) => Ok(value.flatten().filter(|s| !s.trim().is_empty())),
        Err(e) if is_schema_error(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn name_with_enc(conn: &Connection, sql: &str, id: i64) -> Result<Option<StoredName>, StoreError> {
    let found = conn
        .query_row(sql, [id], |row| Ok((lenient_text(row, 0)?, lenient_i64(row, 1)?)))
        .optional();

    match found {
        Ok(Some((Some(value), enc))) if !value.is_empty() => Ok(Some(StoredName { value, enc })),
        Ok(_) => Ok(None),
        Err(e) if is_schema_error(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
