use crate::schema::{ColumnMap, column_i64, column_text, lenient_i64};
use crate::{MessageStore, StoreError};
use rusqlite::{Connection, Row};
use talkbridge_types::models::{MessageMeta, MessageRow, ReactionSample};

/// `created_at` values below this are seconds, otherwise milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Millis,
}

impl TimeUnit {
    pub fn detect(max_created_at: Option<i64>) -> Self {
        match max_created_at {
            Some(ts) if ts >= MILLIS_THRESHOLD => Self::Millis,
            _ => Self::Seconds,
        }
    }

    /// Convert a unix timestamp in seconds into this unit.
    pub fn from_unix_secs(self, secs: i64) -> i64 {
        match self {
            Self::Seconds => secs,
            Self::Millis => secs.saturating_mul(1000),
        }
    }
}

impl MessageStore {
    // -- Messages --

    /// Up to `limit` rows with `_id > cursor`, ascending.
    pub fn fetch_after(&self, cursor: i64, limit: u32) -> Result<Vec<MessageRow>, StoreError> {
        let map = self.columns()?;
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chat_logs WHERE _id > ?1 ORDER BY _id ASC LIMIT ?2",
                map.select_list()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![cursor, limit], |row| message_from_row(row, &map))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Rows by explicit id, ascending. Ids no longer in the store are skipped.
    pub fn fetch_ids(&self, ids: &[i64]) -> Result<Vec<MessageRow>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let map = self.columns()?;
        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {} FROM chat_logs WHERE _id IN ({}) ORDER BY _id ASC",
                map.select_list(),
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                    message_from_row(row, &map)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Highest `_id` in the store, `None` when empty.
    pub fn max_id(&self) -> Result<Option<i64>, StoreError> {
        self.with_conn(|conn| {
            let max = conn.query_row("SELECT MAX(_id) FROM chat_logs", [], |row| {
                row.get::<_, Option<i64>>(0)
            })?;
            Ok(max)
        })
    }

    pub fn time_unit(&self) -> Result<TimeUnit, StoreError> {
        self.with_conn(|conn| Ok(TimeUnit::detect(max_created_at(conn)?)))
    }

    // -- Reactions --

    /// Newest-first rows created after `since` (store time unit) that carry
    /// reaction metadata.
    pub fn reactions_since(&self, since: i64, limit: u32) -> Result<Vec<ReactionSample>, StoreError> {
        self.reactions_between(since, None, limit)
    }

    /// Rows with `from < created_at <= to`, newest first. `to = None` means
    /// no upper bound.
    pub fn reactions_between(
        &self,
        from: i64,
        to: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ReactionSample>, StoreError> {
        let map = self.columns()?;
        if !map.has("v") {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chat_logs \
                 WHERE created_at > ?1 AND (?2 IS NULL OR created_at <= ?2) \
                 ORDER BY _id DESC LIMIT ?3",
                map.select_list()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![from, to, limit], |row| {
                    reaction_from_row(row, &map)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn max_created_at(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT MAX(created_at) FROM chat_logs", [], |row| {
        lenient_i64(row, 0)
    })
}

fn message_from_row(row: &Row<'_>, map: &ColumnMap) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: column_i64(row, map, "_id")?.unwrap_or_default(),
        chat_id: column_i64(row, map, "chat_id")?.unwrap_or_default(),
        sender_id: column_i64(row, map, "user_id")?,
        body: column_text(row, map, "message")?,
        created_at: column_i64(row, map, "created_at")?.unwrap_or_default(),
        metadata: column_text(row, map, "v")?,
        enc_type: column_i64(row, map, "encType")?,
        type_code: column_i64(row, map, "type")?,
        attachment: column_text(row, map, "attachment")?,
        reply_ref: column_i64(row, map, "referer")?,
        supplement: column_text(row, map, "supplement")?,
    })
}

fn reaction_from_row(row: &Row<'_>, map: &ColumnMap) -> rusqlite::Result<ReactionSample> {
    let meta = column_text(row, map, "v")?
        .as_deref()
        .map(MessageMeta::parse)
        .unwrap_or_default();

    Ok(ReactionSample {
        msg_id: column_i64(row, map, "_id")?.unwrap_or_default(),
        chat_id: column_i64(row, map, "chat_id")?.unwrap_or_default(),
        sender_id: column_i64(row, map, "user_id")?,
        count: meta.reaction_count,
        supplement: column_text(row, map, "supplement")?,
        created_at: column_i64(row, map, "created_at")?.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_detection() {
        assert_eq!(TimeUnit::detect(None), TimeUnit::Seconds);
        assert_eq!(TimeUnit::detect(Some(1_700_000_000)), TimeUnit::Seconds);
        assert_eq!(TimeUnit::detect(Some(1_700_000_000_000)), TimeUnit::Millis);
        assert_eq!(TimeUnit::Millis.from_unix_secs(2), 2000);
        assert_eq!(TimeUnit::Seconds.from_unix_secs(2), 2);
    }
}
