use rusqlite::Connection;
use rusqlite::Row;
use rusqlite::types::ValueRef;
use std::collections::HashMap;

/// Columns every supported `chat_logs` version has.
pub const BASE_COLUMNS: [&str; 5] = ["_id", "chat_id", "user_id", "message", "created_at"];

/// Enrichment columns, selected only when the schema carries them.
pub const OPTIONAL_COLUMNS: [&str; 6] = ["v", "encType", "type", "attachment", "referer", "supplement"];

/// Selected `chat_logs` columns and their positions in the result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    columns: Vec<&'static str>,
    index: HashMap<&'static str, usize>,
}

impl ColumnMap {
    pub fn base() -> Self {
        Self::from_present(&[])
    }

    /// Base columns plus whichever optional ones appear in `present`.
    pub fn from_present(present: &[String]) -> Self {
        let columns: Vec<&'static str> = BASE_COLUMNS
            .iter()
            .chain(
                OPTIONAL_COLUMNS
                    .iter()
                    .filter(|c| present.iter().any(|p| p == *c)),
            )
            .copied()
            .collect();

        let index = columns.iter().enumerate().map(|(i, c)| (*c, i)).collect();
        Self { columns, index }
    }

    pub fn has(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    /// Comma-separated list for a SELECT clause.
    pub fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn missing_optional(&self) -> Vec<&'static str> {
        OPTIONAL_COLUMNS
            .iter()
            .filter(|c| !self.has(c))
            .copied()
            .collect()
    }
}

pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

pub fn introspect(conn: &Connection) -> rusqlite::Result<ColumnMap> {
    Ok(ColumnMap::from_present(&table_columns(conn, "chat_logs")?))
}

/// Integer value of a column that may hold INTEGER, REAL or numeric TEXT.
pub fn lenient_i64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(i) => Some(i),
        ValueRef::Real(f) => Some(f as i64),
        ValueRef::Text(t) => std::str::from_utf8(t).ok().and_then(|s| s.trim().parse().ok()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    })
}

/// Text value of a column that may hold TEXT, a number, or a UTF-8 blob.
pub fn lenient_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Null => None,
    })
}

/// Like [`lenient_i64`], addressed by column name through `map`.
pub fn column_i64(row: &Row<'_>, map: &ColumnMap, column: &str) -> rusqlite::Result<Option<i64>> {
    match map.position(column) {
        Some(idx) => lenient_i64(row, idx),
        None => Ok(None),
    }
}

pub fn column_text(row: &Row<'_>, map: &ColumnMap, column: &str) -> rusqlite::Result<Option<String>> {
    match map.position(column) {
        Some(idx) => lenient_text(row, idx),
        None => Ok(None),
    }
}
