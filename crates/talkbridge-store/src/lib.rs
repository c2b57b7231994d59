pub mod account;
pub mod names;
pub mod queries;
pub mod schema;

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub use account::{AccountCandidate, AccountIdResolver, AccountResolution, AccountSource};
pub use names::StoredName;
pub use queries::TimeUnit;
pub use schema::ColumnMap;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store file not found: {0}")]
    Missing(PathBuf),
    #[error("cannot open store {path}: {source}")]
    Access {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("store query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Read-only view of the chat application's message store.
///
/// Every operation opens its own short-lived connection: the host app keeps
/// writing to the same files and may hold locks of its own.
pub struct MessageStore {
    path: PathBuf,
    secondary: Option<PathBuf>,
    busy_timeout: Duration,
    columns: OnceLock<ColumnMap>,
    room_name_column: OnceLock<bool>,
    degraded_logged: AtomicBool,
}

impl MessageStore {
    pub fn new(path: impl Into<PathBuf>, secondary: Option<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            secondary,
            busy_timeout,
            columns: OnceLock::new(),
            room_name_column: OnceLock::new(),
            degraded_logged: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the store and fail fast if it cannot be read at all.
    pub fn check_access(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.open()?;
        f(&conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::Missing(self.path.clone()));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|source| {
            StoreError::Access {
                path: self.path.clone(),
                source,
            }
        })?;
        conn.busy_timeout(self.busy_timeout)?;

        if let Some(secondary) = self.secondary.as_deref().filter(|p| p.exists()) {
            let target = secondary.to_string_lossy();
            if let Err(e) = conn.execute("ATTACH DATABASE ?1 AS db2", [target.as_ref()]) {
                debug!("Could not attach {}: {}", secondary.display(), e);
            }
        }

        Ok(conn)
    }

    /// Whether `db2` is attached on `conn`.
    pub(crate) fn has_secondary(conn: &Connection) -> bool {
        conn.query_row(
            "SELECT 1 FROM pragma_database_list WHERE name = 'db2'",
            [],
            |_| Ok(()),
        )
        .is_ok()
    }

    /// Column layout of `chat_logs`, introspected once per process.
    ///
    /// When introspection itself fails the base column set is used for this
    /// call and the next call tries again.
    pub fn columns(&self) -> Result<ColumnMap, StoreError> {
        if let Some(map) = self.columns.get() {
            return Ok(map.clone());
        }

        match self.with_conn(|conn| Ok(schema::introspect(conn)?)) {
            Ok(map) => {
                let missing = map.missing_optional();
                if !missing.is_empty() {
                    self.warn_degraded(&format!("chat_logs lacks {}", missing.join(", ")));
                }
                Ok(self.columns.get_or_init(|| map).clone())
            }
            Err(StoreError::Query(e)) => {
                self.warn_degraded(&format!("column introspection failed: {}", e));
                Ok(ColumnMap::base())
            }
            Err(e) => Err(e),
        }
    }

    fn warn_degraded(&self, detail: &str) {
        if !self.degraded_logged.swap(true, Ordering::Relaxed) {
            warn!("Schema degraded, continuing with reduced columns: {}", detail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_reported() {
        let store = MessageStore::new("/nonexistent/KakaoTalk.db", None, Duration::from_millis(10));
        assert!(matches!(store.check_access(), Err(StoreError::Missing(_))));
    }
}
