use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::state::{CursorFile, StateError};

/// Persisted read position plus a bounded window of recently seen ids.
///
/// Ids are store-assigned and monotonic, so the smallest id in the window is
/// also the oldest and goes first when the window is full.
#[derive(Debug)]
pub struct CursorDedupTracker {
    file: CursorFile,
    cursor: i64,
    persisted: Option<i64>,
    window: BTreeSet<i64>,
    cap: usize,
    /// Ids whose send failed, re-fetched by id on the next cycle.
    retry: BTreeSet<i64>,
}

impl CursorDedupTracker {
    /// Load the cursor and seed the window with up to `seed` ids at or below
    /// it. A missing or unreadable file starts from 0.
    pub fn load(file: CursorFile, cap: usize, seed: i64) -> Self {
        let persisted = match file.load() {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!("{}; starting from 0", e);
                None
            }
        };
        let cursor = persisted.unwrap_or(0);

        let mut tracker = Self {
            file,
            cursor,
            persisted,
            window: BTreeSet::new(),
            cap: cap.max(1),
            retry: BTreeSet::new(),
        };
        let low = cursor.saturating_sub(seed).max(0);
        for id in (low + 1)..=cursor {
            tracker.insert(id);
        }
        debug!("Cursor {} loaded, {} ids seeded", cursor, tracker.window.len());
        tracker
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Whether a cursor file existed when the tracker was loaded.
    pub fn has_persisted(&self) -> bool {
        self.persisted.is_some()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn is_seen(&self, id: i64) -> bool {
        self.window.contains(&id)
    }

    /// Mark `id` as pulled. Returns `false` if it was already seen.
    pub fn mark(&mut self, id: i64) -> bool {
        self.retry.remove(&id);
        self.insert(id)
    }

    /// Undo [`mark`](Self::mark) after a failed send and queue a retry.
    pub fn unmark(&mut self, id: i64) {
        self.window.remove(&id);
        self.defer(id);
    }

    /// Queue an id that was never processed in this cycle.
    pub fn defer(&mut self, id: i64) {
        self.retry.insert(id);
        while self.retry.len() > self.cap {
            self.retry.pop_first();
        }
    }

    pub fn retry_ids(&self) -> Vec<i64> {
        self.retry.iter().copied().collect()
    }

    pub fn clear_retries(&mut self) {
        self.retry.clear();
    }

    /// Move the cursor forward. Never moves it back.
    pub fn advance_to(&mut self, id: i64) {
        if id > self.cursor {
            self.cursor = id;
        }
    }

    /// Persist the cursor if it changed since the last write.
    pub fn flush(&mut self) -> Result<(), StateError> {
        if self.persisted == Some(self.cursor) {
            return Ok(());
        }
        self.file.store(self.cursor)?;
        self.persisted = Some(self.cursor);
        Ok(())
    }

    fn insert(&mut self, id: i64) -> bool {
        if !self.window.insert(id) {
            return false;
        }
        while self.window.len() > self.cap {
            self.window.pop_first();
        }
        true
    }
}
