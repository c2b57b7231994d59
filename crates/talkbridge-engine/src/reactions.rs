use std::collections::HashMap;
use std::time::{Duration, Instant};

use talkbridge_store::{MessageStore, StoreError};
use talkbridge_types::models::ReactionSample;
use tracing::debug;

/// A reaction counter that went up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionDelta {
    pub chat_id: i64,
    pub msg_id: i64,
    pub old_count: i64,
    pub new_count: i64,
    pub sender_id: Option<i64>,
    pub supplement: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    count: i64,
    last_seen: Instant,
    last_emitted: Option<Instant>,
}

/// Last known reaction count per (chat id, message id).
///
/// Bounded two ways: entries unseen for longer than `ttl` go first, then the
/// least recently seen while over `cap`.
#[derive(Debug)]
pub struct ReactionCache {
    entries: HashMap<(i64, i64), CacheEntry>,
    cap: usize,
    ttl: Duration,
    cooldown: Duration,
}

impl ReactionCache {
    pub fn new(cap: usize, ttl: Duration, cooldown: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            cap: cap.max(1),
            ttl,
            cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, chat_id: i64, msg_id: i64) -> Option<i64> {
        self.entries.get(&(chat_id, msg_id)).map(|e| e.count)
    }

    /// Compare one observation with the cache. A missing entry counts as 0.
    ///
    /// Only increases produce a delta. An increase inside the per-message
    /// cool-down leaves the cached count alone, so the whole jump is emitted
    /// once the cool-down has passed.
    pub fn observe(&mut self, sample: &ReactionSample, now: Instant) -> Option<ReactionDelta> {
        let key = (sample.chat_id, sample.msg_id);
        let delta = match self.entries.get_mut(&key) {
            Some(entry) => {
                let previous = entry.count;
                entry.last_seen = now;

                if sample.count > previous {
                    let cooling = entry
                        .last_emitted
                        .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown);
                    if cooling {
                        debug!("Reaction on {} held back by cool-down", sample.msg_id);
                        None
                    } else {
                        entry.count = sample.count;
                        entry.last_emitted = Some(now);
                        Some(previous)
                    }
                } else {
                    entry.count = sample.count;
                    None
                }
            }
            None if sample.count > 0 => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        count: sample.count,
                        last_seen: now,
                        last_emitted: Some(now),
                    },
                );
                Some(0)
            }
            // nothing to remember; absent already reads as 0
            None => None,
        };

        self.evict(now);

        delta.map(|old_count| ReactionDelta {
            chat_id: sample.chat_id,
            msg_id: sample.msg_id,
            old_count,
            new_count: sample.count,
            sender_id: sample.sender_id,
            supplement: sample.supplement.clone(),
        })
    }

    /// Put the entry back to its pre-delta count after the delta could not be
    /// delivered, so the next scan emits it again.
    pub fn rollback(&mut self, delta: &ReactionDelta) {
        if let Some(entry) = self.entries.get_mut(&(delta.chat_id, delta.msg_id)) {
            entry.count = delta.old_count;
            entry.last_emitted = None;
        }
    }

    fn evict(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) <= ttl);

        if self.entries.len() <= self.cap {
            return;
        }

        let mut by_age: Vec<((i64, i64), Instant)> =
            self.entries.iter().map(|(k, e)| (*k, e.last_seen)).collect();
        by_age.sort_by_key(|(_, seen)| *seen);
        let excess = self.entries.len() - self.cap;
        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }

    #[cfg(test)]
    fn insert_at(&mut self, chat_id: i64, msg_id: i64, count: i64, seen: Instant) {
        self.entries.insert(
            (chat_id, msg_id),
            CacheEntry {
                count,
                last_seen: seen,
                last_emitted: None,
            },
        );
        self.evict(seen);
    }
}

/// Scan bounds for the fast and backfill passes.
#[derive(Debug, Clone, Copy)]
pub struct ScanWindow {
    pub recent: Duration,
    pub recent_rows: u32,
    pub backfill: Duration,
    pub chunk: Duration,
    pub chunk_rows: u32,
}

/// Detects reaction-count increases from periodic store scans.
#[derive(Debug)]
pub struct ReactionDeltaTracker {
    cache: ReactionCache,
    window: ScanWindow,
}

impl ReactionDeltaTracker {
    pub fn new(cache: ReactionCache, window: ScanWindow) -> Self {
        Self { cache, window }
    }

    pub fn cache(&self) -> &ReactionCache {
        &self.cache
    }

    /// Feed observations through the cache and collect the deltas.
    pub fn observe_all(&mut self, samples: &[ReactionSample], now: Instant) -> Vec<ReactionDelta> {
        samples
            .iter()
            .filter_map(|s| self.cache.observe(s, now))
            .collect()
    }

    pub fn rollback(&mut self, delta: &ReactionDelta) {
        self.cache.rollback(delta);
    }

    /// Rows created within the recent window, capped.
    pub fn scan_recent(
        &mut self,
        store: &MessageStore,
        now_unix: i64,
        now: Instant,
    ) -> Result<Vec<ReactionDelta>, StoreError> {
        let unit = store.time_unit()?;
        let since = unit.from_unix_secs(now_unix.saturating_sub(whole_secs(self.window.recent)));
        let samples = store.reactions_since(since, self.window.recent_rows)?;
        Ok(self.observe_all(&samples, now))
    }

    /// Walk the long history window oldest chunk first.
    pub fn backfill(
        &mut self,
        store: &MessageStore,
        now_unix: i64,
        now: Instant,
    ) -> Result<Vec<ReactionDelta>, StoreError> {
        let unit = store.time_unit()?;
        let mut deltas = Vec::new();

        for (from, to) in chunks(now_unix, self.window.backfill, self.window.chunk) {
            let samples = store.reactions_between(
                unit.from_unix_secs(from),
                Some(unit.from_unix_secs(to)),
                self.window.chunk_rows,
            )?;
            deltas.extend(self.observe_all(&samples, now));
        }
        Ok(deltas)
    }
}

/// `(from, to]` unix-second ranges covering `horizon` back from `now_unix`.
pub fn chunks(now_unix: i64, horizon: Duration, chunk: Duration) -> Vec<(i64, i64)> {
    let step = whole_secs(chunk).max(1);
    let start = now_unix.saturating_sub(whole_secs(horizon));
    let mut ranges = Vec::new();
    let mut from = start;
    while from < now_unix {
        let to = from.saturating_add(step).min(now_unix);
        ranges.push((from, to));
        from = to;
    }
    ranges
}

fn whole_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
