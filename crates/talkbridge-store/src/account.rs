use crate::schema::{lenient_i64, lenient_text};
use crate::{MessageStore, StoreError};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use talkbridge_types::models::json_i64;
use tracing::{info, warn};

/// How the own account id was found.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccountSource {
    Override,
    Persisted,
    OwnerRecord,
    Heuristic { confidence: f64 },
}

/// One id seen sending into rooms whose member list omits it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountCandidate {
    pub account_id: i64,
    /// Number of rooms where the id was seen as a non-member sender.
    pub hits: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountResolution {
    pub account_id: i64,
    pub source: AccountSource,
    /// Ranked heuristic candidates, empty unless the heuristic ran.
    pub candidates: Vec<AccountCandidate>,
}

/// Figures out whose copy of the store is being read.
///
/// Order: configured override, persisted file, explicit owner record, room
/// membership heuristic. Anything found after the file step is written back
/// to the file so the next start skips the store scan.
pub struct AccountIdResolver<'a> {
    store: &'a MessageStore,
    state_file: PathBuf,
}

impl<'a> AccountIdResolver<'a> {
    pub fn new(store: &'a MessageStore, state_file: impl Into<PathBuf>) -> Self {
        Self {
            store,
            state_file: state_file.into(),
        }
    }

    pub fn resolve(&self, manual: Option<i64>) -> Result<Option<AccountResolution>, StoreError> {
        if let Some(account_id) = manual.filter(|id| *id > 0) {
            info!("Using configured account id {}", account_id);
            self.persist(account_id);
            return Ok(Some(AccountResolution {
                account_id,
                source: AccountSource::Override,
                candidates: vec![],
            }));
        }

        if let Some(account_id) = self.load_persisted() {
            info!("Using persisted account id {}", account_id);
            return Ok(Some(AccountResolution {
                account_id,
                source: AccountSource::Persisted,
                candidates: vec![],
            }));
        }

        if let Some(account_id) = self.store.owner_record()? {
            info!("Found account id {} in the owner record", account_id);
            self.persist(account_id);
            return Ok(Some(AccountResolution {
                account_id,
                source: AccountSource::OwnerRecord,
                candidates: vec![],
            }));
        }

        let candidates = self.store.membership_candidates()?;
        for c in &candidates {
            info!(
                "Account candidate {} ({} rooms, {:.2}%)",
                c.account_id,
                c.hits,
                c.confidence * 100.0
            );
        }

        let Some(top) = candidates.first().copied() else {
            warn!(
                "Could not determine own account id; write it to {} or set TALKBRIDGE_ACCOUNT_ID",
                self.state_file.display()
            );
            return Ok(None);
        };

        warn!(
            "Guessed own account id {} with confidence {:.2}; override it if decryption keeps failing",
            top.account_id, top.confidence
        );
        self.persist(top.account_id);

        Ok(Some(AccountResolution {
            account_id: top.account_id,
            source: AccountSource::Heuristic {
                confidence: top.confidence,
            },
            candidates,
        }))
    }

    fn load_persisted(&self) -> Option<i64> {
        let raw = fs::read_to_string(&self.state_file).ok()?;
        match raw.trim().parse::<i64>() {
            Ok(id) if id > 0 => Some(id),
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", self.state_file.display(), e);
                None
            }
        }
    }

    fn persist(&self, account_id: i64) {
        if let Some(parent) = self.state_file.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warn!("Cannot create state directory {}: {}", parent.display(), e);
            return;
        }
        if let Err(e) = fs::write(&self.state_file, account_id.to_string()) {
            warn!("Failed to persist account id to {}: {}", self.state_file.display(), e);
        }
    }
}

impl MessageStore {
    /// `open_profile.user_id`, when the schema has that table.
    pub fn owner_record(&self) -> Result<Option<i64>, StoreError> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT user_id FROM open_profile LIMIT 1", [], |row| {
                    lenient_i64(row, 0)
                })
                .optional();
            match found {
                Ok(id) => Ok(id.flatten().filter(|id| *id > 0)),
                Err(rusqlite::Error::SqliteFailure(_, _)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Ids that post in rooms whose member list does not include them, ranked
    /// by how many rooms that happens in. The owner is usually not listed in
    /// their own rooms' member arrays.
    pub fn membership_candidates(&self) -> Result<Vec<AccountCandidate>, StoreError> {
        self.with_conn(|conn| {
            let rooms = room_members(conn)?;
            let mut counts: HashMap<i64, usize> = HashMap::new();

            for (chat_id, members) in rooms {
                if members.is_empty() {
                    continue;
                }
                for id in non_member_senders(conn, chat_id, &members)? {
                    *counts.entry(id).or_default() += 1;
                }
            }

            Ok(rank(counts))
        })
    }
}

fn room_members(conn: &Connection) -> Result<Vec<(i64, HashSet<i64>)>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, members FROM chat_rooms")?;
    let rooms = stmt
        .query_map([], |row| {
            let chat_id = lenient_i64(row, 0)?.unwrap_or_default();
            let members = lenient_text(row, 1)?;
            Ok((chat_id, members.as_deref().map(parse_members).unwrap_or_default()))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rooms)
}

fn non_member_senders(conn: &Connection, chat_id: i64, members: &HashSet<i64>) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM chat_logs WHERE chat_id = ?1 AND user_id IS NOT NULL")?;
    let senders = stmt
        .query_map([chat_id], |row| lenient_i64(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(senders
        .into_iter()
        .flatten()
        .filter(|id| !members.contains(id))
        .collect())
}

/// Member ids from a JSON array of numbers or numeric strings.
pub fn parse_members(raw: &str) -> HashSet<i64> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items.iter().filter_map(json_i64).collect(),
        _ => HashSet::new(),
    }
}

fn rank(counts: HashMap<i64, usize>) -> Vec<AccountCandidate> {
    let total: usize = counts.values().sum();
    let mut ranked: Vec<AccountCandidate> = counts
        .into_iter()
        .map(|(account_id, hits)| AccountCandidate {
            account_id,
            hits,
            confidence: hits as f64 / total as f64,
        })
        .collect();
    ranked.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.account_id.cmp(&b.account_id)));
    ranked
}
