use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use talkbridge_crypto::SaltMode;
use talkbridge_gateway::{ChannelConfig, ReconnectPolicy};

const DEFAULT_DB_PATH: &str = "/data/data/com.kakao.talk/databases/KakaoTalk.db";
const DEFAULT_DB2_PATH: &str = "/data/data/com.kakao.talk/databases/KakaoTalk2.db";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:5002/ws";

pub const CURSOR_FILE: &str = "last_message_id.txt";
pub const ACCOUNT_FILE: &str = "my_user_id.txt";

/// Everything the relay reads from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub db_path: PathBuf,
    pub db2_path: PathBuf,
    pub ws_url: String,
    pub state_dir: PathBuf,
    pub account_id: Option<i64>,

    pub batch_size: u32,
    pub poll_interval: Duration,

    pub reaction_interval: Duration,
    pub reaction_window: Duration,
    pub reaction_row_cap: u32,
    pub backfill_interval: Duration,
    pub backfill_window: Duration,
    pub backfill_chunk: Duration,
    pub backfill_chunk_rows: u32,

    pub dedup_cap: usize,
    pub dedup_seed: i64,
    pub reaction_cache_cap: usize,
    pub reaction_ttl: Duration,
    pub reaction_cooldown: Duration,

    pub reconnect_interval: Duration,
    pub reconnect_attempts: u32,
    pub send_timeout: Duration,
    pub store_timeout: Duration,

    pub strict_salt: bool,
    pub skip_own: bool,
    pub start_at_latest: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.into(),
            db2_path: DEFAULT_DB2_PATH.into(),
            ws_url: DEFAULT_WS_URL.into(),
            state_dir: ".".into(),
            account_id: None,
            batch_size: 10,
            poll_interval: Duration::from_millis(1000),
            reaction_interval: Duration::from_secs(15),
            reaction_window: Duration::from_secs(30 * 60),
            reaction_row_cap: 100,
            backfill_interval: Duration::from_secs(1800),
            backfill_window: Duration::from_secs(24 * 3600),
            backfill_chunk: Duration::from_secs(60 * 60),
            backfill_chunk_rows: 500,
            dedup_cap: 2000,
            dedup_seed: 1000,
            reaction_cache_cap: 5000,
            reaction_ttl: Duration::from_secs(48 * 3600),
            reaction_cooldown: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(3),
            reconnect_attempts: 10,
            send_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_millis(5000),
            strict_salt: false,
            skip_own: true,
            start_at_latest: true,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults; set but
    /// unparsable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let d = Self::default();

        let config = Self {
            db_path: env.string("TALKBRIDGE_DB_PATH").map_or(d.db_path, PathBuf::from),
            db2_path: env.string("TALKBRIDGE_DB2_PATH").map_or(d.db2_path, PathBuf::from),
            ws_url: env.string("TALKBRIDGE_WS_URL").unwrap_or(d.ws_url),
            state_dir: env
                .string("TALKBRIDGE_STATE_DIR")
                .or_else(|| env.string("HOME"))
                .map_or(d.state_dir, PathBuf::from),
            account_id: env.optional("TALKBRIDGE_ACCOUNT_ID")?,

            batch_size: env.number("TALKBRIDGE_BATCH_SIZE", d.batch_size)?,
            poll_interval: env.millis("TALKBRIDGE_POLL_INTERVAL_MS", d.poll_interval)?,

            reaction_interval: env.secs("TALKBRIDGE_REACTION_INTERVAL_SECS", d.reaction_interval)?,
            reaction_window: env.scaled("TALKBRIDGE_REACTION_WINDOW_MINS", 60, d.reaction_window)?,
            reaction_row_cap: env.number("TALKBRIDGE_REACTION_ROW_CAP", d.reaction_row_cap)?,
            backfill_interval: env.secs("TALKBRIDGE_BACKFILL_INTERVAL_SECS", d.backfill_interval)?,
            backfill_window: env.scaled("TALKBRIDGE_BACKFILL_WINDOW_HOURS", 3600, d.backfill_window)?,
            backfill_chunk: env.scaled("TALKBRIDGE_BACKFILL_CHUNK_MINS", 60, d.backfill_chunk)?,
            backfill_chunk_rows: env.number("TALKBRIDGE_BACKFILL_CHUNK_ROWS", d.backfill_chunk_rows)?,

            dedup_cap: env.number("TALKBRIDGE_DEDUP_CAP", d.dedup_cap)?,
            dedup_seed: env.number("TALKBRIDGE_DEDUP_SEED", d.dedup_seed)?,
            reaction_cache_cap: env.number("TALKBRIDGE_REACTION_CACHE_CAP", d.reaction_cache_cap)?,
            reaction_ttl: env.scaled("TALKBRIDGE_REACTION_TTL_HOURS", 3600, d.reaction_ttl)?,
            reaction_cooldown: env.secs("TALKBRIDGE_REACTION_COOLDOWN_SECS", d.reaction_cooldown)?,

            reconnect_interval: env.secs("TALKBRIDGE_RECONNECT_INTERVAL_SECS", d.reconnect_interval)?,
            reconnect_attempts: env.number("TALKBRIDGE_RECONNECT_ATTEMPTS", d.reconnect_attempts)?,
            send_timeout: env.secs("TALKBRIDGE_SEND_TIMEOUT_SECS", d.send_timeout)?,
            store_timeout: env.millis("TALKBRIDGE_STORE_TIMEOUT_MS", d.store_timeout)?,

            strict_salt: env.flag("TALKBRIDGE_STRICT_SALT", d.strict_salt)?,
            skip_own: env.flag("TALKBRIDGE_SKIP_OWN", d.skip_own)?,
            start_at_latest: env.flag("TALKBRIDGE_START_AT_LATEST", d.start_at_latest)?,
        };

        if config.batch_size == 0 {
            bail!("TALKBRIDGE_BATCH_SIZE must be at least 1");
        }
        if config.backfill_chunk.is_zero() {
            bail!("TALKBRIDGE_BACKFILL_CHUNK_MINS must be at least 1");
        }
        Ok(config)
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.state_dir.join(CURSOR_FILE)
    }

    pub fn account_file(&self) -> PathBuf {
        self.state_dir.join(ACCOUNT_FILE)
    }

    pub fn salt_mode(&self) -> SaltMode {
        if self.strict_salt {
            SaltMode::Strict
        } else {
            SaltMode::Lenient
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.ws_url.clone(),
            reconnect: ReconnectPolicy {
                interval: self.reconnect_interval,
                max_attempts: self.reconnect_attempts,
            },
            send_timeout: self.send_timeout,
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn optional<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("{}={:?}: {}", key, raw, e)),
            None => Ok(None),
        }
    }

    fn number<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn scaled(&self, key: &str, unit_secs: u64, default: Duration) -> Result<Duration> {
        match self.optional::<u64>(key)? {
            Some(n) => Ok(Duration::from_secs(
                n.checked_mul(unit_secs).with_context(|| format!("{} is too large", key))?,
            )),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.scaled(key, 1, default)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        Ok(self
            .optional::<u64>(key)?
            .map_or(default, Duration::from_millis))
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        let Some(raw) = self.string(key) else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("{}={:?} is not a boolean", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<RelayConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[("HOME", "/home/relay")]).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.reaction_window, Duration::from_secs(1800));
        assert_eq!(config.cursor_file(), PathBuf::from("/home/relay/last_message_id.txt"));
        assert_eq!(config.salt_mode(), SaltMode::Lenient);
        assert!(config.start_at_latest);
        assert_eq!(config.account_id, None);
    }

    #[test]
    fn overrides_apply() {
        let config = from_pairs(&[
            ("TALKBRIDGE_STATE_DIR", "/var/lib/talkbridge"),
            ("TALKBRIDGE_BATCH_SIZE", "25"),
            ("TALKBRIDGE_REACTION_TTL_HOURS", "2"),
            ("TALKBRIDGE_STRICT_SALT", "yes"),
            ("TALKBRIDGE_ACCOUNT_ID", "405979308"),
        ])
        .unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.reaction_ttl, Duration::from_secs(7200));
        assert_eq!(config.salt_mode(), SaltMode::Strict);
        assert_eq!(config.account_id, Some(405_979_308));
        assert_eq!(config.account_file(), PathBuf::from("/var/lib/talkbridge/my_user_id.txt"));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(from_pairs(&[("TALKBRIDGE_BATCH_SIZE", "ten")]).is_err());
        assert!(from_pairs(&[("TALKBRIDGE_BATCH_SIZE", "0")]).is_err());
        assert!(from_pairs(&[("TALKBRIDGE_SKIP_OWN", "maybe")]).is_err());
        assert!(from_pairs(&[("TALKBRIDGE_ACCOUNT_ID", "abc")]).is_err());
    }
}
