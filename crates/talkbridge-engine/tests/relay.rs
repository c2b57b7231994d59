use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::{Connection, params};
use talkbridge_crypto::{SaltMode, derive_key, derive_salt, encrypt_field};
use talkbridge_engine::{EngineError, Relay, RelayConfig, ScanPass};
use talkbridge_gateway::{ChannelState, EventSink, TransportError};
use talkbridge_types::events::{AttemptRecord, Envelope};
use tempfile::TempDir;
use tokio::sync::watch;

const OWN: i64 = 405_979_308;
const FRIEND: i64 = 7_654_321;

/// In-memory collector. Fails the next `fail_next` deliveries.
struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
    fail_next: AtomicUsize,
    status: watch::Sender<ChannelState>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        let (status, _) = watch::channel(ChannelState::Connected { generation: 1 });
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            status,
        })
    }

    fn fail(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_ids(&self) -> Vec<i64> {
        self.sent().iter().map(Envelope::msg_id).collect()
    }
}

impl EventSink for RecordingSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    fn status(&self) -> watch::Receiver<ChannelState> {
        self.status.subscribe()
    }
}

struct Fixture {
    dir: TempDir,
    db: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("KakaoTalk.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(
            r#"CREATE TABLE chat_logs (
                _id INTEGER PRIMARY KEY, chat_id INTEGER, user_id INTEGER, message TEXT,
                created_at INTEGER, v TEXT, type INTEGER, attachment TEXT, referer INTEGER,
                supplement TEXT
            );
            CREATE TABLE chat_rooms (id INTEGER PRIMARY KEY, members TEXT, private_meta TEXT, link_id INTEGER, name TEXT);
            INSERT INTO chat_rooms VALUES (100, '[7654321]', '{"name":"lab"}', NULL, NULL);"#,
        )
        .unwrap();
        Self { dir, db }
    }

    fn conn(&self) -> Connection {
        Connection::open(&self.db).unwrap()
    }

    fn insert(&self, id: i64, body: &str, v: &str) {
        self.conn()
            .execute(
                "INSERT INTO chat_logs (_id, chat_id, user_id, message, created_at, v, type)
                 VALUES (?1, 100, ?2, ?3, ?4, ?5, 1)",
                params![id, FRIEND, body, chrono::Utc::now().timestamp(), v],
            )
            .unwrap();
    }

    fn insert_attachment(&self, id: i64, type_code: i64, attachment: &str) {
        self.conn()
            .execute(
                "INSERT INTO chat_logs (_id, chat_id, user_id, message, created_at, v, type, attachment)
                 VALUES (?1, 100, ?2, '', ?3, '{\"enc\":31}', ?4, ?5)",
                params![id, FRIEND, chrono::Utc::now().timestamp(), type_code, attachment],
            )
            .unwrap();
    }

    fn set_meta(&self, id: i64, v: &str) {
        self.conn()
            .execute("UPDATE chat_logs SET v = ?1 WHERE _id = ?2", params![v, id])
            .unwrap();
    }

    fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    fn config(&self) -> RelayConfig {
        RelayConfig {
            db_path: self.db.clone(),
            db2_path: self.dir.path().join("absent.db"),
            state_dir: self.state_dir(),
            account_id: Some(OWN),
            poll_interval: Duration::from_millis(20),
            reaction_interval: Duration::from_millis(50),
            reaction_cooldown: Duration::ZERO,
            start_at_latest: false,
            ..RelayConfig::default()
        }
    }
}

fn saved_cursor(dir: &Path) -> Option<i64> {
    std::fs::read_to_string(dir.join("last_message_id.txt"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn key_for(account_id: i64, enc: i64) -> [u8; 32] {
    derive_key(&derive_salt(account_id, enc, SaltMode::Lenient).unwrap())
}

#[tokio::test]
async fn relays_each_row_once() {
    let fx = Fixture::new();
    for id in 1..=3 {
        fx.insert(id, &format!("hello {id}"), r#"{"enc":31}"#);
    }
    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    let (mut messages, _) = relay.sessions(Some(OWN));

    let report = messages.poll_once().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(messages.poll_once().await.unwrap().delivered, 0);
    assert_eq!(sink.sent_ids(), vec![1, 2, 3]);
    assert_eq!(saved_cursor(&fx.state_dir()), Some(3));

    match &sink.sent()[0] {
        Envelope::Message { room, sender, body, raw, .. } => {
            assert_eq!(room, "lab");
            assert_eq!(sender, &FRIEND.to_string());
            assert_eq!(body, "hello 1");
            assert!(!raw.has_undetermined());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn restart_does_not_replay() {
    let fx = Fixture::new();
    fx.insert(1, "a", "{}");
    fx.insert(2, "b", "{}");
    let sink = RecordingSink::new();

    let relay = Relay::new(fx.config(), sink.clone());
    relay.sessions(Some(OWN)).0.poll_once().await.unwrap();

    let restarted = Relay::new(fx.config(), sink.clone());
    let (mut messages, _) = restarted.sessions(Some(OWN));
    assert_eq!(messages.cursor(), 2);
    fx.insert(3, "c", "{}");
    messages.poll_once().await.unwrap();

    assert_eq!(sink.sent_ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn decrypts_body_with_own_key() {
    let fx = Fixture::new();
    let ciphertext = encrypt_field(&key_for(OWN, 31), "안녕하세요 여러분");
    fx.insert(1, &ciphertext, r#"{"enc":31,"origin":"MSG"}"#);

    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    relay.sessions(Some(OWN)).0.poll_once().await.unwrap();

    match &sink.sent()[0] {
        Envelope::Message { body, origin, raw, .. } => {
            assert_eq!(body, "안녕하세요 여러분");
            assert_eq!(origin.as_deref(), Some("MSG"));
            assert!(raw.metadata.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn undetermined_body_forwards_raw_fields() {
    let fx = Fixture::new();
    let ciphertext = encrypt_field(&key_for(555, 31), "someone else's secret");
    fx.insert(1, &ciphertext, r#"{"enc":31}"#);

    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    relay.sessions(Some(OWN)).0.poll_once().await.unwrap();

    match &sink.sent()[0] {
        Envelope::Message { body, raw, .. } => {
            assert_eq!(body, &ciphertext);
            let field = raw.body.as_ref().unwrap();
            assert_eq!(field.ciphertext, ciphertext);
            // [31, 30, 32] for the own id, then for the sender
            assert_eq!(field.attempts.len(), 6);
            assert_eq!(field.attempts[0].account_id, OWN);
            assert_eq!(field.attempts[3].account_id, FRIEND);
            assert_eq!(raw.metadata.as_deref(), Some(r#"{"enc":31}"#));
            assert_eq!(raw.own_account_id, Some(OWN));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn non_json_attachment_keeps_matching_key() {
    let fx = Fixture::new();
    let ciphertext = encrypt_field(&key_for(OWN, 31), "plain words, not an object");
    fx.insert_attachment(1, 26, &ciphertext);

    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    relay.sessions(Some(OWN)).0.poll_once().await.unwrap();

    match &sink.sent()[0] {
        Envelope::Message { attachment, raw, .. } => {
            assert!(attachment.is_none());
            let field = raw.attachment.as_ref().unwrap();
            assert_eq!(field.ciphertext, ciphertext);
            assert_eq!(field.attempts, vec![AttemptRecord { enc: 31, account_id: OWN }]);
            assert_eq!(raw.own_account_id, Some(OWN));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn evicted_ids_stay_behind_cursor() {
    let fx = Fixture::new();
    for id in 1..=4 {
        fx.insert(id, "x", "{}");
    }
    let sink = RecordingSink::new();
    let config = RelayConfig {
        dedup_cap: 2,
        ..fx.config()
    };
    let relay = Relay::new(config, sink.clone());
    let (mut messages, _) = relay.sessions(Some(OWN));

    assert_eq!(messages.poll_once().await.unwrap().delivered, 4);
    assert_eq!(messages.tracker().window_len(), 2);
    assert!(!messages.tracker().is_seen(1));
    assert!(!messages.tracker().is_seen(2));
    assert!(messages.tracker().is_seen(4));

    fx.insert(5, "y", "{}");
    assert_eq!(messages.poll_once().await.unwrap().delivered, 1);
    assert_eq!(sink.sent_ids(), vec![1, 2, 3, 4, 5]);
    assert!(!messages.tracker().is_seen(3));
}

#[tokio::test]
async fn failed_send_is_retried_by_id() {
    let fx = Fixture::new();
    for id in 1..=3 {
        fx.insert(id, "x", "{}");
    }
    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    let (mut messages, _) = relay.sessions(Some(OWN));

    sink.fail(1);
    let report = messages.poll_once().await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.deferred, 3);
    // cursor still moves to the store maximum
    assert_eq!(messages.cursor(), 3);
    assert!(!messages.tracker().is_seen(1));

    let report = messages.poll_once().await.unwrap();
    assert_eq!(report.delivered, 3);
    messages.poll_once().await.unwrap();
    assert_eq!(sink.sent_ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn own_rows_are_skipped() {
    let fx = Fixture::new();
    fx.insert(1, "mine", r#"{"isMine":true}"#);
    fx.insert(2, "theirs", r#"{"isMine":false}"#);

    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    let report = relay.sessions(Some(OWN)).0.poll_once().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(sink.sent_ids(), vec![2]);
}

#[tokio::test]
async fn fresh_start_begins_at_latest() {
    let fx = Fixture::new();
    for id in 1..=5 {
        fx.insert(id, "old", "{}");
    }
    let sink = RecordingSink::new();
    let config = RelayConfig {
        start_at_latest: true,
        ..fx.config()
    };
    let relay = Relay::new(config, sink.clone());
    let (mut messages, _) = relay.sessions(Some(OWN));

    assert_eq!(messages.poll_once().await.unwrap().delivered, 0);
    assert_eq!(messages.cursor(), 5);

    fx.insert(6, "new", "{}");
    messages.poll_once().await.unwrap();
    assert_eq!(sink.sent_ids(), vec![6]);
}

#[tokio::test]
async fn reaction_increase_is_reported() {
    let fx = Fixture::new();
    fx.insert(1, "react to me", r#"{"defaultEmoticonsCount":2}"#);

    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    let (_, mut reactions) = relay.sessions(Some(OWN));

    assert_eq!(reactions.scan(ScanPass::Recent).await.unwrap(), 1);
    assert_eq!(reactions.scan(ScanPass::Recent).await.unwrap(), 0);

    fx.set_meta(1, r#"{"defaultEmoticonsCount":5}"#);
    assert_eq!(reactions.scan(ScanPass::Backfill).await.unwrap(), 1);

    let counts: Vec<(i64, i64)> = sink
        .sent()
        .iter()
        .map(|e| match e {
            Envelope::ReactionCountUpdate { old_count, new_count, room, .. } => {
                assert_eq!(room, "lab");
                (*old_count, *new_count)
            }
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(counts, vec![(0, 2), (2, 5)]);
}

#[tokio::test]
async fn failed_reaction_send_is_retried() {
    let fx = Fixture::new();
    fx.insert(1, "a", r#"{"defaultEmoticonsCount":1}"#);
    fx.insert(2, "b", r#"{"defaultEmoticonsCount":3}"#);

    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());
    let (_, mut reactions) = relay.sessions(Some(OWN));

    sink.fail(1);
    assert_eq!(reactions.scan(ScanPass::Recent).await.unwrap(), 0);
    assert_eq!(reactions.scan(ScanPass::Recent).await.unwrap(), 2);
    assert_eq!(reactions.tracker().cache().count(100, 2), Some(3));
}

#[tokio::test]
async fn abandoned_transport_is_fatal() {
    let fx = Fixture::new();
    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());

    let abandoning = sink.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        abandoning.status.send_replace(ChannelState::Abandoned);
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        relay.run(std::future::pending::<()>()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(EngineError::TransportAbandoned)));
    assert_eq!(saved_cursor(&fx.state_dir()), Some(0));
}

#[tokio::test]
async fn shutdown_flushes_cursor() {
    let fx = Fixture::new();
    for id in 1..=3 {
        fx.insert(id, "x", "{}");
    }
    let sink = RecordingSink::new();
    let relay = Relay::new(fx.config(), sink.clone());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        relay.run(tokio::time::sleep(Duration::from_millis(300))),
    )
    .await
    .unwrap();

    assert!(result.is_ok());
    assert_eq!(sink.sent_ids(), vec![1, 2, 3]);
    assert_eq!(saved_cursor(&fx.state_dir()), Some(3));
}
