use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use talkbridge_crypto::{CandidateDecryptor, DecryptionContext};
use talkbridge_gateway::{ChannelState, EventSink};
use talkbridge_store::{AccountIdResolver, AccountSource, MessageStore, StoreError};
use talkbridge_types::models::MessageRow;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::cursor::CursorDedupTracker;
use crate::messages::EventAssembler;
use crate::reactions::{ReactionCache, ReactionDelta, ReactionDeltaTracker, ScanWindow};
use crate::state::CursorFile;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("collector connection abandoned; giving up")]
    TransportAbandoned,
    #[error("{0} loop exited unexpectedly")]
    LoopExited(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("relay task failed: {0}")]
    Task(#[from] JoinError),
}

/// Counts from one message poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub deferred: usize,
}

/// Wires the store, decryptor and sink together and drives both loops.
pub struct Relay<S> {
    config: RelayConfig,
    store: Arc<MessageStore>,
    sink: Arc<S>,
}

impl<S: EventSink + 'static> Relay<S> {
    pub fn new(config: RelayConfig, sink: Arc<S>) -> Self {
        let secondary = Some(config.db2_path.clone()).filter(|p| p.exists());
        let store = MessageStore::new(config.db_path.clone(), secondary, config.store_timeout);
        Self::with_store(config, Arc::new(store), sink)
    }

    pub fn with_store(config: RelayConfig, store: Arc<MessageStore>, sink: Arc<S>) -> Self {
        Self { config, store, sink }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Resolve the own account id. Store trouble is not fatal here: the relay
    /// still decrypts whatever the sender ids unlock.
    pub fn resolve_account(&self) -> Option<i64> {
        let resolver = AccountIdResolver::new(&self.store, self.config.account_file());
        match resolver.resolve(self.config.account_id) {
            Ok(Some(resolution)) => {
                if let AccountSource::Heuristic { confidence } = resolution.source
                    && confidence < 0.5
                {
                    warn!(
                        "Own account id {} is a low-confidence guess ({:.2}); set TALKBRIDGE_ACCOUNT_ID to pin it",
                        resolution.account_id, confidence
                    );
                }
                info!("Own account id {} ({:?})", resolution.account_id, resolution.source);
                Some(resolution.account_id)
            }
            Ok(None) => {
                warn!("Own account id unknown; only sender-derived keys will be tried");
                None
            }
            Err(e) => {
                warn!("Account resolution failed: {}", e);
                None
            }
        }
    }

    /// Build both loop sessions around a shared decryptor.
    pub fn sessions(&self, own_account_id: Option<i64>) -> (MessageSession<S>, ReactionSession<S>) {
        let decryptor = CandidateDecryptor::new(
            DecryptionContext::new(own_account_id),
            self.config.salt_mode(),
        );
        let assembler = EventAssembler::new(self.store.clone(), Arc::new(decryptor));
        let config = &self.config;

        let tracker = CursorDedupTracker::load(
            CursorFile::new(config.cursor_file()),
            config.dedup_cap,
            config.dedup_seed,
        );
        let messages = MessageSession {
            store: self.store.clone(),
            assembler: assembler.clone(),
            sink: self.sink.clone(),
            tracker,
            batch_size: config.batch_size,
            interval: config.poll_interval,
            skip_own: config.skip_own,
            needs_priming: config.start_at_latest,
        };

        let cache = ReactionCache::new(
            config.reaction_cache_cap,
            config.reaction_ttl,
            config.reaction_cooldown,
        );
        let window = ScanWindow {
            recent: config.reaction_window,
            recent_rows: config.reaction_row_cap,
            backfill: config.backfill_window,
            chunk: config.backfill_chunk,
            chunk_rows: config.backfill_chunk_rows,
        };
        let reactions = ReactionSession {
            store: self.store.clone(),
            assembler,
            sink: self.sink.clone(),
            tracker: ReactionDeltaTracker::new(cache, window),
            interval: config.reaction_interval,
            backfill_interval: config.backfill_interval,
        };

        (messages, reactions)
    }

    /// Run until `shutdown` resolves or the transport gives up.
    ///
    /// The message loop flushes its cursor before this returns, on both the
    /// clean and the fatal path.
    pub async fn run<F>(self, shutdown: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()> + Send,
    {
        let own_account_id = self.resolve_account();
        let (messages, reactions) = self.sessions(own_account_id);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut message_task = tokio::spawn(messages.run(stop_rx.clone()));
        let mut reaction_task = tokio::spawn(reactions.run(stop_rx));
        info!(
            "Relay running: poll every {:?}, reaction scan every {:?}",
            self.config.poll_interval, self.config.reaction_interval
        );

        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested, stopping relay loops");
                Ok(())
            }
            _ = wait_abandoned(self.sink.status()) => {
                error!("Collector unreachable after all reconnect attempts");
                Err(EngineError::TransportAbandoned)
            }
            res = &mut message_task => {
                reaction_task.abort();
                res?;
                return Err(EngineError::LoopExited("message"));
            }
            res = &mut reaction_task => {
                let _ = stop_tx.send(true);
                let _ = message_task.await;
                res?;
                return Err(EngineError::LoopExited("reaction"));
            }
        };

        let _ = stop_tx.send(true);
        let (m, r) = tokio::join!(message_task, reaction_task);
        m?;
        r?;
        outcome
    }
}

async fn wait_abandoned(mut status: watch::Receiver<ChannelState>) {
    loop {
        if status.borrow_and_update().is_abandoned() {
            return;
        }
        if status.changed().await.is_err() {
            // sender gone: the state can no longer change
            std::future::pending::<()>().await;
        }
    }
}

/// Message poll loop state: cursor, dedup window and retry queue.
pub struct MessageSession<S> {
    store: Arc<MessageStore>,
    assembler: EventAssembler,
    sink: Arc<S>,
    tracker: CursorDedupTracker,
    batch_size: u32,
    interval: Duration,
    skip_own: bool,
    needs_priming: bool,
}

impl<S: EventSink> MessageSession<S> {
    pub fn cursor(&self) -> i64 {
        self.tracker.cursor()
    }

    pub fn tracker(&self) -> &CursorDedupTracker {
        &self.tracker
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }

            match self.poll_once().await {
                Ok(report) if report.delivered > 0 || report.deferred > 0 => {
                    debug!(
                        fetched = report.fetched,
                        delivered = report.delivered,
                        skipped = report.skipped,
                        deferred = report.deferred,
                        "Poll cycle done, cursor {}",
                        self.tracker.cursor()
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Poll cycle failed: {}", e),
            }
        }

        match self.tracker.flush() {
            Ok(()) => info!("Cursor {} saved", self.tracker.cursor()),
            Err(e) => error!("{}", e),
        }
    }

    /// One poll cycle: retries first, then new rows above the cursor.
    pub async fn poll_once(&mut self) -> Result<PollReport, StoreError> {
        let mut report = PollReport::default();

        if self.needs_priming {
            let latest = if self.tracker.has_persisted() {
                None
            } else {
                self.store.max_id()?
            };
            self.needs_priming = false;
            if let Some(latest) = latest {
                info!("No saved cursor; starting after latest message {}", latest);
                self.tracker.advance_to(latest);
                self.flush();
                return Ok(report);
            }
        }

        let latest = self.store.max_id()?;

        let retry = self.tracker.retry_ids();
        let mut rows = if retry.is_empty() {
            Vec::new()
        } else {
            self.store.fetch_ids(&retry)?
        };
        self.tracker.clear_retries();

        let fresh = self.store.fetch_after(self.tracker.cursor(), self.batch_size)?;
        if fresh.len() as u32 == self.batch_size
            && let (Some(latest), Some(last)) = (latest, fresh.last())
            && latest > last.id
        {
            warn!("Burst of new rows: jumping cursor from {} to {}", last.id, latest);
        }
        rows.extend(fresh);
        rows.sort_by_key(|r| r.id);
        rows.dedup_by_key(|r| r.id);
        report.fetched = rows.len();

        let mut pending = rows.into_iter();
        while let Some(row) = pending.next() {
            if !self.tracker.mark(row.id) {
                report.skipped += 1;
                continue;
            }
            self.tracker.advance_to(row.id);

            if self.skip_own && row.meta().is_mine {
                debug!(msg_id = row.id, "Skipping own message");
                report.skipped += 1;
                continue;
            }

            if self.deliver(&row).await {
                report.delivered += 1;
            } else {
                self.tracker.unmark(row.id);
                report.deferred += 1;
                for rest in pending.by_ref() {
                    self.tracker.defer(rest.id);
                    report.deferred += 1;
                }
            }
        }

        if let Some(latest) = latest {
            self.tracker.advance_to(latest);
        }
        self.flush();
        Ok(report)
    }

    async fn deliver(&self, row: &MessageRow) -> bool {
        let envelope = self.assembler.message(row);
        match self.sink.deliver(&envelope).await {
            Ok(()) => {
                info!(msg_id = row.id, chat_id = row.chat_id, "Message relayed");
                true
            }
            Err(e) => {
                warn!(msg_id = row.id, "Send failed, will retry: {}", e);
                false
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.tracker.flush() {
            warn!("{}", e);
        }
    }
}

/// Which reaction pass to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPass {
    Recent,
    Backfill,
}

/// Reaction loop state: the delta cache plus its two cadences.
pub struct ReactionSession<S> {
    store: Arc<MessageStore>,
    assembler: EventAssembler,
    sink: Arc<S>,
    tracker: ReactionDeltaTracker,
    interval: Duration,
    backfill_interval: Duration,
}

impl<S: EventSink> ReactionSession<S> {
    pub fn tracker(&self) -> &ReactionDeltaTracker {
        &self.tracker
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut fast = tokio::time::interval(self.interval);
        fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut slow = tokio::time::interval(self.backfill_interval);
        slow.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let pass = tokio::select! {
                _ = slow.tick() => ScanPass::Backfill,
                _ = fast.tick() => ScanPass::Recent,
                _ = stop.changed() => break,
            };

            match self.scan(pass).await {
                Ok(0) => {}
                Ok(sent) => debug!("{:?} reaction pass sent {} update(s)", pass, sent),
                Err(e) => warn!("{:?} reaction pass failed: {}", pass, e),
            }
        }
    }

    /// Run one pass and deliver its deltas. Returns how many were sent.
    pub async fn scan(&mut self, pass: ScanPass) -> Result<usize, StoreError> {
        let now_unix = chrono::Utc::now().timestamp();
        let now = Instant::now();
        let deltas = match pass {
            ScanPass::Recent => self.tracker.scan_recent(&self.store, now_unix, now)?,
            ScanPass::Backfill => self.tracker.backfill(&self.store, now_unix, now)?,
        };
        Ok(self.deliver_all(deltas).await)
    }

    async fn deliver_all(&mut self, deltas: Vec<ReactionDelta>) -> usize {
        let mut sent = 0;
        let mut pending = deltas.into_iter();

        while let Some(delta) = pending.next() {
            let envelope = self.assembler.reaction(&delta);
            match self.sink.deliver(&envelope).await {
                Ok(()) => {
                    info!(
                        msg_id = delta.msg_id,
                        chat_id = delta.chat_id,
                        "Reaction count {} -> {}",
                        delta.old_count,
                        delta.new_count
                    );
                    sent += 1;
                }
                Err(e) => {
                    warn!(msg_id = delta.msg_id, "Reaction send failed: {}", e);
                    self.tracker.rollback(&delta);
                    for rest in pending.by_ref() {
                        self.tracker.rollback(&rest);
                    }
                }
            }
        }
        sent
    }
}
