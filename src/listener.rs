use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, RedirectKind};
use crate::platform::{ChannelMessage, ChatPlatform, ORIGIN_CURSOR};
use crate::stats::CounterStore;

/// Capacity of the live event queue. A full queue pauses the poller.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

/// Applies live messages to the counters
pub struct Listener {
    store: CounterStore,
    bot_user_id: String,
    /// Messages already counted by the history backfill
    backfilled: HashSet<String>,
}

impl Listener {
    pub fn new(store: CounterStore, bot_user_id: String, backfilled: HashSet<String>) -> Self {
        Self {
            store,
            bot_user_id,
            backfilled,
        }
    }

    /// Count one message if it is an eligible redirect
    pub async fn handle(&self, msg: &ChannelMessage) -> Option<RedirectKind> {
        if msg.author_id == self.bot_user_id || !msg.is_relay() {
            return None;
        }
        if self.backfilled.contains(&msg.id) {
            debug!("Message {} already counted by backfill", msg.id);
            return None;
        }
        let kind = classify(&msg.text)?;
        let total = self.store.increment(kind).await;
        info!("New {} redirect detected! Total: {}", kind, total);
        Some(kind)
    }

    /// Wait for the backfill to commit, then drain the event queue.
    /// Events that arrive in the meantime stay queued.
    pub async fn run(
        store: CounterStore,
        bot_user_id: String,
        ready: oneshot::Receiver<HashSet<String>>,
        mut rx: mpsc::Receiver<ChannelMessage>,
    ) {
        let backfilled = match ready.await {
            Ok(ids) => ids,
            Err(_) => {
                warn!("Backfill never signalled readiness; counting live messages only");
                HashSet::new()
            }
        };
        info!(
            "Listener ready ({} queued events, {} backfilled ids)",
            rx.len(),
            backfilled.len()
        );

        let listener = Self::new(store, bot_user_id, backfilled);
        while let Some(msg) = rx.recv().await {
            let handled = AssertUnwindSafe(listener.handle(&msg)).catch_unwind().await;
            if handled.is_err() {
                error!("Handling message {} panicked; skipping it", msg.id);
            }
        }
        info!("Event queue closed, listener stopping");
    }
}

/// Where live delivery starts: the newest message present before the backfill
/// reads history. If that cannot be read, delivery starts from the beginning of
/// the channel and the backfilled IDs filter out what was already counted.
pub async fn start_cursor(platform: &dyn ChatPlatform, channel_id: &str) -> String {
    match platform.live_cursor(channel_id).await {
        Ok(cursor) => cursor,
        Err(e) => {
            warn!(
                "Could not read the newest message in channel {}: {}; rescanning from the start",
                channel_id, e
            );
            ORIGIN_CURSOR.to_string()
        }
    }
}

/// Keep the platform's listen loop running, restarting it with backoff on failure.
pub fn spawn_supervised(
    platform: Arc<dyn ChatPlatform>,
    channel_id: String,
    cursor: String,
    tx: mpsc::Sender<ChannelMessage>,
) -> tokio::task::JoinHandle<()> {
    spawn_supervised_with_backoff(
        platform,
        channel_id,
        cursor,
        tx,
        Duration::from_secs(INITIAL_BACKOFF_SECS),
        Duration::from_secs(MAX_BACKOFF_SECS),
    )
}

/// Like `spawn_supervised`, with explicit backoff bounds.
/// The cursor survives restarts, so nothing posted while the listener was down is skipped.
pub fn spawn_supervised_with_backoff(
    platform: Arc<dyn ChatPlatform>,
    channel_id: String,
    mut cursor: String,
    tx: mpsc::Sender<ChannelMessage>,
    initial_backoff: Duration,
    max_backoff: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = initial_backoff;

        loop {
            let result = platform.listen(&channel_id, &mut cursor, tx.clone()).await;

            if tx.is_closed() {
                break;
            }

            match result {
                Ok(()) => warn!("Channel listener exited unexpectedly; restarting"),
                Err(e) => error!("Channel listener error: {}; restarting from {}", e, cursor),
            }

            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::discord::stub::{self, StubState};
    use crate::platform::mock::{relay, typed, MockPlatform};
    use crate::reconcile;

    fn listener(store: &CounterStore, backfilled: &[&str]) -> Listener {
        Listener::new(
            store.clone(),
            "bot".to_string(),
            backfilled.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_counts_relayed_redirects() {
        let store = CounterStore::new();
        let l = listener(&store, &[]);

        assert_eq!(
            l.handle(&relay("10", "🍎 NEW APP STORE REDIRECT")).await,
            Some(RedirectKind::AppStore)
        );
        assert_eq!(
            l.handle(&relay("11", "🤖 NEW PLAY STORE REDIRECT")).await,
            Some(RedirectKind::PlayStore)
        );

        let snap = store.snapshot().await;
        assert_eq!((snap.appstore, snap.playstore), (1, 1));
    }

    #[tokio::test]
    async fn test_ignores_typed_messages() {
        let store = CounterStore::new();
        let l = listener(&store, &[]);

        assert_eq!(l.handle(&typed("10", "alice", "🍎 APP STORE")).await, None);
        assert_eq!(store.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn test_ignores_own_messages() {
        let store = CounterStore::new();
        let l = listener(&store, &[]);
        let own = ChannelMessage {
            id: "10".to_string(),
            author_id: "bot".to_string(),
            text: "🍎 APP STORE".to_string(),
            webhook_id: Some("hook".to_string()),
        };

        assert_eq!(l.handle(&own).await, None);
        assert_eq!(store.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn test_skips_backfilled_ids() {
        let store = CounterStore::new();
        let l = listener(&store, &["10"]);

        assert_eq!(l.handle(&relay("10", "🍎 APP STORE")).await, None);
        assert_eq!(
            l.handle(&relay("11", "🍎 APP STORE")).await,
            Some(RedirectKind::AppStore)
        );
        assert_eq!(store.snapshot().await.appstore, 1);
    }

    #[tokio::test]
    async fn test_events_wait_for_backfill() {
        let store = CounterStore::new();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(Listener::run(store.clone(), "bot".to_string(), ready_rx, rx));

        // Arrives live while the backfill is still reading history
        tx.send(relay("2", "🤖 PLAY STORE")).await.unwrap();
        tx.send(relay("3", "🍎 APP STORE")).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(store.snapshot().await.total, 0);

        // Backfill saw message 2 as well, and commits before opening the gate
        store.reset(4, 1).await;
        ready_tx
            .send(["2".to_string()].into_iter().collect())
            .unwrap();

        drop(tx);
        task.await.unwrap();

        let snap = store.snapshot().await;
        assert_eq!((snap.appstore, snap.playstore), (5, 1));
    }

    #[tokio::test]
    async fn test_dropped_gate_still_drains() {
        let store = CounterStore::new();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<HashSet<String>>();
        drop(ready_tx);

        tx.send(relay("1", "🍎 APP STORE")).await.unwrap();
        drop(tx);
        Listener::run(store.clone(), "bot".to_string(), ready_rx, rx).await;

        assert_eq!(store.snapshot().await.appstore, 1);
    }

    #[tokio::test]
    async fn test_supervisor_stops_when_queue_closes() {
        let platform: Arc<dyn ChatPlatform> = Arc::new(MockPlatform::default());
        let (tx, rx) = mpsc::channel(1);
        let handle = spawn_supervised(platform, "chan".to_string(), "0".to_string(), tx);
        drop(rx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_cursor_from_newest_message() {
        let platform = MockPlatform::with_history(vec![
            relay("3", "🍎 APP STORE"),
            relay("12", "🍎 APP STORE"),
            relay("7", "🍎 APP STORE"),
        ]);
        assert_eq!(start_cursor(&platform, "chan").await, "12");
    }

    #[tokio::test]
    async fn test_start_cursor_falls_back_to_origin() {
        let mut state = StubState::default();
        state.post(1, "🍎 APP STORE", true);
        state.fail(
            |q| q.get("limit").map(String::as_str) == Some("1"),
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "message": "boom" }),
        );
        let (client, _) = stub::spawn(state, Duration::from_secs(5)).await;

        assert_eq!(start_cursor(&client, "42").await, ORIGIN_CURSOR);
    }

    #[tokio::test]
    async fn test_redirect_posted_during_startup_is_counted_once() {
        let mut state = StubState::default();
        state.post(1, "🍎 NEW APP STORE REDIRECT", true);
        // The cursor read fails transiently at startup
        state.fail(
            |q| q.get("limit").map(String::as_str) == Some("1"),
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "message": "boom" }),
        );
        let (client, stub_state) = stub::spawn(state, Duration::from_millis(20)).await;
        let platform: Arc<dyn ChatPlatform> = Arc::new(client);
        let store = CounterStore::new();

        // Same order as startup: cursor, listener, backfill, gate
        let cursor = start_cursor(platform.as_ref(), "42").await;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let _supervisor = spawn_supervised(platform.clone(), "42".to_string(), cursor.clone(), tx);
        let consumer = tokio::spawn(Listener::run(store.clone(), "bot".to_string(), ready_rx, rx));

        let backfilled = reconcile::backfill(platform.as_ref(), "42", &cursor, &store).await;
        // Posted right after the history snapshot was read
        stub_state
            .lock()
            .unwrap()
            .post(1000, "🍎 NEW APP STORE REDIRECT", true);
        ready_tx.send(backfilled).unwrap();

        for _ in 0..100 {
            if store.snapshot().await.appstore >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.snapshot().await.appstore, 2);
        consumer.abort();
    }
}
