use std::collections::HashSet;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::classifier::{classify, RedirectKind};
use crate::platform::{snowflake, ChatPlatform, PlatformError, PlatformResult};
use crate::stats::CounterStore;

/// Totals recomputed from channel history
#[derive(Debug, Default)]
pub struct Backfill {
    pub appstore: u64,
    pub playstore: u64,
    /// IDs of every message that was counted
    pub counted: HashSet<String>,
}

/// Read the whole channel history and count the relayed redirects in it
pub async fn count_history(
    platform: &dyn ChatPlatform,
    channel_id: &str,
) -> PlatformResult<Backfill> {
    let mut result = Backfill::default();
    let mut scanned = 0u64;
    let mut history = platform.history(channel_id);

    while let Some(msg) = history.next().await {
        let msg = msg?;
        scanned += 1;
        if !msg.is_relay() {
            continue;
        }
        match classify(&msg.text) {
            Some(RedirectKind::AppStore) => result.appstore += 1,
            Some(RedirectKind::PlayStore) => result.playstore += 1,
            None => continue,
        }
        result.counted.insert(msg.id);
    }

    info!(
        "Scanned {} messages in channel {} ({} redirects)",
        scanned,
        channel_id,
        result.counted.len()
    );
    Ok(result)
}

/// Recount the store from history. On failure the counters are left untouched
/// and an empty set is returned.
///
/// Returns the counted IDs newer than `live_cursor`, the only ones the live
/// listener can still deliver, so it can skip them.
pub async fn backfill(
    platform: &dyn ChatPlatform,
    channel_id: &str,
    live_cursor: &str,
    store: &CounterStore,
) -> HashSet<String> {
    info!("Counting existing messages in channel {}...", channel_id);

    match count_history(platform, channel_id).await {
        Ok(result) => {
            store.reset(result.appstore, result.playstore).await;
            info!(
                "Existing counts: App Store: {}, Play Store: {}",
                result.appstore, result.playstore
            );
            let floor = snowflake(live_cursor);
            result
                .counted
                .into_iter()
                .filter(|id| snowflake(id) > floor)
                .collect()
        }
        Err(e @ PlatformError::ChannelUnavailable { .. }) => {
            warn!("Skipping history backfill: {}", e);
            HashSet::new()
        }
        Err(e) => {
            error!("History backfill failed: {}", e);
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{relay, typed, MockPlatform};

    fn mixed_history() -> Vec<crate::platform::ChannelMessage> {
        vec![
            relay("1", "🍎 NEW APP STORE REDIRECT"),
            relay("2", "🤖 NEW PLAY STORE REDIRECT"),
            typed("3", "alice", "🍎 did the APP STORE link work?"),
        ]
    }

    #[tokio::test]
    async fn test_count_skips_non_relay_messages() {
        let platform = MockPlatform::with_history(mixed_history());
        let result = count_history(&platform, "chan").await.unwrap();
        assert_eq!(result.appstore, 1);
        assert_eq!(result.playstore, 1);
        assert!(result.counted.contains("1"));
        assert!(result.counted.contains("2"));
        assert!(!result.counted.contains("3"));
    }

    #[tokio::test]
    async fn test_unclassified_relay_messages_not_counted() {
        let platform = MockPlatform::with_history(vec![
            relay("1", "deploy finished"),
            relay("2", "🍎 APP STORE"),
        ]);
        let result = count_history(&platform, "chan").await.unwrap();
        assert_eq!((result.appstore, result.playstore), (1, 0));
        assert_eq!(result.counted.len(), 1);
    }

    #[tokio::test]
    async fn test_order_does_not_matter() {
        let mut history = mixed_history();
        history.reverse();
        let platform = MockPlatform::with_history(history);
        let result = count_history(&platform, "chan").await.unwrap();
        assert_eq!((result.appstore, result.playstore), (1, 1));
    }

    #[tokio::test]
    async fn test_backfill_overwrites_store() {
        let platform = MockPlatform::with_history(mixed_history());
        let store = CounterStore::new();
        store.reset(40, 40).await;

        let counted = backfill(&platform, "chan", "0", &store).await;

        let snap = store.snapshot().await;
        assert_eq!((snap.appstore, snap.playstore, snap.total), (1, 1, 2));
        assert_eq!(counted.len(), 2);
    }

    #[tokio::test]
    async fn test_backfill_keeps_only_ids_after_live_cursor() {
        let platform = MockPlatform::with_history(mixed_history());
        let store = CounterStore::new();

        let counted = backfill(&platform, "chan", "1", &store).await;

        // Both redirects are counted, but only "2" can still arrive live
        assert_eq!(store.snapshot().await.total, 2);
        assert_eq!(counted, ["2".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_missing_channel_leaves_counts_at_zero() {
        let platform = MockPlatform {
            channel_missing: true,
            ..MockPlatform::with_history(mixed_history())
        };
        let store = CounterStore::new();

        let counted = backfill(&platform, "chan", "0", &store).await;

        assert!(counted.is_empty());
        assert_eq!(store.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn test_failed_read_commits_nothing() {
        let platform = MockPlatform {
            history_fails_after: Some(1),
            ..MockPlatform::with_history(mixed_history())
        };
        let store = CounterStore::new();

        let counted = backfill(&platform, "chan", "0", &store).await;

        assert!(counted.is_empty());
        assert_eq!(store.snapshot().await.total, 0);
    }
}
