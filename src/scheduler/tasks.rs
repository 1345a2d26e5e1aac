use std::sync::Arc;

use tracing::info;

use crate::config::ReportConfig;
use crate::platform::ChatPlatform;
use crate::report;
use crate::scheduler::Scheduler;
use crate::stats::CounterStore;

/// Register the hourly summary and the heartbeat
pub async fn register_builtin_tasks(
    scheduler: &Scheduler,
    platform: Arc<dyn ChatPlatform>,
    channel_id: String,
    store: CounterStore,
    report_config: ReportConfig,
) -> anyhow::Result<()> {
    let summary_store = store.clone();
    scheduler
        .add_hourly_job("hourly-summary", move || {
            let platform = platform.clone();
            let channel_id = channel_id.clone();
            let store = summary_store.clone();
            let config = report_config.clone();
            Box::pin(async move {
                report::send_summary(platform.as_ref(), &channel_id, &store, &config).await;
            })
        })
        .await?;

    // Heartbeat — log the live counters every hour at half past
    scheduler
        .add_cron_job("0 30 * * * *", "heartbeat", move || {
            let store = store.clone();
            Box::pin(async move {
                let snap = store.snapshot().await;
                info!(
                    "Heartbeat: App Store: {}, Play Store: {}, total {} (since {})",
                    snap.appstore,
                    snap.playstore,
                    snap.total,
                    snap.last_reset.format("%Y-%m-%d %H:%M")
                );
            })
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    #[tokio::test]
    async fn test_register_builtin_tasks() {
        let scheduler = Scheduler::new().await.unwrap();
        let platform: Arc<dyn ChatPlatform> = Arc::new(MockPlatform::default());
        register_builtin_tasks(
            &scheduler,
            platform,
            "chan".to_string(),
            CounterStore::new(),
            ReportConfig::default(),
        )
        .await
        .unwrap();
    }
}
