pub mod tasks;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, Timelike};
use futures::FutureExt;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};

const HOUR: Duration = Duration::from_secs(60 * 60);

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wait before the first hourly firing so that it lands on the next `:00`.
/// Seconds are ignored, and a start exactly on the hour waits the full hour.
pub fn initial_delay(now: &impl Timelike) -> Duration {
    Duration::from_secs(u64::from(60 - now.minute()) * 60)
}

/// Wrapper around tokio-cron-scheduler for background tasks
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Create a new scheduler
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Add a recurring cron job
    pub async fn add_cron_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                info!("Running scheduled task: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Failed to create cron job: {}", name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled task '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    /// Add a job that first fires at the next top of the hour and then every
    /// hour after that. Missed firings are not made up.
    pub async fn add_hourly_job<F>(&self, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        self.add_aligned_job(name, initial_delay(&Local::now()), HOUR, task)
            .await
    }

    /// Add a job that fires once after `delay`, then every `period`.
    /// The repeated job is registered at the first firing, so the period is
    /// measured from that boundary.
    pub async fn add_aligned_job<F>(
        &self,
        name: &str,
        delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<()>
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let job_name = name.to_string();

        let first = Job::new_one_shot_async(delay, move |_uuid, scheduler| {
            let name = job_name.clone();
            let task = task.clone();
            Box::pin(async move {
                match repeating_job(name.clone(), period, task.clone()) {
                    Ok(job) => {
                        if let Err(e) = scheduler.add(job).await {
                            error!("Failed to add repeating job '{}': {}", name, e);
                        }
                    }
                    Err(e) => error!("Failed to create repeating job '{}': {}", name, e),
                }
                fire(&name, task.as_ref()).await;
            })
        })
        .with_context(|| format!("Failed to create job: {}", name))?;

        self.inner
            .add(first)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!(
            "Scheduled task '{}' every {:?}, first run in {:?}",
            name, period, delay
        );
        Ok(())
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    /// Shutdown the scheduler
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

fn repeating_job<F>(name: String, period: Duration, task: Arc<F>) -> Result<Job, JobSchedulerError>
where
    F: Fn() -> TaskFuture + Send + Sync + 'static,
{
    Job::new_repeated_async(period, move |_uuid, _lock| {
        let name = name.clone();
        let task = task.clone();
        Box::pin(async move {
            fire(&name, task.as_ref()).await;
        })
    })
}

/// Run one firing. A panicking task is logged and the schedule carries on.
async fn fire<F>(name: &str, task: &F)
where
    F: Fn() -> TaskFuture + Send + Sync + 'static,
{
    info!("Running scheduled task: {}", name);
    if AssertUnwindSafe(async { task().await })
        .catch_unwind()
        .await
        .is_err()
    {
        error!("Scheduled task '{}' panicked", name);
    }
}
