use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::schedule::{Schedule, ScheduleStore};
use crate::core::status::RunOutcome;

/// Executes a scheduled prompt against the chat's task and returns the
/// final outcome. Implemented by the agent engine.
#[async_trait]
pub trait ScheduledRunner: Send + Sync {
    async fn run_scheduled(&self, chat_id: i64, prompt: String) -> RunOutcome;
}

/// Pushes scheduler output to the chat a schedule is bound to.
#[async_trait]
pub trait DeliverMessage: Send + Sync {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Polls the schedule store and fires whatever is due. A schedule is
/// advanced past `now` before its prompt runs, so one due moment fires
/// at most once even if the run is slow or crashes.
pub struct Scheduler {
    store: Arc<ScheduleStore>,
    runner: Arc<dyn ScheduledRunner>,
    transport: Arc<dyn DeliverMessage>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<ScheduleStore>,
        runner: Arc<dyn ScheduledRunner>,
        transport: Arc<dyn DeliverMessage>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            transport,
            poll_interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.poll_interval.as_secs(), "scheduler started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
    }

    /// One polling pass. Public so the firing path can be exercised
    /// with a fixed clock.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let schedules = match self.store.list().await {
            Ok(schedules) => schedules,
            Err(e) => {
                warn!(error = %e, "failed to list schedules");
                return;
            }
        };

        let mut firings = tokio::task::JoinSet::new();
        for schedule in schedules {
            if !schedule.is_due(now) {
                continue;
            }
            // Advance first. If firing fails, the schedule waits for
            // its next occurrence instead of retrying every poll.
            if let Err(e) = self.store.mark_fired(&schedule.id, now).await {
                warn!(schedule = %schedule.id, error = %e, "failed to advance schedule");
                continue;
            }
            if schedule.once
                && let Err(e) = self.store.remove(&schedule.id).await
            {
                warn!(schedule = %schedule.id, error = %e, "failed to remove one-shot schedule");
            }
            // Schedules fire concurrently; same-surface firings are
            // still serialized by the per-task run slots.
            let runner = self.runner.clone();
            let transport = self.transport.clone();
            firings.spawn(fire(runner, transport, schedule));
        }
        while firings.join_next().await.is_some() {}
    }
}

async fn fire(
    runner: Arc<dyn ScheduledRunner>,
    transport: Arc<dyn DeliverMessage>,
    schedule: Schedule,
) {
    info!(schedule = %schedule.id, name = %schedule.name, "firing schedule");
    let outcome = runner
        .run_scheduled(schedule.chat_id, schedule.prompt.clone())
        .await;

    let text = match outcome {
        RunOutcome::Completed { final_text, .. } => {
            format!("[{}]\n\n{}", schedule.name, final_text)
        }
        RunOutcome::Failed { message, .. } => {
            format!("⚠️ Schedule '{}' failed: {}", schedule.name, message)
        }
        RunOutcome::Cancelled => {
            debug!(schedule = %schedule.id, "scheduled run was pre-empted");
            return;
        }
    };
    if let Err(e) = transport.deliver(schedule.chat_id, &text).await {
        warn!(schedule = %schedule.id, error = %e, "failed to deliver schedule output");
    }
}
