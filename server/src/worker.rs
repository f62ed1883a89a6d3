//! Background sync loop.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::drain::DrainOutcome;
use crate::service::DataService;

/// Shortest wait before a backed-off item is retried.
const MIN_RETRY_WAIT: Duration = Duration::from_millis(25);

/// Drains the queue when the remote becomes reachable, after local writes,
/// when a backed-off item comes due and on a fixed interval. Also runs the
/// remote heartbeat and tombstone collection.
pub struct SyncWorker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncWorker {
    pub(crate) fn spawn(service: DataService) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(service, rx));
        Self { shutdown, task }
    }

    /// Stop after the current step and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "sync worker panicked");
        }
    }
}

async fn run(service: DataService, mut shutdown: watch::Receiver<bool>) {
    let config = service.config().clone();
    let mut connection = service.connection().subscribe();

    let mut drain_tick = interval(config.drain_interval);
    drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut gc_tick = interval(config.gc_interval);
    gc_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("sync worker started");

    loop {
        let retry_wait = next_retry_wait(&service);

        tokio::select! {
            _ = shutdown.changed() => break,
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let can_sync = connection.borrow_and_update().can_sync();
                if can_sync {
                    drain_all(&service).await;
                }
            }
            _ = service.tiers.wakeup.notified() => drain_all(&service).await,
            _ = drain_tick.tick() => drain_all(&service).await,
            _ = sleep_for(retry_wait) => drain_all(&service).await,
            _ = heartbeat.tick() => {
                service.check_remote().await;
            }
            _ = gc_tick.tick() => {
                if let Err(err) = service.collect_garbage().await {
                    tracing::error!(error = %err, "tombstone collection failed");
                }
            }
        }
    }

    tracing::info!("sync worker stopped");
}

/// Time until the earliest backed-off item is due, while sync is possible.
fn next_retry_wait(service: &DataService) -> Option<Duration> {
    if !service.connection().state().can_sync() {
        return None;
    }
    let due_at = service.tiers.queue().next_due_at()?;
    let wait = due_at.saturating_sub(service.tiers.now());
    Some(Duration::from_millis(wait).max(MIN_RETRY_WAIT))
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

async fn drain_all(service: &DataService) {
    if !service.connection().state().can_sync() {
        return;
    }
    let outcomes: Vec<DrainOutcome> = service.drain().collect().await;
    if outcomes.is_empty() {
        return;
    }

    let confirmed = outcomes.iter().filter(|o| o.is_confirmed()).count();
    let dead_lettered = outcomes
        .iter()
        .filter(|o| matches!(o, DrainOutcome::DeadLettered { .. }))
        .count();
    tracing::info!(
        sent = outcomes.len(),
        confirmed,
        dead_lettered,
        pending = service.tiers.queue().len(),
        "drain finished"
    );
}
