//! Durable job worker: at-least-once delivery from the store-backed queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shepherd_store::{Job, Store};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const BATCH_SIZE: u32 = 10;
/// Unknown kinds re-surface after this long, so a deploy that registers the
/// handler later still drains them.
const UNKNOWN_KIND_DELAY_MINUTES: i64 = 5;

/// Dispatches one job. Returns `Ok(true)` when handled, `Ok(false)` when the
/// kind is not registered here.
pub type JobDispatcher = Arc<
    dyn Fn(Job) -> Pin<Box<dyn Future<Output = Result<bool, String>> + Send>> + Send + Sync,
>;

/// Polls the durable queue and runs registered handlers. Jobs must be
/// idempotent on `(kind, args)`: a crash between execution and completion
/// redelivers.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn Store>,
    dispatcher: JobDispatcher,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, dispatcher: JobDispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Drain everything currently due. Returns how many jobs completed.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let jobs = match self.store.due_jobs(now, BATCH_SIZE).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to poll job queue");
                return 0;
            }
        };

        let mut completed = 0;
        for job in jobs {
            let id = job.id;
            let kind = job.kind.clone();
            let retries = job.retries;
            match (self.dispatcher)(job).await {
                Ok(true) => {
                    if let Err(e) = self.store.complete_job(id).await {
                        warn!(job = %id, error = %e, "failed to complete job");
                    } else {
                        debug!(job = %id, kind = %kind, "job completed");
                        completed += 1;
                    }
                }
                Ok(false) => {
                    debug!(job = %id, kind = %kind, "no handler registered, requeued");
                    let later = now + chrono::Duration::minutes(UNKNOWN_KIND_DELAY_MINUTES);
                    if let Err(e) = self.store.retry_job(id, "no handler registered", later).await
                    {
                        warn!(job = %id, error = %e, "failed to requeue job");
                    }
                }
                Err(message) => {
                    // Exponential-ish backoff bounded at an hour.
                    let minutes = (1i64 << retries.min(6)).min(60);
                    let later = now + chrono::Duration::minutes(minutes);
                    warn!(job = %id, kind = %kind, error = %message, retry_in_minutes = minutes, "job failed");
                    if let Err(e) = self.store.retry_job(id, &message, later).await {
                        warn!(job = %id, error = %e, "failed to schedule retry");
                    }
                }
            }
        }
        completed
    }

    /// Run the polling loop until shutdown flips.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        worker.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("worker stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
