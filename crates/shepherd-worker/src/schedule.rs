//! Named periodic schedules with single-trigger-at-a-time discipline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::WorkerError;

/// Drives the ABM roster sync (C5).
pub const ROSTER_SYNC_SCHEDULE: &str = "dep_roster_sync";

/// Drives the profile reconciler (C7).
pub const RECONCILER_SCHEDULE: &str = "profile_reconciler";

type ScheduleJob =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// Fired after every run with `(schedule_name, outcome)`. Used by tests and
/// for chaining.
pub type ScheduleHook = Arc<dyn Fn(&str, &Result<String, String>) + Send + Sync>;

struct Inner {
    name: String,
    interval: Duration,
    job: ScheduleJob,
    hook: Option<ScheduleHook>,
    /// Present while a run is in flight; late triggers subscribe instead of
    /// starting a second run.
    current: Mutex<Option<watch::Receiver<Option<Result<String, String>>>>>,
}

/// A named periodic schedule. `trigger` collapses concurrent callers onto a
/// single run; the periodic loop goes through `trigger` too, so an operator
/// trigger and a tick can never race into two runs.
#[derive(Clone)]
pub struct Schedule {
    inner: Arc<Inner>,
}

impl Schedule {
    pub fn new<F, Fut>(name: &str, interval: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                interval,
                job: Arc::new(move || Box::pin(job())),
                hook: None,
                current: Mutex::new(None),
            }),
        }
    }

    pub fn with_hook(mut self, hook: ScheduleHook) -> Self {
        let inner = Arc::get_mut(&mut self.inner);
        match inner {
            Some(inner) => inner.hook = Some(hook),
            None => warn!("with_hook called on a shared schedule; hook ignored"),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run now (or join the in-flight run) and return its outcome.
    pub async fn trigger(&self) -> Result<String, WorkerError> {
        let mut rx = {
            let mut current = self.inner.current.lock().await;
            match current.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *current = Some(rx.clone());
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        info!(schedule = %inner.name, "run started");
                        let outcome = (inner.job)().await;
                        match &outcome {
                            Ok(summary) => {
                                info!(schedule = %inner.name, summary = %summary, "run finished")
                            }
                            Err(e) => warn!(schedule = %inner.name, error = %e, "run failed"),
                        }
                        if let Some(hook) = &inner.hook {
                            hook(&inner.name, &outcome);
                        }
                        *inner.current.lock().await = None;
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome.map_err(WorkerError::Job);
            }
            if rx.changed().await.is_err() {
                return Err(WorkerError::ScheduleGone(self.inner.name.clone()));
            }
        }
    }

    /// Start the periodic loop. Cancellation is cooperative through the
    /// shutdown channel.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let schedule = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(schedule.inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = schedule.trigger().await {
                            warn!(schedule = %schedule.inner.name, error = %e, "scheduled run failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(schedule = %schedule.inner.name, "schedule stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_triggers_collapse_to_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let schedule = Schedule::new("test", Duration::from_secs(3600), move || {
            let runs = runs_clone.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("done".to_string())
            }
        });

        let (a, b) = tokio::join!(schedule.trigger(), schedule.trigger());
        assert_eq!(a.unwrap(), "done");
        assert_eq!(b.unwrap(), "done");
        assert_eq!(runs.load(Ordering::SeqCst), 1, "both callers share one run");
    }

    #[tokio::test]
    async fn sequential_triggers_run_again() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let schedule = Schedule::new("test", Duration::from_secs(3600), move || {
            let runs = runs_clone.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            }
        });
        schedule.trigger().await.unwrap();
        schedule.trigger().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hook_fires_on_completion() {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_clone = hook_calls.clone();
        let schedule = Schedule::new("hooked", Duration::from_secs(3600), || async {
            Ok("ok".to_string())
        })
        .with_hook(Arc::new(move |name, outcome| {
            assert_eq!(name, "hooked");
            assert!(outcome.is_ok());
            hook_clone.fetch_add(1, Ordering::SeqCst);
        }));
        schedule.trigger().await.unwrap();
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_run_propagates_to_all_waiters() {
        let schedule = Schedule::new("failing", Duration::from_secs(3600), || async {
            Err("boom".to_string())
        });
        let (a, b) = tokio::join!(schedule.trigger(), schedule.trigger());
        assert!(matches!(a, Err(WorkerError::Job(ref m)) if m == "boom"));
        assert!(matches!(b, Err(WorkerError::Job(ref m)) if m == "boom"));
    }
}
