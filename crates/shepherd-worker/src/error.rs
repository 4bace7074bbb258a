use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] shepherd_store::StoreError),

    #[error("schedule {0} is gone")]
    ScheduleGone(String),

    #[error("job failed: {0}")]
    Job(String),
}
