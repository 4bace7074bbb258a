pub mod error;
pub mod schedule;
pub mod worker;

pub use error::WorkerError;
pub use schedule::{Schedule, ScheduleHook, RECONCILER_SCHEDULE, ROSTER_SYNC_SCHEDULE};
pub use worker::{JobDispatcher, Worker};
