pub mod enrollment;
pub mod error;
pub mod escrow;
pub mod match_flow;
pub mod observe;
pub mod reconcile;
pub mod report;

pub use error::ReconcileError;
pub use reconcile::{reconcile, ReconcileParams, VERIFICATION_GRACE_HOURS};
pub use report::{Change, ReconcileReport};
