pub mod apns;
pub mod checkin;
pub mod commands;
pub mod enroll_profile;
pub mod error;
pub mod service;

pub use apns::{ApnsClient, ApnsCredentialCache, PushOutcome, PushTarget};
pub use checkin::{CheckinMessage, CommandReport};
pub use error::AppleError;
pub use service::{process_checkin, process_command_report, CheckinOutcome, ReportOutcome};

/// MIME type of MDM check-in requests.
pub const CHECKIN_CONTENT_TYPE: &str = "application/x-apple-aspen-mdm-checkin";

/// MIME type of the served enrollment profile.
pub const ENROLL_PROFILE_CONTENT_TYPE: &str = "application/x-apple-aspen-config";
