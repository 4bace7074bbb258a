pub mod client;
pub mod error;
pub mod sync;

pub use client::{AbmClient, DeviceEntry, OAuth1Credentials, SyncPage};
pub use error::AbmError;
pub use sync::{sync_roster, ProfileUrls, SyncReport};
