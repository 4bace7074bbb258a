pub mod error;
pub mod state;
pub mod store;
pub mod memory;
pub mod redb_store;

pub use error::StoreError;
pub use state::{compute_checksum, Activity, HostSeed, InstalledProfiles, Job};
pub use store::Store;
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;
