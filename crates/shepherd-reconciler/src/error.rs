use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] shepherd_store::StoreError),

    #[error("apple protocol error: {0}")]
    Apple(#[from] shepherd_apple::AppleError),

    #[error("windows protocol error: {0}")]
    Windows(#[from] shepherd_windows::WindowsError),

    #[error("PKI error: {0}")]
    Pki(#[from] shepherd_pki::PkiError),

    #[error("no preassigned profiles for {0}")]
    NoPreassignedProfiles(String),

    #[error("host {0} is not MDM enrolled")]
    HostNotEnrolled(String),

    #[error("internal error: {0}")]
    Internal(String),
}
