use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppleError {
    #[error("plist error: {0}")]
    Plist(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("cert auth: existing enrollment")]
    CertMismatch,

    #[error("device {0} is not MDM enrolled")]
    NotEnrolled(String),

    #[error("cert auth association missing for {0}")]
    MissingCertAssociation(String),

    #[error("APNs rejected push for device: {0}")]
    PushDeviceError(String),

    #[error("APNs transport error: {0}")]
    PushTransportError(String),

    #[error("store error: {0}")]
    Store(#[from] shepherd_store::StoreError),
}

impl From<plist::Error> for AppleError {
    fn from(e: plist::Error) -> Self {
        AppleError::Plist(e.to_string())
    }
}
