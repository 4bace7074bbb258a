use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown platform: {0}")]
    InvalidPlatform(String),

    #[error("profile identifier {0:?} is reserved for server-managed profiles")]
    ReservedIdentifier(String),

    #[error("payload type {0:?} is reserved for server-managed profiles")]
    ReservedPayloadType(String),

    #[error("duplicate profile name {0:?}")]
    DuplicateProfileName(String),

    #[error("duplicate profile identifier {0:?}")]
    DuplicateProfileIdentifier(String),

    #[error("commands in one batch must target a single platform")]
    MixedPlatforms,

    #[error("invalid profile: {0}")]
    InvalidProfile(String),
}
