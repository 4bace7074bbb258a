pub mod error;
pub mod types;


pub use error::DomainError;
pub use types::{
    AppleEnrollment, BootstrapPackage, Command, CommandResult, Decryptable, DepAssignment,
    DiskEncryptionKey, DiskEncryptionStatus, Eula, Host, HostId, HostProfile, IdpAccount,
    MdmProtocol, NudgeConfig, OrgSettings, Platform, PreassignedProfile, Profile,
    ProfileOperation, ProfileStatus, RequiredAction, SetupAssistant, Team, TeamId,
    WindowsEnrollType, WindowsEnrollment, AGENT_CONFIG_PROFILE_IDENTIFIER,
    DISK_ENCRYPTION_PROFILE_IDENTIFIER, MAX_PROFILE_RETRIES, RESERVED_PAYLOAD_TYPES,
    RESERVED_PROFILE_IDENTIFIERS,
};
