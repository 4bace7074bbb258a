use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Internal host identifier, assigned by the store on first sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub u64);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TeamId(pub u64);

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Platform ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Darwin,
    Windows,
    Linux,
}

impl Platform {
    /// Which MDM protocol manages this platform, if any.
    pub fn mdm_protocol(&self) -> Option<MdmProtocol> {
        match self {
            Platform::Darwin => Some(MdmProtocol::Apple),
            Platform::Windows => Some(MdmProtocol::Windows),
            Platform::Linux => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, crate::DomainError> {
        match s {
            "darwin" | "macos" | "ios" => Ok(Platform::Darwin),
            "windows" => Ok(Platform::Windows),
            "linux" => Ok(Platform::Linux),
            other => Err(crate::DomainError::InvalidPlatform(other.to_string())),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Darwin => write!(f, "darwin"),
            Platform::Windows => write!(f, "windows"),
            Platform::Linux => write!(f, "linux"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdmProtocol {
    Apple,
    Windows,
}

impl std::fmt::Display for MdmProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MdmProtocol::Apple => write!(f, "apple"),
            MdmProtocol::Windows => write!(f, "windows"),
        }
    }
}

// ── Host ──────────────────────────────────────────────────────────────────────

/// A managed device as known to the inventory. The MDM subsystem correlates
/// enrollments to hosts by `uuid` (Apple) or lazily by hardware id (Windows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    /// Hardware UUID as reported by the device firmware.
    pub uuid: String,
    /// Hardware serial number.
    pub serial: String,
    pub hostname: String,
    pub platform: Platform,
    /// None means the host belongs to the "no team" scope.
    pub team_id: Option<TeamId>,
    /// Agent authentication key.
    pub node_key: Option<String>,
    /// Agent-updater authentication key.
    pub orbit_node_key: Option<String>,
    /// Server hardware is excluded from MDM migration.
    pub is_server: bool,
    /// While set and in the future, MDM migration webhooks are suppressed and
    /// the agent is asked to refetch critical queries early.
    pub refetch_critical_queries_until: Option<DateTime<Utc>>,
}

// ── Teams ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub enroll_secret: String,
    pub enable_disk_encryption: bool,
    pub macos_updates: Option<NudgeConfig>,
}

/// macOS updates settings, surfaced to the agent-updater as a nudge config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NudgeConfig {
    pub minimum_version: String,
    /// Date the user can no longer defer the update, `YYYY-MM-DD`.
    pub deadline: String,
}

// ── Org-wide mutable settings ─────────────────────────────────────────────────

/// Operator-mutable settings (PATCH /config). Distinct from the static server
/// configuration loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgSettings {
    pub apple_mdm_enabled: bool,
    pub windows_mdm_enabled: bool,
    /// Disk-encryption enforcement for the no-team scope.
    pub enable_disk_encryption: bool,
    /// Enroll secret for the no-team scope.
    pub enroll_secret: String,
    /// Gate the setup assistant behind IdP authentication.
    pub end_user_auth_enabled: bool,
    /// Team newly ABM-synced devices land in. None means no team.
    pub apple_bm_default_team: Option<TeamId>,
    pub macos_updates: Option<NudgeConfig>,
    /// Outbound webhook invoked by the MDM migration flow.
    pub mdm_migration_webhook_url: Option<String>,
    /// Opaque capability for the enrollment-profile download. Generated at
    /// startup; validated by lookup.
    #[serde(default)]
    pub enroll_profile_token: String,
}

impl Default for OrgSettings {
    fn default() -> Self {
        Self {
            apple_mdm_enabled: false,
            windows_mdm_enabled: false,
            enable_disk_encryption: false,
            enroll_secret: String::new(),
            end_user_auth_enabled: false,
            apple_bm_default_team: None,
            macos_updates: None,
            mdm_migration_webhook_url: None,
            enroll_profile_token: String::new(),
        }
    }
}

// ── Apple enrollment ──────────────────────────────────────────────────────────

/// Apple MDM enrollment state for one device.
///
/// Created on the first `Authenticate`; activated by the first `TokenUpdate`;
/// soft-disabled on `CheckOut`. Hard deletion happens only through the
/// administrative path. The cert-auth association is written in the same
/// store transaction as the enrollment row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppleEnrollment {
    pub device_uuid: String,
    pub push_token: String,
    pub push_magic: String,
    pub unlock_token: Option<String>,
    /// Base64 bootstrap token escrowed by the device.
    pub bootstrap_token: Option<String>,
    /// SHA-256 fingerprint of the SCEP-issued identity certificate. Every
    /// subsequent check-in must present a matching certificate.
    pub cert_fingerprint: Option<String>,
    /// Binds the enrollment to an IdP user for the SSO-gated flow.
    pub enrollment_reference: Option<String>,
    /// Cleared on CheckOut, restored on re-Authenticate.
    pub enabled: bool,
    /// Set once the first TokenUpdate lands; push is possible from then on.
    pub active: bool,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// ── Windows enrollment ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowsEnrollType {
    /// Agent-driven enrollment using the updater node key.
    Programmatic,
    /// Azure-AD joined automatic enrollment.
    Automatic,
}

impl std::fmt::Display for WindowsEnrollType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowsEnrollType::Programmatic => write!(f, "programmatic"),
            WindowsEnrollType::Automatic => write!(f, "automatic"),
        }
    }
}

/// Windows MDM enrollment, created during the WSTEP exchange and hard-deleted
/// when the device posts the SyncML unenroll alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowsEnrollment {
    pub mdm_device_id: String,
    pub hardware_id: String,
    pub device_name: String,
    pub enroll_type: WindowsEnrollType,
    pub os_version: String,
    pub not_in_oobe: bool,
    /// Correlated lazily; null until the enrollment is matched to a host.
    pub host_uuid: Option<String>,
    pub cert_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Profiles ──────────────────────────────────────────────────────────────────

/// Identifier of the server-managed disk-encryption escrow profile.
pub const DISK_ENCRYPTION_PROFILE_IDENTIFIER: &str = "com.shepherd.mdm.disk-encryption";

/// Identifier of the server-managed agent configuration profile (carries the
/// scope's enroll secret and the server URL).
pub const AGENT_CONFIG_PROFILE_IDENTIFIER: &str = "com.shepherd.mdm.agent-config";

/// Identifiers a user-supplied profile may never use.
pub const RESERVED_PROFILE_IDENTIFIERS: &[&str] = &[
    DISK_ENCRYPTION_PROFILE_IDENTIFIER,
    AGENT_CONFIG_PROFILE_IDENTIFIER,
];

/// Apple payload types reserved for the server-managed escrow profile.
pub const RESERVED_PAYLOAD_TYPES: &[&str] = &[
    "com.apple.security.FDERecoveryKeyEscrow",
    "com.apple.MCX.FileVault2",
];

/// A configuration profile scoped to a team (or no-team). The payload is the
/// raw wire form: a mobileconfig plist for Apple, a SyncML fragment for
/// Windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub identifier: String,
    pub name: String,
    pub platform: Platform,
    pub team_id: Option<TeamId>,
    pub payload: Vec<u8>,
    /// SHA-256 hex of the payload; drives drift detection in the reconciler.
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
}

impl Profile {
    pub fn is_reserved_identifier(identifier: &str) -> bool {
        RESERVED_PROFILE_IDENTIFIERS.contains(&identifier)
    }
}

// ── Host profile state ────────────────────────────────────────────────────────

pub const MAX_PROFILE_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileOperation {
    Install,
    Remove,
}

impl std::fmt::Display for ProfileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileOperation::Install => write!(f, "install"),
            ProfileOperation::Remove => write!(f, "remove"),
        }
    }
}

/// Delivery status of one (host, profile) pair.
///
/// Transitions:
///   Pending → Verifying (command issued)
///   Verifying → Verified (observation confirms the operation)
///   Verifying → Pending (grace expired, profile missing, retry left)
///   Verifying | Pending → Failed (retries exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    Pending,
    Verifying,
    Verified,
    Failed,
}

impl std::fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProfileStatus::Pending => "pending",
            ProfileStatus::Verifying => "verifying",
            ProfileStatus::Verified => "verified",
            ProfileStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// The source of truth for reconciliation: one row per (host, profile
/// identifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    pub host_uuid: String,
    pub profile_identifier: String,
    pub profile_name: String,
    pub platform: Platform,
    pub operation: ProfileOperation,
    pub status: ProfileStatus,
    pub command_uuid: Option<String>,
    pub retries: u32,
    pub checksum: String,
    /// Human-readable failure detail (first device error chain).
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// A raw MDM command bound for one device. `payload` is the wire form (plist
/// for Apple, SyncML for Windows); `request_type` is extracted at enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_uuid: String,
    pub device_uuid: String,
    pub platform: Platform,
    pub request_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_uuid: String,
    pub device_uuid: String,
    /// Protocol status: Acknowledged/Error for Apple, the numeric code for
    /// Windows.
    pub status: String,
    pub payload: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

// ── ABM / DEP ─────────────────────────────────────────────────────────────────

/// Tracks which ABM-sourced device has been registered against which
/// automatic-enrollment profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepAssignment {
    pub serial_number: String,
    pub profile_uuid: Option<String>,
    pub team_id: Option<TeamId>,
    pub added_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

// ── Per-scope artifacts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPackage {
    pub team_id: Option<TeamId>,
    pub name: String,
    /// SHA-256 hex of `payload`, rendered into the InstallEnterpriseApplication
    /// manifest.
    pub sha256: String,
    /// Download capability; validated by lookup.
    pub token: String,
    pub payload: Vec<u8>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eula {
    pub team_id: Option<TeamId>,
    pub name: String,
    pub token: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupAssistant {
    pub team_id: Option<TeamId>,
    pub name: String,
    /// Operator-supplied automatic-enrollment profile JSON. The server owns
    /// `url` and `configuration_web_url`; they may not appear here.
    pub profile: serde_json::Value,
    /// Profile UUID returned by ABM once registered.
    pub profile_uuid: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

// ── Disk-encryption escrow ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decryptable {
    Yes,
    No,
    Unknown,
}

/// Escrowed recovery key for one host. A stored ciphertext and a stored
/// client error are mutually exclusive; the constructors maintain that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEncryptionKey {
    pub host_id: HostId,
    /// Envelope ciphertext under the platform CA certificate.
    pub encrypted: Option<Vec<u8>>,
    pub client_error: Option<String>,
    pub decryptable: Decryptable,
    pub updated_at: DateTime<Utc>,
}

impl DiskEncryptionKey {
    /// Store a freshly escrowed ciphertext: clears any client error and resets
    /// decryptability to unknown.
    pub fn with_key(host_id: HostId, encrypted: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            host_id,
            encrypted: Some(encrypted),
            client_error: None,
            decryptable: Decryptable::Unknown,
            updated_at: now,
        }
    }

    /// Record a client-side escrow failure: clears any stored ciphertext.
    pub fn with_client_error(host_id: HostId, error: String, now: DateTime<Utc>) -> Self {
        Self {
            host_id,
            encrypted: None,
            client_error: Some(error),
            decryptable: Decryptable::Unknown,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    RotateKey,
    LogOut,
}

/// User-visible disk-encryption status for a host, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiskEncryptionStatus {
    Failed { detail: String },
    Enforcing,
    ActionRequired { action: RequiredAction },
    Verified,
}

// ── Preassign / match ─────────────────────────────────────────────────────────

/// Transient buffer row for the profile match flow. Garbage-collected on a
/// TTL; callers are not assumed to clean up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreassignedProfile {
    pub external_host_id: String,
    pub host_uuid: String,
    pub profile_identifier: String,
    pub profile_name: String,
    pub payload: Vec<u8>,
    pub group_label: Option<String>,
    /// Excluded entries shape the derived team name but contribute no profile.
    pub exclude: bool,
    pub created_at: DateTime<Utc>,
}

// ── SSO / IdP ─────────────────────────────────────────────────────────────────

/// IdP account seen during the SSO-gated enrollment flow. The enrollment
/// reference is stable per subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpAccount {
    pub subject: String,
    pub username: String,
    pub fullname: String,
    pub enrollment_reference: String,
}
