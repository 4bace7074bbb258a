use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shepherd_domain::{
    AppleEnrollment, BootstrapPackage, Command, CommandResult, Decryptable, DepAssignment,
    DiskEncryptionKey, Eula, Host, HostId, HostProfile, IdpAccount, PreassignedProfile, Profile,
    SetupAssistant, Team, TeamId, WindowsEnrollment,
};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{Activity, HostSeed, InstalledProfiles, Job};

/// The persistence contract. All cross-component state lives behind this
/// trait; records reference each other by stable identifier only.
///
/// Implementations must provide two non-obvious guarantees:
/// - `bulk_upsert_host_profiles` is atomic per call, so the reconciler never
///   observes a partial desired-state set.
/// - `delete_profile` (and the implicit deletions inside `replace_profiles`)
///   cascades to the matching host rows, flipping them to a pending remove.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Hosts ─────────────────────────────────────────────────────────────────

    /// Find-or-create by hardware identity; refreshes hostname and platform.
    async fn upsert_host(&self, seed: &HostSeed) -> Result<Host, StoreError>;
    async fn get_host(&self, id: HostId) -> Result<Option<Host>, StoreError>;
    async fn get_host_by_uuid(&self, uuid: &str) -> Result<Option<Host>, StoreError>;
    async fn get_host_by_serial(&self, serial: &str) -> Result<Option<Host>, StoreError>;
    async fn get_host_by_orbit_node_key(&self, key: &str) -> Result<Option<Host>, StoreError>;
    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError>;
    async fn set_host_team(&self, id: HostId, team_id: Option<TeamId>) -> Result<(), StoreError>;
    async fn set_host_node_keys(
        &self,
        id: HostId,
        node_key: Option<String>,
        orbit_node_key: Option<String>,
    ) -> Result<(), StoreError>;
    async fn set_host_refetch_until(
        &self,
        id: HostId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    /// Cascades to enrollments, host profile rows, commands, keys.
    async fn delete_host(&self, id: HostId) -> Result<(), StoreError>;

    // ── Teams ─────────────────────────────────────────────────────────────────

    async fn create_team(&self, name: &str) -> Result<Team, StoreError>;
    async fn get_team(&self, id: TeamId) -> Result<Option<Team>, StoreError>;
    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>, StoreError>;
    async fn list_teams(&self) -> Result<Vec<Team>, StoreError>;
    async fn update_team(&self, team: &Team) -> Result<(), StoreError>;

    // ── Org settings ──────────────────────────────────────────────────────────

    async fn get_settings(&self) -> Result<shepherd_domain::OrgSettings, StoreError>;
    async fn put_settings(&self, settings: &shepherd_domain::OrgSettings)
        -> Result<(), StoreError>;

    // ── Apple enrollments ─────────────────────────────────────────────────────

    async fn upsert_apple_enrollment(&self, e: &AppleEnrollment) -> Result<(), StoreError>;
    async fn get_apple_enrollment(
        &self,
        device_uuid: &str,
    ) -> Result<Option<AppleEnrollment>, StoreError>;
    async fn list_apple_enrollments(&self) -> Result<Vec<AppleEnrollment>, StoreError>;
    async fn delete_apple_enrollment(&self, device_uuid: &str) -> Result<(), StoreError>;

    // ── Windows enrollments ───────────────────────────────────────────────────

    async fn upsert_windows_enrollment(&self, e: &WindowsEnrollment) -> Result<(), StoreError>;
    async fn get_windows_enrollment(
        &self,
        mdm_device_id: &str,
    ) -> Result<Option<WindowsEnrollment>, StoreError>;
    async fn get_windows_enrollment_by_host_uuid(
        &self,
        host_uuid: &str,
    ) -> Result<Option<WindowsEnrollment>, StoreError>;
    async fn list_windows_enrollments(&self) -> Result<Vec<WindowsEnrollment>, StoreError>;
    async fn delete_windows_enrollment(&self, mdm_device_id: &str) -> Result<(), StoreError>;

    // ── Profiles (desired state) ──────────────────────────────────────────────

    /// Replace every non-reserved profile in the scope with `profiles`.
    /// Identifiers dropped by the replacement cascade like `delete_profile`.
    async fn replace_profiles(
        &self,
        team_id: Option<TeamId>,
        profiles: &[Profile],
    ) -> Result<(), StoreError>;
    /// Internal path, also used for server-managed profiles.
    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError>;
    async fn get_profile(
        &self,
        team_id: Option<TeamId>,
        identifier: &str,
    ) -> Result<Option<Profile>, StoreError>;
    async fn list_profiles(&self, team_id: Option<TeamId>) -> Result<Vec<Profile>, StoreError>;
    async fn delete_profile(
        &self,
        team_id: Option<TeamId>,
        identifier: &str,
    ) -> Result<(), StoreError>;

    // ── Host profile state ────────────────────────────────────────────────────

    /// Atomic: either all rows land or none do.
    async fn bulk_upsert_host_profiles(&self, rows: &[HostProfile]) -> Result<(), StoreError>;
    async fn list_host_profiles(&self, host_uuid: &str) -> Result<Vec<HostProfile>, StoreError>;
    async fn get_host_profile(
        &self,
        host_uuid: &str,
        identifier: &str,
    ) -> Result<Option<HostProfile>, StoreError>;
    async fn get_host_profile_by_command(
        &self,
        command_uuid: &str,
    ) -> Result<Option<HostProfile>, StoreError>;
    async fn delete_host_profile(
        &self,
        host_uuid: &str,
        identifier: &str,
    ) -> Result<(), StoreError>;
    async fn list_all_host_profiles(&self) -> Result<Vec<HostProfile>, StoreError>;

    // ── Command pipeline ──────────────────────────────────────────────────────

    /// Fails with `DuplicateCommand` when `(command_uuid, device_uuid)` was
    /// already enqueued; the same command may fan out to several devices.
    async fn enqueue_command(&self, cmd: &Command) -> Result<(), StoreError>;
    /// Next command in enqueue order that has no result from this device.
    async fn next_pending_command(
        &self,
        device_uuid: &str,
    ) -> Result<Option<Command>, StoreError>;
    /// Idempotent on `(command_uuid, device_uuid)`.
    async fn record_command_result(&self, result: &CommandResult) -> Result<(), StoreError>;
    async fn get_command(&self, command_uuid: &str) -> Result<Option<Command>, StoreError>;
    async fn list_commands(&self, device_uuid: Option<&str>) -> Result<Vec<Command>, StoreError>;
    async fn get_command_results(
        &self,
        command_uuid: &str,
    ) -> Result<Vec<CommandResult>, StoreError>;

    // ── ABM / DEP ─────────────────────────────────────────────────────────────

    async fn upsert_dep_assignment(&self, assignment: &DepAssignment) -> Result<(), StoreError>;
    async fn get_dep_assignment(
        &self,
        serial: &str,
    ) -> Result<Option<DepAssignment>, StoreError>;
    async fn list_dep_assignments(&self) -> Result<Vec<DepAssignment>, StoreError>;
    async fn get_dep_cursor(&self) -> Result<Option<String>, StoreError>;
    async fn put_dep_cursor(&self, cursor: &str) -> Result<(), StoreError>;
    async fn set_abm_terms_expired(&self, expired: bool) -> Result<(), StoreError>;
    async fn abm_terms_expired(&self) -> Result<bool, StoreError>;

    // ── Per-scope artifacts ───────────────────────────────────────────────────

    async fn put_bootstrap_package(&self, pkg: &BootstrapPackage) -> Result<(), StoreError>;
    async fn get_bootstrap_package(
        &self,
        team_id: Option<TeamId>,
    ) -> Result<Option<BootstrapPackage>, StoreError>;
    async fn get_bootstrap_package_by_token(
        &self,
        token: &str,
    ) -> Result<Option<BootstrapPackage>, StoreError>;
    async fn delete_bootstrap_package(&self, team_id: Option<TeamId>) -> Result<(), StoreError>;

    /// Fails with `EulaExists` when the scope already has one.
    async fn put_eula(&self, eula: &Eula) -> Result<(), StoreError>;
    async fn get_eula(&self, team_id: Option<TeamId>) -> Result<Option<Eula>, StoreError>;
    async fn get_eula_by_token(&self, token: &str) -> Result<Option<Eula>, StoreError>;
    async fn delete_eula(&self, token: &str) -> Result<(), StoreError>;

    async fn put_setup_assistant(&self, sa: &SetupAssistant) -> Result<(), StoreError>;
    async fn get_setup_assistant(
        &self,
        team_id: Option<TeamId>,
    ) -> Result<Option<SetupAssistant>, StoreError>;
    async fn delete_setup_assistant(&self, team_id: Option<TeamId>) -> Result<(), StoreError>;

    // ── Disk-encryption escrow ────────────────────────────────────────────────

    async fn put_disk_encryption_key(&self, key: &DiskEncryptionKey) -> Result<(), StoreError>;
    async fn get_disk_encryption_key(
        &self,
        host_id: HostId,
    ) -> Result<Option<DiskEncryptionKey>, StoreError>;
    async fn set_decryptable(
        &self,
        host_id: HostId,
        decryptable: Decryptable,
    ) -> Result<(), StoreError>;
    async fn list_disk_encryption_keys(&self) -> Result<Vec<DiskEncryptionKey>, StoreError>;

    // ── Preassign / match buffer ──────────────────────────────────────────────

    async fn add_preassigned_profile(&self, p: &PreassignedProfile) -> Result<(), StoreError>;
    async fn list_preassigned_profiles(
        &self,
        external_host_id: &str,
    ) -> Result<Vec<PreassignedProfile>, StoreError>;
    async fn delete_preassigned_profiles(&self, external_host_id: &str)
        -> Result<(), StoreError>;
    /// Drop rows older than the cutoff; returns how many were removed.
    async fn gc_preassigned_profiles(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── IdP accounts ──────────────────────────────────────────────────────────

    /// Find-or-create by subject; the enrollment reference is stable across
    /// calls for the same subject.
    async fn upsert_idp_account(&self, account: &IdpAccount) -> Result<IdpAccount, StoreError>;
    async fn get_idp_account_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<IdpAccount>, StoreError>;

    // ── Durable jobs ──────────────────────────────────────────────────────────

    async fn enqueue_job(
        &self,
        kind: &str,
        args: Value,
        not_before: DateTime<Utc>,
    ) -> Result<Job, StoreError>;
    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError>;
    async fn complete_job(&self, id: Uuid) -> Result<(), StoreError>;
    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        not_before: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Activities ────────────────────────────────────────────────────────────

    async fn append_activity(&self, activity: &Activity) -> Result<(), StoreError>;
    async fn list_activities(&self, limit: u32) -> Result<Vec<Activity>, StoreError>;

    // ── Installed-profile observations ────────────────────────────────────────

    async fn put_installed_profiles(&self, obs: &InstalledProfiles) -> Result<(), StoreError>;
    async fn get_installed_profiles(
        &self,
        host_uuid: &str,
    ) -> Result<Option<InstalledProfiles>, StoreError>;
}
