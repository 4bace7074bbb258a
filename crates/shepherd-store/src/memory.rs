use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shepherd_domain::{
    AppleEnrollment, BootstrapPackage, Command, CommandResult, Decryptable, DepAssignment,
    DiskEncryptionKey, Eula, Host, HostId, HostProfile, IdpAccount, OrgSettings,
    PreassignedProfile, Profile, ProfileOperation, ProfileStatus, SetupAssistant, Team, TeamId,
    WindowsEnrollment,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{Activity, HostSeed, InstalledProfiles, Job};
use crate::store::Store;

#[derive(Debug, Default)]
struct Inner {
    next_host_id: u64,
    next_team_id: u64,
    next_command_seq: u64,
    hosts: HashMap<u64, Host>,
    teams: HashMap<u64, Team>,
    settings: Option<OrgSettings>,
    apple_enrollments: HashMap<String, AppleEnrollment>,
    windows_enrollments: HashMap<String, WindowsEnrollment>,
    /// Keyed by (scope, identifier).
    profiles: HashMap<(Option<TeamId>, String), Profile>,
    /// Keyed by (host_uuid, identifier).
    host_profiles: HashMap<(String, String), HostProfile>,
    /// Enqueue order is the map order.
    commands: BTreeMap<u64, Command>,
    /// Keyed by (command_uuid, device_uuid): one command may fan out to
    /// several devices.
    command_seq_by_uuid: HashMap<(String, String), u64>,
    /// Keyed by (command_uuid, device_uuid).
    command_results: HashMap<(String, String), CommandResult>,
    dep_assignments: HashMap<String, DepAssignment>,
    dep_cursor: Option<String>,
    abm_terms_expired: bool,
    bootstrap_packages: HashMap<Option<TeamId>, BootstrapPackage>,
    eulas: HashMap<Option<TeamId>, Eula>,
    setup_assistants: HashMap<Option<TeamId>, SetupAssistant>,
    disk_keys: HashMap<u64, DiskEncryptionKey>,
    /// Keyed by external_host_id.
    preassigned: HashMap<String, Vec<PreassignedProfile>>,
    /// Keyed by IdP subject.
    idp_accounts: HashMap<String, IdpAccount>,
    jobs: HashMap<Uuid, Job>,
    activities: Vec<Activity>,
    installed_profiles: HashMap<String, InstalledProfiles>,
}

impl Inner {
    /// Profile deletion cascade: flip matching install rows to a pending
    /// remove so the next reconcile pass cleans the device up.
    fn cascade_profile_delete(&mut self, team_id: Option<TeamId>, identifier: &str) {
        let scope_hosts: Vec<String> = self
            .hosts
            .values()
            .filter(|h| h.team_id == team_id)
            .map(|h| h.uuid.clone())
            .collect();
        for (key, row) in self.host_profiles.iter_mut() {
            if key.1 != identifier || !scope_hosts.contains(&key.0) {
                continue;
            }
            if row.operation == ProfileOperation::Install && row.status != ProfileStatus::Failed {
                row.operation = ProfileOperation::Remove;
                row.status = ProfileStatus::Pending;
                row.command_uuid = None;
                row.retries = 0;
                row.detail = None;
                row.updated_at = Utc::now();
            }
        }
    }

    fn delete_host_cascade(&mut self, host: &Host) {
        let uuid = host.uuid.clone();
        self.apple_enrollments.remove(&uuid);
        if let Some(id) = self
            .windows_enrollments
            .iter()
            .find(|(_, e)| e.host_uuid.as_deref() == Some(uuid.as_str()))
            .map(|(id, _)| id.clone())
        {
            self.windows_enrollments.remove(&id);
        }
        self.host_profiles.retain(|(h, _), _| h != &uuid);
        self.disk_keys.remove(&host.id.0);
        self.installed_profiles.remove(&uuid);
        let seqs: Vec<u64> = self
            .commands
            .iter()
            .filter(|(_, c)| c.device_uuid == uuid)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in seqs {
            if let Some(cmd) = self.commands.remove(&seq) {
                self.command_seq_by_uuid
                    .remove(&(cmd.command_uuid, cmd.device_uuid));
            }
        }
        self.command_results.retain(|(_, dev), _| dev != &uuid);
    }
}

/// In-memory implementation of [`Store`].
///
/// All data is lost on process exit. Suitable for tests; the single write
/// lock makes every operation trivially atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    // ── Hosts ─────────────────────────────────────────────────────────────────

    async fn upsert_host(&self, seed: &HostSeed) -> Result<Host, StoreError> {
        let mut guard = self.inner.write().await;
        let existing = guard
            .hosts
            .values()
            .find(|h| {
                (!seed.uuid.is_empty() && h.uuid == seed.uuid)
                    || (!seed.serial.is_empty() && h.serial == seed.serial)
            })
            .map(|h| h.id.0);
        if let Some(id) = existing {
            if let Some(host) = guard.hosts.get_mut(&id) {
                if !seed.uuid.is_empty() {
                    host.uuid = seed.uuid.clone();
                }
                if !seed.serial.is_empty() {
                    host.serial = seed.serial.clone();
                }
                host.hostname = seed.hostname.clone();
                host.platform = seed.platform;
                return Ok(host.clone());
            }
        }
        guard.next_host_id += 1;
        let host = Host {
            id: HostId(guard.next_host_id),
            uuid: seed.uuid.clone(),
            serial: seed.serial.clone(),
            hostname: seed.hostname.clone(),
            platform: seed.platform,
            team_id: None,
            node_key: None,
            orbit_node_key: None,
            is_server: false,
            refetch_critical_queries_until: None,
        };
        guard.hosts.insert(host.id.0, host.clone());
        Ok(host)
    }

    async fn get_host(&self, id: HostId) -> Result<Option<Host>, StoreError> {
        Ok(self.inner.read().await.hosts.get(&id.0).cloned())
    }

    async fn get_host_by_uuid(&self, uuid: &str) -> Result<Option<Host>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.hosts.values().find(|h| h.uuid == uuid).cloned())
    }

    async fn get_host_by_serial(&self, serial: &str) -> Result<Option<Host>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.hosts.values().find(|h| h.serial == serial).cloned())
    }

    async fn get_host_by_orbit_node_key(&self, key: &str) -> Result<Option<Host>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .hosts
            .values()
            .find(|h| h.orbit_node_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let guard = self.inner.read().await;
        let mut hosts: Vec<Host> = guard.hosts.values().cloned().collect();
        hosts.sort_by_key(|h| h.id);
        Ok(hosts)
    }

    async fn set_host_team(&self, id: HostId, team_id: Option<TeamId>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let host = guard
            .hosts
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        host.team_id = team_id;
        Ok(())
    }

    async fn set_host_node_keys(
        &self,
        id: HostId,
        node_key: Option<String>,
        orbit_node_key: Option<String>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let host = guard
            .hosts
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        host.node_key = node_key;
        host.orbit_node_key = orbit_node_key;
        Ok(())
    }

    async fn set_host_refetch_until(
        &self,
        id: HostId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let host = guard
            .hosts
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        host.refetch_critical_queries_until = until;
        Ok(())
    }

    async fn delete_host(&self, id: HostId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(host) = guard.hosts.remove(&id.0) {
            guard.delete_host_cascade(&host);
        }
        Ok(())
    }

    // ── Teams ─────────────────────────────────────────────────────────────────

    async fn create_team(&self, name: &str) -> Result<Team, StoreError> {
        let mut guard = self.inner.write().await;
        guard.next_team_id += 1;
        let team = Team {
            id: TeamId(guard.next_team_id),
            name: name.to_string(),
            enroll_secret: Uuid::new_v4().simple().to_string(),
            enable_disk_encryption: false,
            macos_updates: None,
        };
        guard.teams.insert(team.id.0, team.clone());
        Ok(team)
    }

    async fn get_team(&self, id: TeamId) -> Result<Option<Team>, StoreError> {
        Ok(self.inner.read().await.teams.get(&id.0).cloned())
    }

    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.teams.values().find(|t| t.name == name).cloned())
    }

    async fn list_teams(&self) -> Result<Vec<Team>, StoreError> {
        let guard = self.inner.read().await;
        let mut teams: Vec<Team> = guard.teams.values().cloned().collect();
        teams.sort_by_key(|t| t.id);
        Ok(teams)
    }

    async fn update_team(&self, team: &Team) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.teams.contains_key(&team.id.0) {
            return Err(StoreError::TeamNotFound(team.id.to_string()));
        }
        guard.teams.insert(team.id.0, team.clone());
        Ok(())
    }

    // ── Org settings ──────────────────────────────────────────────────────────

    async fn get_settings(&self) -> Result<OrgSettings, StoreError> {
        Ok(self.inner.read().await.settings.clone().unwrap_or_default())
    }

    async fn put_settings(&self, settings: &OrgSettings) -> Result<(), StoreError> {
        self.inner.write().await.settings = Some(settings.clone());
        Ok(())
    }

    // ── Apple enrollments ─────────────────────────────────────────────────────

    async fn upsert_apple_enrollment(&self, e: &AppleEnrollment) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .apple_enrollments
            .insert(e.device_uuid.clone(), e.clone());
        Ok(())
    }

    async fn get_apple_enrollment(
        &self,
        device_uuid: &str,
    ) -> Result<Option<AppleEnrollment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .apple_enrollments
            .get(device_uuid)
            .cloned())
    }

    async fn list_apple_enrollments(&self) -> Result<Vec<AppleEnrollment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .apple_enrollments
            .values()
            .cloned()
            .collect())
    }

    async fn delete_apple_enrollment(&self, device_uuid: &str) -> Result<(), StoreError> {
        self.inner.write().await.apple_enrollments.remove(device_uuid);
        Ok(())
    }

    // ── Windows enrollments ───────────────────────────────────────────────────

    async fn upsert_windows_enrollment(&self, e: &WindowsEnrollment) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .windows_enrollments
            .insert(e.mdm_device_id.clone(), e.clone());
        Ok(())
    }

    async fn get_windows_enrollment(
        &self,
        mdm_device_id: &str,
    ) -> Result<Option<WindowsEnrollment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .windows_enrollments
            .get(mdm_device_id)
            .cloned())
    }

    async fn get_windows_enrollment_by_host_uuid(
        &self,
        host_uuid: &str,
    ) -> Result<Option<WindowsEnrollment>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .windows_enrollments
            .values()
            .find(|e| e.host_uuid.as_deref() == Some(host_uuid))
            .cloned())
    }

    async fn list_windows_enrollments(&self) -> Result<Vec<WindowsEnrollment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .windows_enrollments
            .values()
            .cloned()
            .collect())
    }

    async fn delete_windows_enrollment(&self, mdm_device_id: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .windows_enrollments
            .remove(mdm_device_id);
        Ok(())
    }

    // ── Profiles ──────────────────────────────────────────────────────────────

    async fn replace_profiles(
        &self,
        team_id: Option<TeamId>,
        profiles: &[Profile],
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let incoming: Vec<String> = profiles.iter().map(|p| p.identifier.clone()).collect();
        let dropped: Vec<String> = guard
            .profiles
            .iter()
            .filter(|((scope, ident), _)| {
                *scope == team_id
                    && !Profile::is_reserved_identifier(ident)
                    && !incoming.contains(ident)
            })
            .map(|((_, ident), _)| ident.clone())
            .collect();
        for ident in &dropped {
            guard.profiles.remove(&(team_id, ident.clone()));
            guard.cascade_profile_delete(team_id, ident);
        }
        for p in profiles {
            guard
                .profiles
                .insert((team_id, p.identifier.clone()), p.clone());
        }
        Ok(())
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .profiles
            .insert((profile.team_id, profile.identifier.clone()), profile.clone());
        Ok(())
    }

    async fn get_profile(
        &self,
        team_id: Option<TeamId>,
        identifier: &str,
    ) -> Result<Option<Profile>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .profiles
            .get(&(team_id, identifier.to_string()))
            .cloned())
    }

    async fn list_profiles(&self, team_id: Option<TeamId>) -> Result<Vec<Profile>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<Profile> = guard
            .profiles
            .iter()
            .filter(|((scope, _), _)| *scope == team_id)
            .map(|(_, p)| p.clone())
            .collect();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(out)
    }

    async fn delete_profile(
        &self,
        team_id: Option<TeamId>,
        identifier: &str,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.profiles.remove(&(team_id, identifier.to_string())).is_some() {
            guard.cascade_profile_delete(team_id, identifier);
        }
        Ok(())
    }

    // ── Host profile state ────────────────────────────────────────────────────

    async fn bulk_upsert_host_profiles(&self, rows: &[HostProfile]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        for row in rows {
            guard.host_profiles.insert(
                (row.host_uuid.clone(), row.profile_identifier.clone()),
                row.clone(),
            );
        }
        Ok(())
    }

    async fn list_host_profiles(&self, host_uuid: &str) -> Result<Vec<HostProfile>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<HostProfile> = guard
            .host_profiles
            .iter()
            .filter(|((h, _), _)| h == host_uuid)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.profile_identifier.cmp(&b.profile_identifier));
        Ok(out)
    }

    async fn get_host_profile(
        &self,
        host_uuid: &str,
        identifier: &str,
    ) -> Result<Option<HostProfile>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .host_profiles
            .get(&(host_uuid.to_string(), identifier.to_string()))
            .cloned())
    }

    async fn get_host_profile_by_command(
        &self,
        command_uuid: &str,
    ) -> Result<Option<HostProfile>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .host_profiles
            .values()
            .find(|r| r.command_uuid.as_deref() == Some(command_uuid))
            .cloned())
    }

    async fn delete_host_profile(
        &self,
        host_uuid: &str,
        identifier: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .host_profiles
            .remove(&(host_uuid.to_string(), identifier.to_string()));
        Ok(())
    }

    async fn list_all_host_profiles(&self) -> Result<Vec<HostProfile>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .host_profiles
            .values()
            .cloned()
            .collect())
    }

    // ── Command pipeline ──────────────────────────────────────────────────────

    async fn enqueue_command(&self, cmd: &Command) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let key = (cmd.command_uuid.clone(), cmd.device_uuid.clone());
        if guard.command_seq_by_uuid.contains_key(&key) {
            return Err(StoreError::DuplicateCommand(cmd.command_uuid.clone()));
        }
        guard.next_command_seq += 1;
        let seq = guard.next_command_seq;
        guard.commands.insert(seq, cmd.clone());
        guard.command_seq_by_uuid.insert(key, seq);
        Ok(())
    }

    async fn next_pending_command(
        &self,
        device_uuid: &str,
    ) -> Result<Option<Command>, StoreError> {
        let guard = self.inner.read().await;
        for cmd in guard.commands.values() {
            if cmd.device_uuid != device_uuid {
                continue;
            }
            let key = (cmd.command_uuid.clone(), device_uuid.to_string());
            if !guard.command_results.contains_key(&key) {
                return Ok(Some(cmd.clone()));
            }
        }
        Ok(None)
    }

    async fn record_command_result(&self, result: &CommandResult) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.command_results.insert(
            (result.command_uuid.clone(), result.device_uuid.clone()),
            result.clone(),
        );
        Ok(())
    }

    async fn get_command(&self, command_uuid: &str) -> Result<Option<Command>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .commands
            .values()
            .find(|c| c.command_uuid == command_uuid)
            .cloned())
    }

    async fn list_commands(&self, device_uuid: Option<&str>) -> Result<Vec<Command>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .commands
            .values()
            .filter(|c| device_uuid.map_or(true, |d| c.device_uuid == d))
            .cloned()
            .collect())
    }

    async fn get_command_results(
        &self,
        command_uuid: &str,
    ) -> Result<Vec<CommandResult>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .command_results
            .iter()
            .filter(|((cmd, _), _)| cmd == command_uuid)
            .map(|(_, r)| r.clone())
            .collect())
    }

    // ── ABM / DEP ─────────────────────────────────────────────────────────────

    async fn upsert_dep_assignment(&self, assignment: &DepAssignment) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .dep_assignments
            .insert(assignment.serial_number.clone(), assignment.clone());
        Ok(())
    }

    async fn get_dep_assignment(
        &self,
        serial: &str,
    ) -> Result<Option<DepAssignment>, StoreError> {
        Ok(self.inner.read().await.dep_assignments.get(serial).cloned())
    }

    async fn list_dep_assignments(&self) -> Result<Vec<DepAssignment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .dep_assignments
            .values()
            .cloned()
            .collect())
    }

    async fn get_dep_cursor(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.dep_cursor.clone())
    }

    async fn put_dep_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        self.inner.write().await.dep_cursor = Some(cursor.to_string());
        Ok(())
    }

    async fn set_abm_terms_expired(&self, expired: bool) -> Result<(), StoreError> {
        self.inner.write().await.abm_terms_expired = expired;
        Ok(())
    }

    async fn abm_terms_expired(&self) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.abm_terms_expired)
    }

    // ── Per-scope artifacts ───────────────────────────────────────────────────

    async fn put_bootstrap_package(&self, pkg: &BootstrapPackage) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .bootstrap_packages
            .insert(pkg.team_id, pkg.clone());
        Ok(())
    }

    async fn get_bootstrap_package(
        &self,
        team_id: Option<TeamId>,
    ) -> Result<Option<BootstrapPackage>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .bootstrap_packages
            .get(&team_id)
            .cloned())
    }

    async fn get_bootstrap_package_by_token(
        &self,
        token: &str,
    ) -> Result<Option<BootstrapPackage>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .bootstrap_packages
            .values()
            .find(|p| p.token == token)
            .cloned())
    }

    async fn delete_bootstrap_package(&self, team_id: Option<TeamId>) -> Result<(), StoreError> {
        self.inner.write().await.bootstrap_packages.remove(&team_id);
        Ok(())
    }

    async fn put_eula(&self, eula: &Eula) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.eulas.contains_key(&eula.team_id) {
            return Err(StoreError::EulaExists);
        }
        guard.eulas.insert(eula.team_id, eula.clone());
        Ok(())
    }

    async fn get_eula(&self, team_id: Option<TeamId>) -> Result<Option<Eula>, StoreError> {
        Ok(self.inner.read().await.eulas.get(&team_id).cloned())
    }

    async fn get_eula_by_token(&self, token: &str) -> Result<Option<Eula>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.eulas.values().find(|e| e.token == token).cloned())
    }

    async fn delete_eula(&self, token: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let scope = guard
            .eulas
            .iter()
            .find(|(_, e)| e.token == token)
            .map(|(scope, _)| *scope);
        if let Some(scope) = scope {
            guard.eulas.remove(&scope);
        }
        Ok(())
    }

    async fn put_setup_assistant(&self, sa: &SetupAssistant) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .setup_assistants
            .insert(sa.team_id, sa.clone());
        Ok(())
    }

    async fn get_setup_assistant(
        &self,
        team_id: Option<TeamId>,
    ) -> Result<Option<SetupAssistant>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .setup_assistants
            .get(&team_id)
            .cloned())
    }

    async fn delete_setup_assistant(&self, team_id: Option<TeamId>) -> Result<(), StoreError> {
        self.inner.write().await.setup_assistants.remove(&team_id);
        Ok(())
    }

    // ── Disk-encryption escrow ────────────────────────────────────────────────

    async fn put_disk_encryption_key(&self, key: &DiskEncryptionKey) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .disk_keys
            .insert(key.host_id.0, key.clone());
        Ok(())
    }

    async fn get_disk_encryption_key(
        &self,
        host_id: HostId,
    ) -> Result<Option<DiskEncryptionKey>, StoreError> {
        Ok(self.inner.read().await.disk_keys.get(&host_id.0).cloned())
    }

    async fn set_decryptable(
        &self,
        host_id: HostId,
        decryptable: Decryptable,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(key) = guard.disk_keys.get_mut(&host_id.0) {
            key.decryptable = decryptable;
            key.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_disk_encryption_keys(&self) -> Result<Vec<DiskEncryptionKey>, StoreError> {
        Ok(self.inner.read().await.disk_keys.values().cloned().collect())
    }

    // ── Preassign / match buffer ──────────────────────────────────────────────

    async fn add_preassigned_profile(&self, p: &PreassignedProfile) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let rows = guard
            .preassigned
            .entry(p.external_host_id.clone())
            .or_default();
        // Re-preassigning the same profile replaces the buffered entry.
        rows.retain(|r| r.profile_identifier != p.profile_identifier);
        rows.push(p.clone());
        Ok(())
    }

    async fn list_preassigned_profiles(
        &self,
        external_host_id: &str,
    ) -> Result<Vec<PreassignedProfile>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .preassigned
            .get(external_host_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_preassigned_profiles(
        &self,
        external_host_id: &str,
    ) -> Result<(), StoreError> {
        self.inner.write().await.preassigned.remove(external_host_id);
        Ok(())
    }

    async fn gc_preassigned_profiles(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.inner.write().await;
        let mut removed = 0u64;
        for rows in guard.preassigned.values_mut() {
            let before = rows.len();
            rows.retain(|r| r.created_at >= cutoff);
            removed += (before - rows.len()) as u64;
        }
        guard.preassigned.retain(|_, rows| !rows.is_empty());
        Ok(removed)
    }

    // ── IdP accounts ──────────────────────────────────────────────────────────

    async fn upsert_idp_account(&self, account: &IdpAccount) -> Result<IdpAccount, StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.idp_accounts.get_mut(&account.subject) {
            existing.username = account.username.clone();
            existing.fullname = account.fullname.clone();
            return Ok(existing.clone());
        }
        guard
            .idp_accounts
            .insert(account.subject.clone(), account.clone());
        Ok(account.clone())
    }

    async fn get_idp_account_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<IdpAccount>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .idp_accounts
            .values()
            .find(|a| a.enrollment_reference == reference)
            .cloned())
    }

    // ── Durable jobs ──────────────────────────────────────────────────────────

    async fn enqueue_job(
        &self,
        kind: &str,
        args: Value,
        not_before: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            args,
            retries: 0,
            not_before,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError> {
        let guard = self.inner.read().await;
        let mut due: Vec<Job> = guard
            .jobs
            .values()
            .filter(|j| j.not_before <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn complete_job(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().await.jobs.remove(&id);
        Ok(())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        not_before: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(job) = guard.jobs.get_mut(&id) {
            job.retries += 1;
            job.error = Some(error.to_string());
            job.not_before = not_before;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    // ── Activities ────────────────────────────────────────────────────────────

    async fn append_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        self.inner.write().await.activities.push(activity.clone());
        Ok(())
    }

    async fn list_activities(&self, limit: u32) -> Result<Vec<Activity>, StoreError> {
        let guard = self.inner.read().await;
        let start = guard.activities.len().saturating_sub(limit as usize);
        Ok(guard.activities[start..].to_vec())
    }

    // ── Installed-profile observations ────────────────────────────────────────

    async fn put_installed_profiles(&self, obs: &InstalledProfiles) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .installed_profiles
            .insert(obs.host_uuid.clone(), obs.clone());
        Ok(())
    }

    async fn get_installed_profiles(
        &self,
        host_uuid: &str,
    ) -> Result<Option<InstalledProfiles>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .installed_profiles
            .get(host_uuid)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_domain::Platform;

    fn seed(uuid: &str, serial: &str) -> HostSeed {
        HostSeed {
            uuid: uuid.into(),
            serial: serial.into(),
            hostname: format!("host-{}", uuid),
            platform: Platform::Darwin,
        }
    }

    fn host_profile(host: &str, ident: &str, op: ProfileOperation) -> HostProfile {
        HostProfile {
            host_uuid: host.into(),
            profile_identifier: ident.into(),
            profile_name: ident.into(),
            platform: Platform::Darwin,
            operation: op,
            status: ProfileStatus::Pending,
            command_uuid: None,
            retries: 0,
            checksum: "c".into(),
            detail: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_host_is_idempotent_on_identity() {
        let store = InMemoryStore::new();
        let a = store.upsert_host(&seed("U1", "SN1")).await.unwrap();
        let b = store.upsert_host(&seed("U1", "SN1")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.list_hosts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_host_matches_by_serial() {
        let store = InMemoryStore::new();
        let a = store.upsert_host(&seed("", "SN1")).await.unwrap();
        let b = store.upsert_host(&seed("U1", "SN1")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.uuid, "U1");
    }

    #[tokio::test]
    async fn command_queue_is_fifo_per_device() {
        let store = InMemoryStore::new();
        for (uuid, dev) in [("c1", "D1"), ("c2", "D2"), ("c3", "D1")] {
            store
                .enqueue_command(&Command {
                    command_uuid: uuid.into(),
                    device_uuid: dev.into(),
                    platform: Platform::Darwin,
                    request_type: "InstallProfile".into(),
                    payload: vec![],
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let next = store.next_pending_command("D1").await.unwrap().unwrap();
        assert_eq!(next.command_uuid, "c1");

        store
            .record_command_result(&CommandResult {
                command_uuid: "c1".into(),
                device_uuid: "D1".into(),
                status: "Acknowledged".into(),
                payload: vec![],
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let next = store.next_pending_command("D1").await.unwrap().unwrap();
        assert_eq!(next.command_uuid, "c3");
    }

    #[tokio::test]
    async fn duplicate_command_uuid_is_rejected() {
        let store = InMemoryStore::new();
        let cmd = Command {
            command_uuid: "c1".into(),
            device_uuid: "D1".into(),
            platform: Platform::Darwin,
            request_type: "InstallProfile".into(),
            payload: vec![],
            created_at: Utc::now(),
        };
        store.enqueue_command(&cmd).await.unwrap();
        assert!(matches!(
            store.enqueue_command(&cmd).await,
            Err(StoreError::DuplicateCommand(_))
        ));
    }

    #[tokio::test]
    async fn profile_delete_cascades_to_pending_remove() {
        let store = InMemoryStore::new();
        let host = store.upsert_host(&seed("U1", "SN1")).await.unwrap();
        assert_eq!(host.team_id, None);

        let profile = Profile {
            identifier: "com.example.wifi".into(),
            name: "WiFi".into(),
            platform: Platform::Darwin,
            team_id: None,
            payload: b"x".to_vec(),
            checksum: "c".into(),
            uploaded_at: Utc::now(),
        };
        store.upsert_profile(&profile).await.unwrap();
        let mut row = host_profile("U1", "com.example.wifi", ProfileOperation::Install);
        row.status = ProfileStatus::Verified;
        store.bulk_upsert_host_profiles(&[row]).await.unwrap();

        store.delete_profile(None, "com.example.wifi").await.unwrap();
        let row = store
            .get_host_profile("U1", "com.example.wifi")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.operation, ProfileOperation::Remove);
        assert_eq!(row.status, ProfileStatus::Pending);
    }

    #[tokio::test]
    async fn replace_profiles_keeps_server_managed_rows() {
        let store = InMemoryStore::new();
        let managed = Profile {
            identifier: shepherd_domain::DISK_ENCRYPTION_PROFILE_IDENTIFIER.into(),
            name: "Disk encryption".into(),
            platform: Platform::Darwin,
            team_id: None,
            payload: b"m".to_vec(),
            checksum: "c".into(),
            uploaded_at: Utc::now(),
        };
        store.upsert_profile(&managed).await.unwrap();
        store.replace_profiles(None, &[]).await.unwrap();
        let remaining = store.list_profiles(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].identifier,
            shepherd_domain::DISK_ENCRYPTION_PROFILE_IDENTIFIER
        );
    }

    #[tokio::test]
    async fn eula_is_unique_per_scope() {
        let store = InMemoryStore::new();
        let eula = Eula {
            team_id: None,
            name: "eula.pdf".into(),
            token: "tok".into(),
            payload: vec![1],
            created_at: Utc::now(),
        };
        store.put_eula(&eula).await.unwrap();
        assert!(matches!(
            store.put_eula(&eula).await,
            Err(StoreError::EulaExists)
        ));
        store.delete_eula("tok").await.unwrap();
        store.put_eula(&eula).await.unwrap();
    }

    #[tokio::test]
    async fn idp_account_reference_is_stable() {
        let store = InMemoryStore::new();
        let first = store
            .upsert_idp_account(&IdpAccount {
                subject: "sub".into(),
                username: "user".into(),
                fullname: "User One".into(),
                enrollment_reference: "ref-1".into(),
            })
            .await
            .unwrap();
        let second = store
            .upsert_idp_account(&IdpAccount {
                subject: "sub".into(),
                username: "user".into(),
                fullname: "User One".into(),
                enrollment_reference: "ref-2".into(),
            })
            .await
            .unwrap();
        assert_eq!(first.enrollment_reference, second.enrollment_reference);
    }

    #[tokio::test]
    async fn delete_host_cascades_everywhere() {
        let store = InMemoryStore::new();
        let host = store.upsert_host(&seed("U1", "SN1")).await.unwrap();
        store
            .upsert_apple_enrollment(&AppleEnrollment {
                device_uuid: "U1".into(),
                push_token: "t".into(),
                push_magic: "m".into(),
                unlock_token: None,
                bootstrap_token: None,
                cert_fingerprint: Some("fp".into()),
                enrollment_reference: None,
                enabled: true,
                active: true,
                enrolled_at: Utc::now(),
                last_seen_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .bulk_upsert_host_profiles(&[host_profile("U1", "p1", ProfileOperation::Install)])
            .await
            .unwrap();
        store
            .put_disk_encryption_key(&DiskEncryptionKey::with_key(host.id, vec![1], Utc::now()))
            .await
            .unwrap();

        store.delete_host(host.id).await.unwrap();
        assert!(store.get_apple_enrollment("U1").await.unwrap().is_none());
        assert!(store.list_host_profiles("U1").await.unwrap().is_empty());
        assert!(store
            .get_disk_encryption_key(host.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn preassigned_gc_drops_stale_rows() {
        let store = InMemoryStore::new();
        let old = PreassignedProfile {
            external_host_id: "ext-1".into(),
            host_uuid: "U1".into(),
            profile_identifier: "p1".into(),
            profile_name: "p1".into(),
            payload: vec![],
            group_label: None,
            exclude: false,
            created_at: Utc::now() - chrono::Duration::hours(10),
        };
        store.add_preassigned_profile(&old).await.unwrap();
        let removed = store
            .gc_preassigned_profiles(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .list_preassigned_profiles("ext-1")
            .await
            .unwrap()
            .is_empty());
    }
}
