use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shepherd_domain::{
    AppleEnrollment, BootstrapPackage, Command, CommandResult, Decryptable, DepAssignment,
    DiskEncryptionKey, Eula, Host, HostId, HostProfile, IdpAccount, OrgSettings,
    PreassignedProfile, Profile, ProfileOperation, ProfileStatus, SetupAssistant, Team, TeamId,
    WindowsEnrollment,
};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{Activity, HostSeed, InstalledProfiles, Job};
use crate::store::Store;

const HOSTS: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");
const TEAMS: TableDefinition<u64, &[u8]> = TableDefinition::new("teams");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const APPLE_ENROLLMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("apple_enrollments");
const WINDOWS_ENROLLMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("windows_enrollments");
const PROFILES: TableDefinition<&str, &[u8]> = TableDefinition::new("profiles");
const HOST_PROFILES: TableDefinition<&str, &[u8]> = TableDefinition::new("host_profiles");
const COMMANDS: TableDefinition<u64, &[u8]> = TableDefinition::new("commands");
const COMMAND_IDX: TableDefinition<&str, u64> = TableDefinition::new("command_idx");
const COMMAND_RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("command_results");
const DEP_ASSIGNMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("dep_assignments");
const BOOTSTRAP_PACKAGES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("bootstrap_packages");
const EULAS: TableDefinition<&str, &[u8]> = TableDefinition::new("eulas");
const SETUP_ASSISTANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("setup_assistants");
const DISK_KEYS: TableDefinition<u64, &[u8]> = TableDefinition::new("disk_keys");
const PREASSIGNED: TableDefinition<&str, &[u8]> = TableDefinition::new("preassigned");
const IDP_ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("idp_accounts");
const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
const ACTIVITIES: TableDefinition<u64, &[u8]> = TableDefinition::new("activities");
const INSTALLED_PROFILES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("installed_profiles");

fn internal(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// Scope component of compound keys: the team id, or "-" for no-team.
fn scope_key(team_id: Option<TeamId>) -> String {
    team_id.map(|t| t.0.to_string()).unwrap_or_else(|| "-".into())
}

/// Persistent store backed by a redb database file.
///
/// Every method is a single redb transaction, which gives the contract its
/// atomicity: `bulk_upsert_host_profiles` is one write txn, and profile
/// deletion cascades happen inside the deletion txn.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(internal)?;
            wtxn.open_table(HOSTS).map_err(internal)?;
            wtxn.open_table(TEAMS).map_err(internal)?;
            wtxn.open_table(META).map_err(internal)?;
            wtxn.open_table(KV).map_err(internal)?;
            wtxn.open_table(APPLE_ENROLLMENTS).map_err(internal)?;
            wtxn.open_table(WINDOWS_ENROLLMENTS).map_err(internal)?;
            wtxn.open_table(PROFILES).map_err(internal)?;
            wtxn.open_table(HOST_PROFILES).map_err(internal)?;
            wtxn.open_table(COMMANDS).map_err(internal)?;
            wtxn.open_table(COMMAND_IDX).map_err(internal)?;
            wtxn.open_table(COMMAND_RESULTS).map_err(internal)?;
            wtxn.open_table(DEP_ASSIGNMENTS).map_err(internal)?;
            wtxn.open_table(BOOTSTRAP_PACKAGES).map_err(internal)?;
            wtxn.open_table(EULAS).map_err(internal)?;
            wtxn.open_table(SETUP_ASSISTANTS).map_err(internal)?;
            wtxn.open_table(DISK_KEYS).map_err(internal)?;
            wtxn.open_table(PREASSIGNED).map_err(internal)?;
            wtxn.open_table(IDP_ACCOUNTS).map_err(internal)?;
            wtxn.open_table(JOBS).map_err(internal)?;
            wtxn.open_table(ACTIVITIES).map_err(internal)?;
            wtxn.open_table(INSTALLED_PROFILES).map_err(internal)?;
            wtxn.commit().map_err(internal)?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    // ── String-keyed helpers ──────────────────────────────────────────────────

    fn get_by_key<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(table).map_err(internal)?;
        match table.get(key).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn put_by_key<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(table).map_err(internal)?;
            table.insert(key, bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    fn delete_by_key(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(table).map_err(internal)?;
            table.remove(key).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(table).map_err(internal)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    // ── u64-keyed helpers ─────────────────────────────────────────────────────

    fn get_by_id<T: DeserializeOwned>(
        &self,
        table: TableDefinition<u64, &[u8]>,
        id: u64,
    ) -> Result<Option<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(table).map_err(internal)?;
        match table.get(id).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn put_by_id<T: Serialize>(
        &self,
        table: TableDefinition<u64, &[u8]>,
        id: u64,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(table).map_err(internal)?;
            table.insert(id, bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    fn scan_by_id<T: DeserializeOwned>(
        &self,
        table: TableDefinition<u64, &[u8]>,
    ) -> Result<Vec<T>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(table).map_err(internal)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for RedbStore {
    // ── Hosts ─────────────────────────────────────────────────────────────────

    async fn upsert_host(&self, seed: &HostSeed) -> Result<Host, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let host = {
            let mut hosts = wtxn.open_table(HOSTS).map_err(internal)?;
            let mut found: Option<Host> = None;
            for entry in hosts.iter().map_err(internal)? {
                let (_k, v) = entry.map_err(internal)?;
                let h: Host = serde_json::from_slice(v.value())?;
                if (!seed.uuid.is_empty() && h.uuid == seed.uuid)
                    || (!seed.serial.is_empty() && h.serial == seed.serial)
                {
                    found = Some(h);
                    break;
                }
            }
            let host = match found {
                Some(mut h) => {
                    if !seed.uuid.is_empty() {
                        h.uuid = seed.uuid.clone();
                    }
                    if !seed.serial.is_empty() {
                        h.serial = seed.serial.clone();
                    }
                    h.hostname = seed.hostname.clone();
                    h.platform = seed.platform;
                    h
                }
                None => {
                    let mut meta = wtxn.open_table(META).map_err(internal)?;
                    let next = meta
                        .get("next_host_id")
                        .map_err(internal)?
                        .map(|g| g.value())
                        .unwrap_or(0)
                        + 1;
                    meta.insert("next_host_id", next).map_err(internal)?;
                    Host {
                        id: HostId(next),
                        uuid: seed.uuid.clone(),
                        serial: seed.serial.clone(),
                        hostname: seed.hostname.clone(),
                        platform: seed.platform,
                        team_id: None,
                        node_key: None,
                        orbit_node_key: None,
                        is_server: false,
                        refetch_critical_queries_until: None,
                    }
                }
            };
            let bytes = serde_json::to_vec(&host)?;
            hosts.insert(host.id.0, bytes.as_slice()).map_err(internal)?;
            host
        };
        wtxn.commit().map_err(internal)?;
        Ok(host)
    }

    async fn get_host(&self, id: HostId) -> Result<Option<Host>, StoreError> {
        self.get_by_id(HOSTS, id.0)
    }

    async fn get_host_by_uuid(&self, uuid: &str) -> Result<Option<Host>, StoreError> {
        let hosts: Vec<Host> = self.scan_by_id(HOSTS)?;
        Ok(hosts.into_iter().find(|h| h.uuid == uuid))
    }

    async fn get_host_by_serial(&self, serial: &str) -> Result<Option<Host>, StoreError> {
        let hosts: Vec<Host> = self.scan_by_id(HOSTS)?;
        Ok(hosts.into_iter().find(|h| h.serial == serial))
    }

    async fn get_host_by_orbit_node_key(&self, key: &str) -> Result<Option<Host>, StoreError> {
        let hosts: Vec<Host> = self.scan_by_id(HOSTS)?;
        Ok(hosts
            .into_iter()
            .find(|h| h.orbit_node_key.as_deref() == Some(key)))
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        self.scan_by_id(HOSTS)
    }

    async fn set_host_team(&self, id: HostId, team_id: Option<TeamId>) -> Result<(), StoreError> {
        let mut host: Host = self
            .get_by_id(HOSTS, id.0)?
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        host.team_id = team_id;
        self.put_by_id(HOSTS, id.0, &host)
    }

    async fn set_host_node_keys(
        &self,
        id: HostId,
        node_key: Option<String>,
        orbit_node_key: Option<String>,
    ) -> Result<(), StoreError> {
        let mut host: Host = self
            .get_by_id(HOSTS, id.0)?
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        host.node_key = node_key;
        host.orbit_node_key = orbit_node_key;
        self.put_by_id(HOSTS, id.0, &host)
    }

    async fn set_host_refetch_until(
        &self,
        id: HostId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut host: Host = self
            .get_by_id(HOSTS, id.0)?
            .ok_or_else(|| StoreError::HostNotFound(id.to_string()))?;
        host.refetch_critical_queries_until = until;
        self.put_by_id(HOSTS, id.0, &host)
    }

    async fn delete_host(&self, id: HostId) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut hosts = wtxn.open_table(HOSTS).map_err(internal)?;
            let host: Option<Host> = match hosts.remove(id.0).map_err(internal)? {
                Some(guard) => Some(serde_json::from_slice(guard.value())?),
                None => None,
            };
            if let Some(host) = host {
                let uuid = host.uuid;

                let mut apple = wtxn.open_table(APPLE_ENROLLMENTS).map_err(internal)?;
                apple.remove(uuid.as_str()).map_err(internal)?;

                let mut windows = wtxn.open_table(WINDOWS_ENROLLMENTS).map_err(internal)?;
                let win_ids: Vec<String> = {
                    let mut ids = Vec::new();
                    for entry in windows.iter().map_err(internal)? {
                        let (k, v) = entry.map_err(internal)?;
                        let e: WindowsEnrollment = serde_json::from_slice(v.value())?;
                        if e.host_uuid.as_deref() == Some(uuid.as_str()) {
                            ids.push(k.value().to_string());
                        }
                    }
                    ids
                };
                for wid in win_ids {
                    windows.remove(wid.as_str()).map_err(internal)?;
                }

                let mut rows = wtxn.open_table(HOST_PROFILES).map_err(internal)?;
                let keys: Vec<String> = {
                    let mut keys = Vec::new();
                    for entry in rows.iter().map_err(internal)? {
                        let (k, _v) = entry.map_err(internal)?;
                        if k.value().starts_with(&format!("{}|", uuid)) {
                            keys.push(k.value().to_string());
                        }
                    }
                    keys
                };
                for key in keys {
                    rows.remove(key.as_str()).map_err(internal)?;
                }

                let mut keys_table = wtxn.open_table(DISK_KEYS).map_err(internal)?;
                keys_table.remove(id.0).map_err(internal)?;

                let mut installed = wtxn.open_table(INSTALLED_PROFILES).map_err(internal)?;
                installed.remove(uuid.as_str()).map_err(internal)?;

                let mut commands = wtxn.open_table(COMMANDS).map_err(internal)?;
                let mut idx = wtxn.open_table(COMMAND_IDX).map_err(internal)?;
                let doomed: Vec<(u64, String)> = {
                    let mut doomed = Vec::new();
                    for entry in commands.iter().map_err(internal)? {
                        let (k, v) = entry.map_err(internal)?;
                        let c: Command = serde_json::from_slice(v.value())?;
                        if c.device_uuid == uuid {
                            doomed.push((k.value(), c.command_uuid));
                        }
                    }
                    doomed
                };
                for (seq, cmd_uuid) in doomed {
                    commands.remove(seq).map_err(internal)?;
                    let key = format!("{}|{}", cmd_uuid, uuid);
                    idx.remove(key.as_str()).map_err(internal)?;
                }

                let mut results = wtxn.open_table(COMMAND_RESULTS).map_err(internal)?;
                let result_keys: Vec<String> = {
                    let mut keys = Vec::new();
                    for entry in results.iter().map_err(internal)? {
                        let (k, _v) = entry.map_err(internal)?;
                        if k.value().ends_with(&format!("|{}", uuid)) {
                            keys.push(k.value().to_string());
                        }
                    }
                    keys
                };
                for key in result_keys {
                    results.remove(key.as_str()).map_err(internal)?;
                }
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    // ── Teams ─────────────────────────────────────────────────────────────────

    async fn create_team(&self, name: &str) -> Result<Team, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let team = {
            let mut meta = wtxn.open_table(META).map_err(internal)?;
            let next = meta
                .get("next_team_id")
                .map_err(internal)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            meta.insert("next_team_id", next).map_err(internal)?;
            let team = Team {
                id: TeamId(next),
                name: name.to_string(),
                enroll_secret: Uuid::new_v4().simple().to_string(),
                enable_disk_encryption: false,
                macos_updates: None,
            };
            let mut teams = wtxn.open_table(TEAMS).map_err(internal)?;
            let bytes = serde_json::to_vec(&team)?;
            teams.insert(team.id.0, bytes.as_slice()).map_err(internal)?;
            team
        };
        wtxn.commit().map_err(internal)?;
        Ok(team)
    }

    async fn get_team(&self, id: TeamId) -> Result<Option<Team>, StoreError> {
        self.get_by_id(TEAMS, id.0)
    }

    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>, StoreError> {
        let teams: Vec<Team> = self.scan_by_id(TEAMS)?;
        Ok(teams.into_iter().find(|t| t.name == name))
    }

    async fn list_teams(&self) -> Result<Vec<Team>, StoreError> {
        self.scan_by_id(TEAMS)
    }

    async fn update_team(&self, team: &Team) -> Result<(), StoreError> {
        if self.get_by_id::<Team>(TEAMS, team.id.0)?.is_none() {
            return Err(StoreError::TeamNotFound(team.id.to_string()));
        }
        self.put_by_id(TEAMS, team.id.0, team)
    }

    // ── Org settings ──────────────────────────────────────────────────────────

    async fn get_settings(&self) -> Result<OrgSettings, StoreError> {
        Ok(self.get_by_key(KV, "settings")?.unwrap_or_default())
    }

    async fn put_settings(&self, settings: &OrgSettings) -> Result<(), StoreError> {
        self.put_by_key(KV, "settings", settings)
    }

    // ── Apple enrollments ─────────────────────────────────────────────────────

    async fn upsert_apple_enrollment(&self, e: &AppleEnrollment) -> Result<(), StoreError> {
        self.put_by_key(APPLE_ENROLLMENTS, &e.device_uuid, e)
    }

    async fn get_apple_enrollment(
        &self,
        device_uuid: &str,
    ) -> Result<Option<AppleEnrollment>, StoreError> {
        self.get_by_key(APPLE_ENROLLMENTS, device_uuid)
    }

    async fn list_apple_enrollments(&self) -> Result<Vec<AppleEnrollment>, StoreError> {
        self.scan(APPLE_ENROLLMENTS)
    }

    async fn delete_apple_enrollment(&self, device_uuid: &str) -> Result<(), StoreError> {
        self.delete_by_key(APPLE_ENROLLMENTS, device_uuid)
    }

    // ── Windows enrollments ───────────────────────────────────────────────────

    async fn upsert_windows_enrollment(&self, e: &WindowsEnrollment) -> Result<(), StoreError> {
        self.put_by_key(WINDOWS_ENROLLMENTS, &e.mdm_device_id, e)
    }

    async fn get_windows_enrollment(
        &self,
        mdm_device_id: &str,
    ) -> Result<Option<WindowsEnrollment>, StoreError> {
        self.get_by_key(WINDOWS_ENROLLMENTS, mdm_device_id)
    }

    async fn get_windows_enrollment_by_host_uuid(
        &self,
        host_uuid: &str,
    ) -> Result<Option<WindowsEnrollment>, StoreError> {
        let all: Vec<WindowsEnrollment> = self.scan(WINDOWS_ENROLLMENTS)?;
        Ok(all
            .into_iter()
            .find(|e| e.host_uuid.as_deref() == Some(host_uuid)))
    }

    async fn list_windows_enrollments(&self) -> Result<Vec<WindowsEnrollment>, StoreError> {
        self.scan(WINDOWS_ENROLLMENTS)
    }

    async fn delete_windows_enrollment(&self, mdm_device_id: &str) -> Result<(), StoreError> {
        self.delete_by_key(WINDOWS_ENROLLMENTS, mdm_device_id)
    }

    // ── Profiles ──────────────────────────────────────────────────────────────

    async fn replace_profiles(
        &self,
        team_id: Option<TeamId>,
        profiles: &[Profile],
    ) -> Result<(), StoreError> {
        let scope = scope_key(team_id);
        let incoming: Vec<&str> = profiles.iter().map(|p| p.identifier.as_str()).collect();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(PROFILES).map_err(internal)?;
            let dropped: Vec<(String, String)> = {
                let mut dropped = Vec::new();
                for entry in table.iter().map_err(internal)? {
                    let (k, v) = entry.map_err(internal)?;
                    let p: Profile = serde_json::from_slice(v.value())?;
                    if p.team_id == team_id
                        && !Profile::is_reserved_identifier(&p.identifier)
                        && !incoming.contains(&p.identifier.as_str())
                    {
                        dropped.push((k.value().to_string(), p.identifier));
                    }
                }
                dropped
            };
            for (key, ident) in &dropped {
                table.remove(key.as_str()).map_err(internal)?;
                cascade_profile_delete(&wtxn, team_id, ident)?;
            }
            for p in profiles {
                let key = format!("{}|{}", scope, p.identifier);
                let bytes = serde_json::to_vec(p)?;
                table.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let key = format!("{}|{}", scope_key(profile.team_id), profile.identifier);
        self.put_by_key(PROFILES, &key, profile)
    }

    async fn get_profile(
        &self,
        team_id: Option<TeamId>,
        identifier: &str,
    ) -> Result<Option<Profile>, StoreError> {
        let key = format!("{}|{}", scope_key(team_id), identifier);
        self.get_by_key(PROFILES, &key)
    }

    async fn list_profiles(&self, team_id: Option<TeamId>) -> Result<Vec<Profile>, StoreError> {
        let all: Vec<Profile> = self.scan(PROFILES)?;
        let mut out: Vec<Profile> = all.into_iter().filter(|p| p.team_id == team_id).collect();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(out)
    }

    async fn delete_profile(
        &self,
        team_id: Option<TeamId>,
        identifier: &str,
    ) -> Result<(), StoreError> {
        let key = format!("{}|{}", scope_key(team_id), identifier);
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(PROFILES).map_err(internal)?;
            let removed = table.remove(key.as_str()).map_err(internal)?.is_some();
            if removed {
                cascade_profile_delete(&wtxn, team_id, identifier)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    // ── Host profile state ────────────────────────────────────────────────────

    async fn bulk_upsert_host_profiles(&self, rows: &[HostProfile]) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(HOST_PROFILES).map_err(internal)?;
            for row in rows {
                let key = format!("{}|{}", row.host_uuid, row.profile_identifier);
                let bytes = serde_json::to_vec(row)?;
                table.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn list_host_profiles(&self, host_uuid: &str) -> Result<Vec<HostProfile>, StoreError> {
        let all: Vec<HostProfile> = self.scan(HOST_PROFILES)?;
        let mut out: Vec<HostProfile> =
            all.into_iter().filter(|r| r.host_uuid == host_uuid).collect();
        out.sort_by(|a, b| a.profile_identifier.cmp(&b.profile_identifier));
        Ok(out)
    }

    async fn get_host_profile(
        &self,
        host_uuid: &str,
        identifier: &str,
    ) -> Result<Option<HostProfile>, StoreError> {
        let key = format!("{}|{}", host_uuid, identifier);
        self.get_by_key(HOST_PROFILES, &key)
    }

    async fn get_host_profile_by_command(
        &self,
        command_uuid: &str,
    ) -> Result<Option<HostProfile>, StoreError> {
        let all: Vec<HostProfile> = self.scan(HOST_PROFILES)?;
        Ok(all
            .into_iter()
            .find(|r| r.command_uuid.as_deref() == Some(command_uuid)))
    }

    async fn delete_host_profile(
        &self,
        host_uuid: &str,
        identifier: &str,
    ) -> Result<(), StoreError> {
        let key = format!("{}|{}", host_uuid, identifier);
        self.delete_by_key(HOST_PROFILES, &key)
    }

    async fn list_all_host_profiles(&self) -> Result<Vec<HostProfile>, StoreError> {
        self.scan(HOST_PROFILES)
    }

    // ── Command pipeline ──────────────────────────────────────────────────────

    async fn enqueue_command(&self, cmd: &Command) -> Result<(), StoreError> {
        let idx_key = format!("{}|{}", cmd.command_uuid, cmd.device_uuid);
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut idx = wtxn.open_table(COMMAND_IDX).map_err(internal)?;
            if idx.get(idx_key.as_str()).map_err(internal)?.is_some() {
                return Err(StoreError::DuplicateCommand(cmd.command_uuid.clone()));
            }
            let mut meta = wtxn.open_table(META).map_err(internal)?;
            let seq = meta
                .get("next_command_seq")
                .map_err(internal)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            meta.insert("next_command_seq", seq).map_err(internal)?;
            let mut commands = wtxn.open_table(COMMANDS).map_err(internal)?;
            let bytes = serde_json::to_vec(cmd)?;
            commands.insert(seq, bytes.as_slice()).map_err(internal)?;
            idx.insert(idx_key.as_str(), seq).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn next_pending_command(
        &self,
        device_uuid: &str,
    ) -> Result<Option<Command>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let commands = rtxn.open_table(COMMANDS).map_err(internal)?;
        let results = rtxn.open_table(COMMAND_RESULTS).map_err(internal)?;
        for entry in commands.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            let cmd: Command = serde_json::from_slice(v.value())?;
            if cmd.device_uuid != device_uuid {
                continue;
            }
            let rkey = format!("{}|{}", cmd.command_uuid, device_uuid);
            if results.get(rkey.as_str()).map_err(internal)?.is_none() {
                return Ok(Some(cmd));
            }
        }
        Ok(None)
    }

    async fn record_command_result(&self, result: &CommandResult) -> Result<(), StoreError> {
        let key = format!("{}|{}", result.command_uuid, result.device_uuid);
        self.put_by_key(COMMAND_RESULTS, &key, result)
    }

    async fn get_command(&self, command_uuid: &str) -> Result<Option<Command>, StoreError> {
        let all: Vec<Command> = self.scan_by_id(COMMANDS)?;
        Ok(all.into_iter().find(|c| c.command_uuid == command_uuid))
    }

    async fn list_commands(&self, device_uuid: Option<&str>) -> Result<Vec<Command>, StoreError> {
        let all: Vec<Command> = self.scan_by_id(COMMANDS)?;
        Ok(all
            .into_iter()
            .filter(|c| device_uuid.map_or(true, |d| c.device_uuid == d))
            .collect())
    }

    async fn get_command_results(
        &self,
        command_uuid: &str,
    ) -> Result<Vec<CommandResult>, StoreError> {
        let all: Vec<CommandResult> = self.scan(COMMAND_RESULTS)?;
        Ok(all
            .into_iter()
            .filter(|r| r.command_uuid == command_uuid)
            .collect())
    }

    // ── ABM / DEP ─────────────────────────────────────────────────────────────

    async fn upsert_dep_assignment(&self, assignment: &DepAssignment) -> Result<(), StoreError> {
        self.put_by_key(DEP_ASSIGNMENTS, &assignment.serial_number, assignment)
    }

    async fn get_dep_assignment(
        &self,
        serial: &str,
    ) -> Result<Option<DepAssignment>, StoreError> {
        self.get_by_key(DEP_ASSIGNMENTS, serial)
    }

    async fn list_dep_assignments(&self) -> Result<Vec<DepAssignment>, StoreError> {
        self.scan(DEP_ASSIGNMENTS)
    }

    async fn get_dep_cursor(&self) -> Result<Option<String>, StoreError> {
        self.get_by_key(KV, "dep_cursor")
    }

    async fn put_dep_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        self.put_by_key(KV, "dep_cursor", &cursor.to_string())
    }

    async fn set_abm_terms_expired(&self, expired: bool) -> Result<(), StoreError> {
        self.put_by_key(KV, "abm_terms_expired", &expired)
    }

    async fn abm_terms_expired(&self) -> Result<bool, StoreError> {
        Ok(self.get_by_key(KV, "abm_terms_expired")?.unwrap_or(false))
    }

    // ── Per-scope artifacts ───────────────────────────────────────────────────

    async fn put_bootstrap_package(&self, pkg: &BootstrapPackage) -> Result<(), StoreError> {
        self.put_by_key(BOOTSTRAP_PACKAGES, &scope_key(pkg.team_id), pkg)
    }

    async fn get_bootstrap_package(
        &self,
        team_id: Option<TeamId>,
    ) -> Result<Option<BootstrapPackage>, StoreError> {
        self.get_by_key(BOOTSTRAP_PACKAGES, &scope_key(team_id))
    }

    async fn get_bootstrap_package_by_token(
        &self,
        token: &str,
    ) -> Result<Option<BootstrapPackage>, StoreError> {
        let all: Vec<BootstrapPackage> = self.scan(BOOTSTRAP_PACKAGES)?;
        Ok(all.into_iter().find(|p| p.token == token))
    }

    async fn delete_bootstrap_package(&self, team_id: Option<TeamId>) -> Result<(), StoreError> {
        self.delete_by_key(BOOTSTRAP_PACKAGES, &scope_key(team_id))
    }

    async fn put_eula(&self, eula: &Eula) -> Result<(), StoreError> {
        let key = scope_key(eula.team_id);
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(EULAS).map_err(internal)?;
            if table.get(key.as_str()).map_err(internal)?.is_some() {
                return Err(StoreError::EulaExists);
            }
            let bytes = serde_json::to_vec(eula)?;
            table.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn get_eula(&self, team_id: Option<TeamId>) -> Result<Option<Eula>, StoreError> {
        self.get_by_key(EULAS, &scope_key(team_id))
    }

    async fn get_eula_by_token(&self, token: &str) -> Result<Option<Eula>, StoreError> {
        let all: Vec<Eula> = self.scan(EULAS)?;
        Ok(all.into_iter().find(|e| e.token == token))
    }

    async fn delete_eula(&self, token: &str) -> Result<(), StoreError> {
        let all: Vec<Eula> = self.scan(EULAS)?;
        if let Some(eula) = all.into_iter().find(|e| e.token == token) {
            self.delete_by_key(EULAS, &scope_key(eula.team_id))?;
        }
        Ok(())
    }

    async fn put_setup_assistant(&self, sa: &SetupAssistant) -> Result<(), StoreError> {
        self.put_by_key(SETUP_ASSISTANTS, &scope_key(sa.team_id), sa)
    }

    async fn get_setup_assistant(
        &self,
        team_id: Option<TeamId>,
    ) -> Result<Option<SetupAssistant>, StoreError> {
        self.get_by_key(SETUP_ASSISTANTS, &scope_key(team_id))
    }

    async fn delete_setup_assistant(&self, team_id: Option<TeamId>) -> Result<(), StoreError> {
        self.delete_by_key(SETUP_ASSISTANTS, &scope_key(team_id))
    }

    // ── Disk-encryption escrow ────────────────────────────────────────────────

    async fn put_disk_encryption_key(&self, key: &DiskEncryptionKey) -> Result<(), StoreError> {
        self.put_by_id(DISK_KEYS, key.host_id.0, key)
    }

    async fn get_disk_encryption_key(
        &self,
        host_id: HostId,
    ) -> Result<Option<DiskEncryptionKey>, StoreError> {
        self.get_by_id(DISK_KEYS, host_id.0)
    }

    async fn set_decryptable(
        &self,
        host_id: HostId,
        decryptable: Decryptable,
    ) -> Result<(), StoreError> {
        if let Some(mut key) = self.get_by_id::<DiskEncryptionKey>(DISK_KEYS, host_id.0)? {
            key.decryptable = decryptable;
            key.updated_at = Utc::now();
            self.put_by_id(DISK_KEYS, host_id.0, &key)?;
        }
        Ok(())
    }

    async fn list_disk_encryption_keys(&self) -> Result<Vec<DiskEncryptionKey>, StoreError> {
        self.scan_by_id(DISK_KEYS)
    }

    // ── Preassign / match buffer ──────────────────────────────────────────────

    async fn add_preassigned_profile(&self, p: &PreassignedProfile) -> Result<(), StoreError> {
        let key = format!("{}|{}", p.external_host_id, p.profile_identifier);
        self.put_by_key(PREASSIGNED, &key, p)
    }

    async fn list_preassigned_profiles(
        &self,
        external_host_id: &str,
    ) -> Result<Vec<PreassignedProfile>, StoreError> {
        let all: Vec<PreassignedProfile> = self.scan(PREASSIGNED)?;
        let mut out: Vec<PreassignedProfile> = all
            .into_iter()
            .filter(|p| p.external_host_id == external_host_id)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn delete_preassigned_profiles(
        &self,
        external_host_id: &str,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(PREASSIGNED).map_err(internal)?;
            let prefix = format!("{}|", external_host_id);
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in table.iter().map_err(internal)? {
                    let (k, _v) = entry.map_err(internal)?;
                    if k.value().starts_with(&prefix) {
                        keys.push(k.value().to_string());
                    }
                }
                keys
            };
            for key in keys {
                table.remove(key.as_str()).map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn gc_preassigned_profiles(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let removed = {
            let mut table = wtxn.open_table(PREASSIGNED).map_err(internal)?;
            let stale: Vec<String> = {
                let mut stale = Vec::new();
                for entry in table.iter().map_err(internal)? {
                    let (k, v) = entry.map_err(internal)?;
                    let p: PreassignedProfile = serde_json::from_slice(v.value())?;
                    if p.created_at < cutoff {
                        stale.push(k.value().to_string());
                    }
                }
                stale
            };
            let removed = stale.len() as u64;
            for key in stale {
                table.remove(key.as_str()).map_err(internal)?;
            }
            removed
        };
        wtxn.commit().map_err(internal)?;
        Ok(removed)
    }

    // ── IdP accounts ──────────────────────────────────────────────────────────

    async fn upsert_idp_account(&self, account: &IdpAccount) -> Result<IdpAccount, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let result = {
            let mut table = wtxn.open_table(IDP_ACCOUNTS).map_err(internal)?;
            let existing: Option<IdpAccount> =
                match table.get(account.subject.as_str()).map_err(internal)? {
                    Some(guard) => Some(serde_json::from_slice(guard.value())?),
                    None => None,
                };
            let merged = match existing {
                Some(mut e) => {
                    e.username = account.username.clone();
                    e.fullname = account.fullname.clone();
                    e
                }
                None => account.clone(),
            };
            let bytes = serde_json::to_vec(&merged)?;
            table
                .insert(account.subject.as_str(), bytes.as_slice())
                .map_err(internal)?;
            merged
        };
        wtxn.commit().map_err(internal)?;
        Ok(result)
    }

    async fn get_idp_account_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<IdpAccount>, StoreError> {
        let all: Vec<IdpAccount> = self.scan(IDP_ACCOUNTS)?;
        Ok(all.into_iter().find(|a| a.enrollment_reference == reference))
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
        self.put_by_key(JOBS, &job.id.to_string(), &job)?;
        Ok(job)
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, StoreError> {
        let all: Vec<Job> = self.scan(JOBS)?;
        let mut due: Vec<Job> = all.into_iter().filter(|j| j.not_before <= now).collect();
        due.sort_by_key(|j| j.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn complete_job(&self, id: Uuid) -> Result<(), StoreError> {
        self.delete_by_key(JOBS, &id.to_string())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        not_before: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(mut job) = self.get_by_key::<Job>(JOBS, &id.to_string())? {
            job.retries += 1;
            job.error = Some(error.to_string());
            job.not_before = not_before;
            job.updated_at = Utc::now();
            self.put_by_key(JOBS, &id.to_string(), &job)?;
        }
        Ok(())
    }

    // ── Activities ────────────────────────────────────────────────────────────

    async fn append_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut meta = wtxn.open_table(META).map_err(internal)?;
            let seq = meta
                .get("next_activity_seq")
                .map_err(internal)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            meta.insert("next_activity_seq", seq).map_err(internal)?;
            let mut table = wtxn.open_table(ACTIVITIES).map_err(internal)?;
            let bytes = serde_json::to_vec(activity)?;
            table.insert(seq, bytes.as_slice()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn list_activities(&self, limit: u32) -> Result<Vec<Activity>, StoreError> {
        let all: Vec<Activity> = self.scan_by_id(ACTIVITIES)?;
        let start = all.len().saturating_sub(limit as usize);
        Ok(all[start..].to_vec())
    }

    // ── Installed-profile observations ────────────────────────────────────────

    async fn put_installed_profiles(&self, obs: &InstalledProfiles) -> Result<(), StoreError> {
        self.put_by_key(INSTALLED_PROFILES, &obs.host_uuid, obs)
    }

    async fn get_installed_profiles(
        &self,
        host_uuid: &str,
    ) -> Result<Option<InstalledProfiles>, StoreError> {
        self.get_by_key(INSTALLED_PROFILES, host_uuid)
    }
}

/// Shared cascade for profile deletion: inside the caller's write txn, flip
/// matching install rows in the scope to a pending remove.
fn cascade_profile_delete(
    wtxn: &redb::WriteTransaction,
    team_id: Option<TeamId>,
    identifier: &str,
) -> Result<(), StoreError> {
    let scope_hosts: Vec<String> = {
        let hosts = wtxn.open_table(HOSTS).map_err(internal)?;
        let mut out = Vec::new();
        for entry in hosts.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            let h: Host = serde_json::from_slice(v.value())?;
            if h.team_id == team_id {
                out.push(h.uuid);
            }
        }
        out
    };
    let mut rows = wtxn.open_table(HOST_PROFILES).map_err(internal)?;
    let updates: Vec<(String, HostProfile)> = {
        let mut updates = Vec::new();
        for entry in rows.iter().map_err(internal)? {
            let (k, v) = entry.map_err(internal)?;
            let mut row: HostProfile = serde_json::from_slice(v.value())?;
            if row.profile_identifier != identifier || !scope_hosts.contains(&row.host_uuid) {
                continue;
            }
            if row.operation == ProfileOperation::Install && row.status != ProfileStatus::Failed {
                row.operation = ProfileOperation::Remove;
                row.status = ProfileStatus::Pending;
                row.command_uuid = None;
                row.retries = 0;
                row.detail = None;
                row.updated_at = Utc::now();
                updates.push((k.value().to_string(), row));
            }
        }
        updates
    };
    for (key, row) in updates {
        let bytes = serde_json::to_vec(&row)?;
        rows.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_domain::Platform;

    fn open_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("state.redb")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn host_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store
                .upsert_host(&HostSeed {
                    uuid: "U1".into(),
                    serial: "SN1".into(),
                    hostname: "mac-1".into(),
                    platform: Platform::Darwin,
                })
                .await
                .unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let host = store.get_host_by_uuid("U1").await.unwrap().unwrap();
        assert_eq!(host.serial, "SN1");
        assert_eq!(host.id, HostId(1));
    }

    #[tokio::test]
    async fn command_fifo_and_duplicate_detection() {
        let (store, _dir) = open_store();
        for uuid in ["c1", "c2"] {
            store
                .enqueue_command(&Command {
                    command_uuid: uuid.into(),
                    device_uuid: "D1".into(),
                    platform: Platform::Darwin,
                    request_type: "InstallProfile".into(),
                    payload: vec![],
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert!(matches!(
            store
                .enqueue_command(&Command {
                    command_uuid: "c1".into(),
                    device_uuid: "D1".into(),
                    platform: Platform::Darwin,
                    request_type: "InstallProfile".into(),
                    payload: vec![],
                    created_at: Utc::now(),
                })
                .await,
            Err(StoreError::DuplicateCommand(_))
        ));
        let next = store.next_pending_command("D1").await.unwrap().unwrap();
        assert_eq!(next.command_uuid, "c1");
    }

    #[tokio::test]
    async fn bulk_upsert_is_visible_as_a_whole() {
        let (store, _dir) = open_store();
        let rows: Vec<HostProfile> = (0..4)
            .map(|i| HostProfile {
                host_uuid: "U1".into(),
                profile_identifier: format!("com.example.p{}", i),
                profile_name: format!("p{}", i),
                platform: Platform::Darwin,
                operation: ProfileOperation::Install,
                status: ProfileStatus::Pending,
                command_uuid: None,
                retries: 0,
                checksum: "c".into(),
                detail: None,
                updated_at: Utc::now(),
            })
            .collect();
        store.bulk_upsert_host_profiles(&rows).await.unwrap();
        assert_eq!(store.list_host_profiles("U1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn settings_default_when_absent() {
        let (store, _dir) = open_store();
        let settings = store.get_settings().await.unwrap();
        assert!(!settings.apple_mdm_enabled);
    }
}
