//! Operator-facing API: profile batches, command pipeline, artifacts,
//! configuration, the match flow, and status surfaces.

use std::collections::{HashMap, HashSet};

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use shepherd_abm::sync::reassign_device_team;
use shepherd_apple::apns::{PushOutcome, PushTarget};
use shepherd_apple::commands as apple_commands;
use shepherd_domain::{
    BootstrapPackage, Command, Eula, HostId, NudgeConfig, Platform, Profile, SetupAssistant,
    TeamId, RESERVED_PAYLOAD_TYPES,
};
use shepherd_pki::opaque_token;
use shepherd_reconciler::{escrow, match_flow};
use shepherd_store::{compute_checksum, Activity, Store};
use shepherd_windows::syncml;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Accept standard and raw (unpadded) base64.
fn decode_base64_any(s: &str) -> Result<Vec<u8>, ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(s.as_bytes())
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(s.as_bytes()))
        .map_err(|e| ApiError::bad_request(format!("invalid base64: {}", e)))
}

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub team_id: Option<u64>,
}

impl ScopeQuery {
    async fn resolve(&self, state: &AppState) -> Result<Option<TeamId>, ApiError> {
        match self.team_id {
            None => Ok(None),
            Some(id) => {
                let team_id = TeamId(id);
                state
                    .store
                    .get_team(team_id)
                    .await?
                    .ok_or_else(|| ApiError::not_found(format!("team {} not found", id)))?;
                Ok(Some(team_id))
            }
        }
    }
}

/// Top-level identity plus every payload type in an Apple profile.
fn apple_profile_metadata(payload: &[u8]) -> Result<(String, String, Vec<String>), ApiError> {
    let value: plist::Value = plist::from_bytes(payload)
        .map_err(|e| ApiError::unprocessable(format!("invalid mobileconfig: {}", e)))?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| ApiError::unprocessable("mobileconfig root is not a dict"))?;
    let identifier = dict
        .get("PayloadIdentifier")
        .and_then(|v| v.as_string())
        .ok_or_else(|| ApiError::unprocessable("mobileconfig has no PayloadIdentifier"))?
        .to_string();
    let name = dict
        .get("PayloadDisplayName")
        .and_then(|v| v.as_string())
        .unwrap_or(identifier.as_str())
        .to_string();
    let mut types = Vec::new();
    if let Some(content) = dict.get("PayloadContent").and_then(|v| v.as_array()) {
        for item in content {
            if let Some(t) = item
                .as_dictionary()
                .and_then(|d| d.get("PayloadType"))
                .and_then(|v| v.as_string())
            {
                types.push(t.to_string());
            }
        }
    }
    Ok((identifier, name, types))
}

// ── Profiles batch ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BatchProfile {
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Base64 payload: a mobileconfig for darwin, a SyncML fragment for
    /// windows.
    pub contents: String,
}

fn default_platform() -> String {
    "darwin".into()
}

#[derive(Debug, Deserialize)]
pub struct BatchProfilesBody {
    #[serde(default)]
    pub profiles: Vec<BatchProfile>,
}

/// Replace the user-managed profile set for a scope. Reserved identifiers
/// and payload types never pass this endpoint.
pub async fn batch_profiles(
    State(state): State<AppState>,
    Query(scope): Query<ScopeQuery>,
    Json(body): Json<BatchProfilesBody>,
) -> Result<Json<Value>, ApiError> {
    let team_id = scope.resolve(&state).await?;
    let now = Utc::now();

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut seen_idents: HashSet<String> = HashSet::new();
    let mut profiles = Vec::new();
    for item in &body.profiles {
        if !seen_names.insert(item.name.clone()) {
            return Err(ApiError::unprocessable(format!(
                "duplicate profile name {:?}",
                item.name
            )));
        }
        let payload = decode_base64_any(&item.contents)?;
        let platform = Platform::parse(&item.platform)
            .map_err(|e| ApiError::unprocessable(e.to_string()))?;

        let identifier = match platform {
            Platform::Darwin => {
                let (identifier, _, types) = apple_profile_metadata(&payload)?;
                if Profile::is_reserved_identifier(&identifier) {
                    return Err(ApiError::unprocessable(format!(
                        "profile identifier {:?} is reserved for server-managed profiles",
                        identifier
                    )));
                }
                if let Some(t) = types.iter().find(|t| RESERVED_PAYLOAD_TYPES.contains(&t.as_str()))
                {
                    return Err(ApiError::unprocessable(format!(
                        "payload type {:?} is reserved for server-managed profiles",
                        t
                    )));
                }
                identifier
            }
            Platform::Windows => {
                // Windows profiles are keyed by their root LocURI.
                let fragment = String::from_utf8_lossy(&payload);
                shepherd_windows::soap::extract_text(&fragment, "LocURI").ok_or_else(|| {
                    ApiError::unprocessable("windows profile has no Target LocURI")
                })?
            }
            Platform::Linux => {
                return Err(ApiError::unprocessable("profiles are not supported on linux"))
            }
        };
        if !seen_idents.insert(identifier.clone()) {
            return Err(ApiError::unprocessable(format!(
                "duplicate profile identifier {:?}",
                identifier
            )));
        }

        profiles.push(Profile {
            identifier,
            name: item.name.clone(),
            platform,
            team_id,
            checksum: compute_checksum(&payload),
            payload,
            uploaded_at: now,
        });
    }

    state.store.replace_profiles(team_id, &profiles).await?;
    let platform = profiles
        .first()
        .map(|p| p.platform)
        .unwrap_or(Platform::Darwin);
    state
        .store
        .append_activity(&Activity::EditedProfiles { at: now, team_id, platform })
        .await?;
    info!(?team_id, count = profiles.len(), "profile set replaced");
    Ok(Json(json!({ "applied": profiles.len() })))
}

pub async fn list_profiles(
    State(state): State<AppState>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<Value>, ApiError> {
    let team_id = scope.resolve(&state).await?;
    let profiles: Vec<Value> = state
        .store
        .list_profiles(team_id)
        .await?
        .into_iter()
        .map(|p| {
            json!({
                "identifier": p.identifier,
                "name": p.name,
                "platform": p.platform,
                "checksum": p.checksum,
                "uploaded_at": p.uploaded_at,
            })
        })
        .collect();
    Ok(Json(json!({ "profiles": profiles })))
}

// ── Command pipeline ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunCommandBody {
    pub device_uuids: Vec<String>,
    /// Base64 raw command; standard or unpadded alphabet.
    pub command: String,
}

/// Enqueue a raw command for one or more devices. Mixed platforms and
/// non-enrolled devices are rejected outright.
pub async fn run_command(
    State(state): State<AppState>,
    Json(body): Json<RunCommandBody>,
) -> Result<Json<Value>, ApiError> {
    if body.device_uuids.is_empty() {
        return Err(ApiError::unprocessable("no target devices"));
    }
    let payload = decode_base64_any(&body.command)?;

    // Resolve every target's platform first; reject mixed batches.
    let mut platforms = HashSet::new();
    let mut targets = Vec::new();
    for uuid in &body.device_uuids {
        if let Some(e) = state.store.get_apple_enrollment(uuid).await? {
            if !e.enabled {
                return Err(ApiError::unprocessable(format!(
                    "device {} is not MDM enrolled",
                    uuid
                )));
            }
            platforms.insert(Platform::Darwin);
            targets.push((uuid.clone(), Platform::Darwin, Some(e)));
        } else if state.store.get_windows_enrollment(uuid).await?.is_some() {
            platforms.insert(Platform::Windows);
            targets.push((uuid.clone(), Platform::Windows, None));
        } else {
            return Err(ApiError::unprocessable(format!(
                "device {} is not MDM enrolled",
                uuid
            )));
        }
    }
    if platforms.len() > 1 {
        return Err(ApiError::unprocessable(
            "commands in one batch must target a single platform",
        ));
    }
    let platform = platforms.into_iter().next().unwrap_or(Platform::Darwin);

    let (command_uuid, request_type) = match platform {
        Platform::Darwin => apple_commands::parse_raw_command(&payload)
            .map_err(|e| ApiError::unprocessable(e.to_string()))?,
        Platform::Windows => {
            let text = String::from_utf8_lossy(&payload).into_owned();
            syncml::parse_raw_command(&text)
                .map_err(|e| ApiError::unprocessable(e.to_string()))?
        }
        Platform::Linux => return Err(ApiError::unprocessable("unsupported platform")),
    };

    let now = Utc::now();
    let mut push_targets = Vec::new();
    for (uuid, platform, apple) in &targets {
        state
            .store
            .enqueue_command(&Command {
                command_uuid: command_uuid.clone(),
                device_uuid: uuid.clone(),
                platform: *platform,
                request_type: request_type.clone(),
                payload: payload.clone(),
                created_at: now,
            })
            .await
            .map_err(|e| match e {
                shepherd_store::StoreError::DuplicateCommand(u) => {
                    ApiError::conflict(format!("command {} already enqueued", u))
                }
                other => ApiError::from(other),
            })?;
        if let Some(e) = apple {
            if e.active && !e.push_token.is_empty() {
                push_targets.push(PushTarget {
                    device_uuid: e.device_uuid.clone(),
                    push_token: e.push_token.clone(),
                    push_magic: e.push_magic.clone(),
                });
            }
        }
    }

    // Apple targets get a push; Windows drains on its next session.
    if let Some(apns) = &state.apns {
        for (uuid, outcome) in apns.push_all(push_targets).await {
            match outcome {
                PushOutcome::Delivered => {}
                PushOutcome::DeviceError(reason) => {
                    return Err(ApiError::bad_gateway(format!(
                        "APNs rejected push for {}: {}",
                        uuid, reason
                    )))
                }
                PushOutcome::TransportError(reason) => {
                    return Err(ApiError::internal(format!("APNs push failed: {}", reason)))
                }
            }
        }
    }

    Ok(Json(json!({ "command_uuid": command_uuid, "request_type": request_type })))
}

#[derive(Debug, Deserialize)]
pub struct CommandResultsQuery {
    pub command_uuid: String,
}

pub async fn command_results(
    State(state): State<AppState>,
    Query(query): Query<CommandResultsQuery>,
) -> Result<Json<Value>, ApiError> {
    let results: Vec<Value> = state
        .store
        .get_command_results(&query.command_uuid)
        .await?
        .into_iter()
        .map(|r| {
            json!({
                "command_uuid": r.command_uuid,
                "device_uuid": r.device_uuid,
                "status": r.status,
                "result": base64::engine::general_purpose::STANDARD.encode(&r.payload),
                "updated_at": r.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "results": results })))
}

pub async fn list_commands(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let commands: Vec<Value> = state
        .store
        .list_commands(None)
        .await?
        .into_iter()
        .map(|c| {
            json!({
                "command_uuid": c.command_uuid,
                "device_uuid": c.device_uuid,
                "platform": c.platform,
                "request_type": c.request_type,
                "created_at": c.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "commands": commands })))
}

// ── Bootstrap package ─────────────────────────────────────────────────────────

fn valid_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
}

/// Upload a signed `.pkg` for a scope (multipart: optional `team_id`, file
/// field `package`).
pub async fn upload_bootstrap(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let mut team_id: Option<TeamId> = None;
    let mut name = String::new();
    let mut payload: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "team_id" => {
                let text = field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                let id: u64 = text
                    .parse()
                    .map_err(|_| ApiError::unprocessable("invalid team_id"))?;
                team_id = Some(TeamId(id));
            }
            "package" => {
                name = field.file_name().unwrap_or("package.pkg").to_string();
                let bytes = field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                payload = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    if let Some(id) = team_id {
        if state.store.get_team(id).await?.is_none() {
            return Err(ApiError::not_found(format!("team {} not found", id)));
        }
    }
    let payload = payload.ok_or_else(|| ApiError::unprocessable("package file is required"))?;
    if !valid_artifact_name(&name) {
        return Err(ApiError::unprocessable(format!(
            "invalid characters in package name {:?}",
            name
        )));
    }
    if !name.ends_with(".pkg") {
        return Err(ApiError::unprocessable("bootstrap package must be a .pkg"));
    }
    // Signed distribution packages are xar archives.
    if !payload.starts_with(b"xar!") {
        return Err(ApiError::unprocessable(
            "bootstrap package is not a signed installer package",
        ));
    }

    let now = Utc::now();
    let package = BootstrapPackage {
        team_id,
        name: name.clone(),
        sha256: compute_checksum(&payload),
        token: opaque_token(),
        payload,
        uploaded_at: now,
    };
    state.store.put_bootstrap_package(&package).await?;
    state
        .store
        .append_activity(&Activity::AddedBootstrapPackage { at: now, team_id, name })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

/// Capability-token download; no operator auth.
pub async fn download_bootstrap(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let package = state
        .store
        .get_bootstrap_package_by_token(&query.token)
        .await?
        .ok_or_else(|| ApiError::not_found("bootstrap package not found"))?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", package.name),
            ),
        ],
        package.payload,
    )
        .into_response())
}

/// Manifest consumed by `InstallEnterpriseApplication`.
pub async fn bootstrap_manifest(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let package = state
        .store
        .get_bootstrap_package_by_token(&query.token)
        .await?
        .ok_or_else(|| ApiError::not_found("bootstrap package not found"))?;
    let url = format!(
        "{}/mdm/apple/bootstrap?token={}",
        state.server_url, package.token
    );
    let manifest = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0"><dict>
  <key>items</key>
  <array>
    <dict>
      <key>assets</key>
      <array>
        <dict>
          <key>kind</key><string>software-package</string>
          <key>sha256-size</key><integer>32</integer>
          <key>sha256s</key><array><string>{sha}</string></array>
          <key>url</key><string>{url}</string>
        </dict>
      </array>
    </dict>
  </array>
</dict></plist>"#,
        sha = package.sha256,
        url = url,
    );
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        manifest,
    )
        .into_response())
}

pub async fn delete_bootstrap(
    State(state): State<AppState>,
    Query(scope): Query<ScopeQuery>,
) -> Result<StatusCode, ApiError> {
    let team_id = scope.resolve(&state).await?;
    let Some(package) = state.store.get_bootstrap_package(team_id).await? else {
        return Err(ApiError::not_found("no bootstrap package for this scope"));
    };
    state.store.delete_bootstrap_package(team_id).await?;
    state
        .store
        .append_activity(&Activity::DeletedBootstrapPackage {
            at: Utc::now(),
            team_id,
            name: package.name,
        })
        .await?;
    Ok(StatusCode::OK)
}

// ── EULA ──────────────────────────────────────────────────────────────────────

pub async fn upload_eula(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut team_id: Option<TeamId> = None;
    let mut name = String::new();
    let mut payload: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "team_id" => {
                let text = field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                let id: u64 = text
                    .parse()
                    .map_err(|_| ApiError::unprocessable("invalid team_id"))?;
                team_id = Some(TeamId(id));
            }
            "eula" => {
                name = field.file_name().unwrap_or("eula.pdf").to_string();
                let bytes = field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                payload = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let payload = payload.ok_or_else(|| ApiError::unprocessable("eula file is required"))?;
    if !payload.starts_with(b"%PDF") {
        return Err(ApiError::unprocessable("EULA must be a PDF"));
    }
    if !valid_artifact_name(&name) {
        return Err(ApiError::unprocessable(format!(
            "invalid characters in EULA name {:?}",
            name
        )));
    }

    let now = Utc::now();
    let eula = Eula {
        team_id,
        name: name.clone(),
        token: opaque_token(),
        payload,
        created_at: now,
    };
    state.store.put_eula(&eula).await.map_err(|e| match e {
        shepherd_store::StoreError::EulaExists => {
            ApiError::conflict("an EULA already exists for this scope")
        }
        other => ApiError::from(other),
    })?;
    state
        .store
        .append_activity(&Activity::AddedEula { at: now, team_id, name })
        .await?;
    Ok(Json(json!({ "token": eula.token })))
}

pub async fn download_eula(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let eula = state
        .store
        .get_eula_by_token(&token)
        .await?
        .ok_or_else(|| ApiError::not_found("EULA not found"))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf")],
        eula.payload,
    )
        .into_response())
}

pub async fn delete_eula(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    let eula = state
        .store
        .get_eula_by_token(&token)
        .await?
        .ok_or_else(|| ApiError::not_found("EULA not found"))?;
    state.store.delete_eula(&token).await?;
    state
        .store
        .append_activity(&Activity::DeletedEula {
            at: Utc::now(),
            team_id: eula.team_id,
        })
        .await?;
    Ok(StatusCode::OK)
}

// ── Setup assistant ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SetupAssistantBody {
    pub team_id: Option<u64>,
    pub name: String,
    pub enrollment_profile: Value,
}

pub async fn put_setup_assistant(
    State(state): State<AppState>,
    Json(body): Json<SetupAssistantBody>,
) -> Result<Json<Value>, ApiError> {
    let team_id = ScopeQuery { team_id: body.team_id }.resolve(&state).await?;

    // A non-object root is client error, not a server fault.
    let Some(root) = body.enrollment_profile.as_object() else {
        return Err(ApiError::unprocessable(
            "enrollment profile must be a JSON object",
        ));
    };
    for forbidden in ["url", "configuration_web_url"] {
        if root.contains_key(forbidden) {
            return Err(ApiError::unprocessable(format!(
                "enrollment profile may not set {:?}; the server owns it",
                forbidden
            )));
        }
    }

    let now = Utc::now();
    state
        .store
        .put_setup_assistant(&SetupAssistant {
            team_id,
            name: body.name.clone(),
            profile: body.enrollment_profile,
            // Force re-registration against ABM with the new content.
            profile_uuid: None,
            uploaded_at: now,
        })
        .await?;
    state
        .store
        .append_activity(&Activity::ChangedMacosSetupAssistant {
            at: now,
            team_id,
            name: body.name,
        })
        .await?;
    Ok(Json(json!({ "applied": true })))
}

pub async fn get_setup_assistant(
    State(state): State<AppState>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<Value>, ApiError> {
    let team_id = scope.resolve(&state).await?;
    let assistant = state
        .store
        .get_setup_assistant(team_id)
        .await?
        .ok_or_else(|| ApiError::not_found("no setup assistant for this scope"))?;
    Ok(Json(json!({
        "name": assistant.name,
        "enrollment_profile": assistant.profile,
        "uploaded_at": assistant.uploaded_at,
    })))
}

pub async fn delete_setup_assistant(
    State(state): State<AppState>,
    Query(scope): Query<ScopeQuery>,
) -> Result<StatusCode, ApiError> {
    let team_id = scope.resolve(&state).await?;
    state.store.delete_setup_assistant(team_id).await?;
    state
        .store
        .append_activity(&Activity::DeletedMacosSetupAssistant { at: Utc::now(), team_id })
        .await?;
    Ok(StatusCode::OK)
}

// ── Preassign / match ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PreassignBody {
    pub external_host_identifier: String,
    pub host_uuid: String,
    /// Base64 mobileconfig.
    pub profile: String,
    pub group: Option<String>,
    #[serde(default)]
    pub exclude: bool,
}

pub async fn preassign_profile(
    State(state): State<AppState>,
    Json(body): Json<PreassignBody>,
) -> Result<StatusCode, ApiError> {
    let payload = decode_base64_any(&body.profile)?;
    match_flow::preassign(
        state.store.as_ref(),
        match_flow::PreassignRequest {
            external_host_id: body.external_host_identifier,
            host_uuid: body.host_uuid,
            profile: payload,
            group_label: body.group,
            exclude: body.exclude,
        },
    )
    .await
    .map_err(|e| ApiError::unprocessable(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MatchBody {
    pub external_host_identifier: String,
}

pub async fn match_profiles(
    State(state): State<AppState>,
    Json(body): Json<MatchBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome =
        match_flow::match_profiles(state.store.as_ref(), &body.external_host_identifier).await?;
    Ok(Json(json!({
        "team_id": outcome.team_id.0,
        "team_name": outcome.team_name,
        "profiles_changed": outcome.profiles_changed,
        "host_moved": outcome.host_moved,
    })))
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ConfigPatch {
    pub apple_mdm_enabled: Option<bool>,
    pub windows_mdm_enabled: Option<bool>,
    pub enable_disk_encryption: Option<bool>,
    pub enroll_secret: Option<String>,
    pub end_user_auth_enabled: Option<bool>,
    pub apple_bm_default_team: Option<u64>,
    pub macos_updates: Option<NudgeConfig>,
    pub mdm_migration_webhook_url: Option<String>,
}

pub async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> Result<Json<Value>, ApiError> {
    let mut settings = state.store.get_settings().await?;
    let was_disk_encryption = settings.enable_disk_encryption;

    if let Some(v) = patch.apple_mdm_enabled {
        settings.apple_mdm_enabled = v;
    }
    if let Some(v) = patch.windows_mdm_enabled {
        settings.windows_mdm_enabled = v;
    }
    if let Some(v) = patch.enable_disk_encryption {
        settings.enable_disk_encryption = v;
    }
    if let Some(v) = patch.enroll_secret {
        settings.enroll_secret = v;
    }
    if let Some(v) = patch.end_user_auth_enabled {
        settings.end_user_auth_enabled = v;
    }
    if let Some(v) = patch.apple_bm_default_team {
        let team_id = TeamId(v);
        if state.store.get_team(team_id).await?.is_none() {
            return Err(ApiError::unprocessable(format!("team {} not found", v)));
        }
        settings.apple_bm_default_team = Some(team_id);
    }
    if let Some(v) = patch.macos_updates {
        settings.macos_updates = Some(v);
    }
    if let Some(v) = patch.mdm_migration_webhook_url {
        settings.mdm_migration_webhook_url = if v.is_empty() { None } else { Some(v) };
    }

    // Turning disk encryption ON requires at least one MDM stack; turning
    // MDM off while it is already on keeps the stored intent.
    let enabling_disk_encryption = !was_disk_encryption && settings.enable_disk_encryption;
    if enabling_disk_encryption && !settings.apple_mdm_enabled && !settings.windows_mdm_enabled {
        return Err(ApiError::unprocessable(
            "disk encryption requires Apple or Windows MDM to be enabled",
        ));
    }

    state.store.put_settings(&settings).await?;
    let now = Utc::now();
    if !was_disk_encryption && settings.enable_disk_encryption {
        state
            .store
            .append_activity(&Activity::EnabledDiskEncryption { at: now, team_id: None })
            .await?;
    } else if was_disk_encryption && !settings.enable_disk_encryption {
        state
            .store
            .append_activity(&Activity::DisabledDiskEncryption { at: now, team_id: None })
            .await?;
    }
    Ok(Json(json!({ "applied": true })))
}

#[derive(Debug, Deserialize)]
pub struct TeamPatch {
    pub name: Option<String>,
    pub enroll_secret: Option<String>,
    pub enable_disk_encryption: Option<bool>,
    pub macos_updates: Option<NudgeConfig>,
}

pub async fn patch_team(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(patch): Json<TeamPatch>,
) -> Result<Json<Value>, ApiError> {
    let mut team = state
        .store
        .get_team(TeamId(id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("team {} not found", id)))?;
    let was_disk_encryption = team.enable_disk_encryption;

    if let Some(name) = patch.name {
        team.name = name;
    }
    if let Some(secret) = patch.enroll_secret {
        team.enroll_secret = secret;
    }
    if let Some(v) = patch.enable_disk_encryption {
        team.enable_disk_encryption = v;
    }
    if let Some(v) = patch.macos_updates {
        team.macos_updates = Some(v);
    }

    if !was_disk_encryption && team.enable_disk_encryption {
        let settings = state.store.get_settings().await?;
        if !settings.apple_mdm_enabled && !settings.windows_mdm_enabled {
            return Err(ApiError::unprocessable(
                "disk encryption requires Apple or Windows MDM to be enabled",
            ));
        }
    }

    state.store.update_team(&team).await?;
    let now = Utc::now();
    if !was_disk_encryption && team.enable_disk_encryption {
        state
            .store
            .append_activity(&Activity::EnabledDiskEncryption {
                at: now,
                team_id: Some(team.id),
            })
            .await?;
    } else if was_disk_encryption && !team.enable_disk_encryption {
        state
            .store
            .append_activity(&Activity::DisabledDiskEncryption {
                at: now,
                team_id: Some(team.id),
            })
            .await?;
    }
    Ok(Json(json!({ "team": { "id": team.id.0, "name": team.name } })))
}

#[derive(Debug, Deserialize)]
pub struct TeamSpecBody {
    pub name: String,
}

pub async fn create_team(
    State(state): State<AppState>,
    Json(body): Json<TeamSpecBody>,
) -> Result<Json<Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::unprocessable("team name must not be empty"));
    }
    let team = match state.store.get_team_by_name(&body.name).await? {
        Some(existing) => existing,
        None => state.store.create_team(&body.name).await?,
    };
    Ok(Json(json!({ "team": { "id": team.id.0, "name": team.name } })))
}

// ── Host transfer ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    pub team_id: Option<u64>,
    pub host_ids: Vec<u64>,
}

/// Move hosts between teams. ABM-sourced devices get re-registered against
/// the destination team's enrollment profile; profile deltas flow through
/// the next reconcile pass.
pub async fn transfer_hosts(
    State(state): State<AppState>,
    Json(body): Json<TransferBody>,
) -> Result<Json<Value>, ApiError> {
    let team_id = ScopeQuery { team_id: body.team_id }.resolve(&state).await?;
    let mut moved = 0;
    for id in body.host_ids {
        let Some(host) = state.store.get_host(HostId(id)).await? else {
            return Err(ApiError::not_found(format!("host {} not found", id)));
        };
        state.store.set_host_team(host.id, team_id).await?;
        moved += 1;

        if host.platform == Platform::Darwin {
            if let Some(abm) = &state.abm {
                let assigned = state
                    .store
                    .get_dep_assignment(&host.serial)
                    .await?
                    .map(|a| a.deleted_at.is_none())
                    .unwrap_or(false);
                if assigned {
                    let settings = state.store.get_settings().await?;
                    let urls = state.profile_urls(&settings.enroll_profile_token);
                    if let Err(e) =
                        reassign_device_team(state.store.as_ref(), abm, &urls, &host.serial, team_id)
                            .await
                    {
                        warn!(host_id = id, error = %e, "ABM re-registration failed");
                    }
                }
            }
        }
    }
    Ok(Json(json!({ "moved": moved })))
}

// ── Administrative unenroll ───────────────────────────────────────────────────

/// Hard-delete an Apple enrollment (the administrative path). The device is
/// told to drop its management payload first; an unacknowledged push turns
/// into a gateway timeout for the caller.
pub async fn unenroll_host(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let host = state
        .store
        .get_host(HostId(id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("host {} not found", id)))?;
    let enrollment = state
        .store
        .get_apple_enrollment(&host.uuid)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("host {} is not MDM enrolled", id)))?;

    let cmd = apple_commands::remove_profile("com.shepherd.mdm.enroll")
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state
        .store
        .enqueue_command(&Command {
            command_uuid: cmd.command_uuid,
            device_uuid: host.uuid.clone(),
            platform: Platform::Darwin,
            request_type: cmd.request_type.to_string(),
            payload: cmd.payload,
            created_at: Utc::now(),
        })
        .await?;

    if let Some(apns) = &state.apns {
        if enrollment.active && !enrollment.push_token.is_empty() {
            let outcomes = apns
                .push_all(vec![PushTarget {
                    device_uuid: enrollment.device_uuid.clone(),
                    push_token: enrollment.push_token.clone(),
                    push_magic: enrollment.push_magic.clone(),
                }])
                .await;
            match outcomes.into_iter().next().map(|(_, o)| o) {
                Some(PushOutcome::Delivered) | None => {}
                Some(PushOutcome::DeviceError(reason)) => {
                    return Err(ApiError::bad_gateway(format!("APNs rejected push: {}", reason)))
                }
                Some(PushOutcome::TransportError(reason)) => {
                    return Err(ApiError::gateway_timeout(format!(
                        "no APNs acknowledgment: {}",
                        reason
                    )))
                }
            }
        }
    }

    state.store.delete_apple_enrollment(&host.uuid).await?;
    state
        .store
        .append_activity(&Activity::MdmUnenrolled {
            at: Utc::now(),
            host_uuid: host.uuid,
            platform: Platform::Darwin,
        })
        .await?;
    Ok(StatusCode::OK)
}

// ── Escrowed keys ─────────────────────────────────────────────────────────────

pub async fn read_encryption_key(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let host = state
        .store
        .get_host(HostId(id))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("host {} not found", id)))?;
    let cas = escrow::EscrowCas {
        scep: &state.scep_ca,
        wstep: &state.wstep_ca,
    };
    let key = escrow::read_key(state.store.as_ref(), &cas, &host, "operator")
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(Json(json!({ "host_id": id, "encryption_key": key })))
}

// ── Schedules ─────────────────────────────────────────────────────────────────

pub async fn trigger_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let schedule = state
        .schedules
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("schedule {:?} not found", name)))?;
    let outcome = schedule
        .trigger()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "schedule": name, "outcome": outcome })))
}

// ── Status & activities ───────────────────────────────────────────────────────

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let hosts = state.store.list_hosts().await?;
    let mut by_platform: HashMap<String, usize> = HashMap::new();
    for host in &hosts {
        *by_platform.entry(host.platform.to_string()).or_default() += 1;
    }

    let apple_enrollments = state.store.list_apple_enrollments().await?;
    let windows_enrollments = state.store.list_windows_enrollments().await?;

    let rows = state.store.list_all_host_profiles().await?;
    let mut profiles_by_status: HashMap<String, usize> = HashMap::new();
    for row in &rows {
        *profiles_by_status.entry(row.status.to_string()).or_default() += 1;
    }

    Ok(Json(json!({
        "host_count": hosts.len(),
        "hosts_by_platform": by_platform,
        "apple_enrollments": apple_enrollments.iter().filter(|e| e.enabled).count(),
        "windows_enrollments": windows_enrollments.len(),
        "profiles_by_status": profiles_by_status,
        "abm_terms_expired": state.store.abm_terms_expired().await?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ActivitiesQuery {
    pub limit: Option<u32>,
}

pub async fn list_activities(
    State(state): State<AppState>,
    Query(query): Query<ActivitiesQuery>,
) -> Result<Json<Value>, ApiError> {
    let activities = state
        .store
        .list_activities(query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!({ "activities": activities })))
}

// ── Installed-profile report (inventory sink) ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProfileReportBody {
    pub host_uuid: String,
    pub installed_profile_identifiers: Vec<String>,
}

/// Inventory-side observation: which profiles are actually installed.
pub async fn report_installed_profiles(
    State(state): State<AppState>,
    Json(body): Json<ProfileReportBody>,
) -> Result<StatusCode, ApiError> {
    shepherd_reconciler::observe::ingest_installed_profiles(
        state.store.as_ref(),
        &body.host_uuid,
        &body.installed_profile_identifiers,
        Utc::now(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
