//! Agent-updater (orbit) API: config notifications, disk-encryption key
//! escrow, and the MDM migration trigger.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shepherd_domain::{Decryptable, Host, NudgeConfig, Platform};
use shepherd_reconciler::{enrollment, escrow};
use shepherd_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

async fn host_by_orbit_key(state: &AppState, key: &str) -> Result<Host, ApiError> {
    state
        .store
        .get_host_by_orbit_node_key(key)
        .await?
        .ok_or_else(|| ApiError::unauthorized("invalid orbit node key"))
}

// ── /orbit/config ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OrbitConfigBody {
    pub orbit_node_key: String,
}

#[derive(Debug, Default, Serialize)]
pub struct Notifications {
    pub needs_programmatic_windows_mdm_enrollment: bool,
    pub needs_programmatic_windows_mdm_unenrollment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows_mdm_discovery_endpoint: Option<String>,
    pub renew_enrollment_profile: bool,
    pub needs_mdm_migration: bool,
    pub enforce_bitlocker_encryption: bool,
    pub rotate_disk_encryption_key: bool,
}

pub async fn orbit_config(
    State(state): State<AppState>,
    Json(body): Json<OrbitConfigBody>,
) -> Result<Json<Value>, ApiError> {
    let host = host_by_orbit_key(&state, &body.orbit_node_key).await?;
    let settings = state.store.get_settings().await?;
    let mut notifications = Notifications::default();
    let mut nudge_config: Option<NudgeConfig> = None;

    match host.platform {
        Platform::Windows => {
            let enrollment = state
                .store
                .get_windows_enrollment_by_host_uuid(&host.uuid)
                .await?;
            if settings.windows_mdm_enabled && enrollment.is_none() {
                notifications.needs_programmatic_windows_mdm_enrollment = true;
                notifications.windows_mdm_discovery_endpoint = Some(format!(
                    "{}/EnrollmentServer/Discovery.svc",
                    state.server_url
                ));
            }
            // Enrolled against this very server with MDM switched off: steer
            // the agent toward unenrollment so operators can revert.
            if !settings.windows_mdm_enabled && enrollment.is_some() {
                notifications.needs_programmatic_windows_mdm_unenrollment = true;
            }

            let disk_encryption = match host.team_id {
                Some(team_id) => state
                    .store
                    .get_team(team_id)
                    .await?
                    .map(|t| t.enable_disk_encryption)
                    .unwrap_or(false),
                None => settings.enable_disk_encryption,
            };
            if disk_encryption {
                let key = state.store.get_disk_encryption_key(host.id).await?;
                let verified = key
                    .as_ref()
                    .map(|k| k.encrypted.is_some() && k.decryptable == Decryptable::Yes)
                    .unwrap_or(false);
                if !verified {
                    notifications.enforce_bitlocker_encryption = true;
                }
                if key.map(|k| k.decryptable == Decryptable::No).unwrap_or(false) {
                    notifications.rotate_disk_encryption_key = true;
                }
            }
        }
        Platform::Darwin => {
            let enrollment = state.store.get_apple_enrollment(&host.uuid).await?;
            let enrolled_here = enrollment.as_ref().map(|e| e.enabled).unwrap_or(false);
            // A soft-disabled enrollment asks the agent for a fresh profile.
            notifications.renew_enrollment_profile =
                enrollment.map(|e| !e.enabled).unwrap_or(false);

            let dep_assigned = state
                .store
                .get_dep_assignment(&host.serial)
                .await?
                .map(|a| a.deleted_at.is_none())
                .unwrap_or(false);
            notifications.needs_mdm_migration = dep_assigned
                && !enrolled_here
                && settings.mdm_migration_webhook_url.is_some()
                && !host.is_server;

            let key = state.store.get_disk_encryption_key(host.id).await?;
            if key.map(|k| k.decryptable == Decryptable::No).unwrap_or(false) {
                notifications.rotate_disk_encryption_key = true;
            }

            nudge_config = match host.team_id {
                Some(team_id) => state
                    .store
                    .get_team(team_id)
                    .await?
                    .and_then(|t| t.macos_updates),
                None => settings.macos_updates.clone(),
            };
        }
        Platform::Linux => {}
    }

    Ok(Json(json!({
        "notifications": notifications,
        "nudge_config": nudge_config,
    })))
}

// ── /orbit/disk_encryption_key ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DiskEncryptionKeyBody {
    pub orbit_node_key: String,
    pub encryption_key: Option<String>,
    pub client_error: Option<String>,
}

pub async fn submit_disk_encryption_key(
    State(state): State<AppState>,
    Json(body): Json<DiskEncryptionKeyBody>,
) -> Result<StatusCode, ApiError> {
    let host = host_by_orbit_key(&state, &body.orbit_node_key).await?;
    let cas = escrow::EscrowCas {
        scep: &state.scep_ca,
        wstep: &state.wstep_ca,
    };
    let now = Utc::now();

    match (body.encryption_key, body.client_error) {
        (Some(key), _) if !key.is_empty() => {
            escrow::submit_key(state.store.as_ref(), &cas, &host, &key, now).await?;
        }
        (_, Some(error)) if !error.is_empty() => {
            escrow::submit_client_error(state.store.as_ref(), &host, &error, now).await?;
        }
        _ => {
            return Err(ApiError::unprocessable(
                "either encryption_key or client_error is required",
            ))
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── /orbit/profiles_report ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OrbitProfilesReportBody {
    pub orbit_node_key: String,
    pub installed_profile_identifiers: Vec<String>,
}

pub async fn orbit_profiles_report(
    State(state): State<AppState>,
    Json(body): Json<OrbitProfilesReportBody>,
) -> Result<StatusCode, ApiError> {
    let host = host_by_orbit_key(&state, &body.orbit_node_key).await?;
    shepherd_reconciler::observe::ingest_installed_profiles(
        state.store.as_ref(),
        &host.uuid,
        &body.installed_profile_identifiers,
        Utc::now(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── /device/:token/migrate_mdm ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct MigrateBody {
    #[serde(default)]
    pub enrolled_in_third_party_mdm: bool,
}

pub async fn migrate_mdm(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<MigrateBody>,
) -> Result<StatusCode, ApiError> {
    let host = host_by_orbit_key(&state, &token).await?;
    let decision = enrollment::request_migration(
        state.store.as_ref(),
        &state.http,
        &host,
        body.enrolled_in_third_party_mdm,
        Utc::now(),
    )
    .await
    .map_err(|e| ApiError::bad_gateway(e.to_string()))?;

    match decision {
        enrollment::MigrationDecision::Sent | enrollment::MigrationDecision::Cooldown => {
            Ok(StatusCode::ACCEPTED)
        }
        enrollment::MigrationDecision::NotEligible(reason) => {
            Err(ApiError::bad_request(reason))
        }
    }
}
