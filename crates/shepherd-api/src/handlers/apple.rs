//! Device-facing Apple endpoints: SCEP, check-in, commands, enrollment
//! profile, SSO callback.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use chrono::Utc;
use serde::Deserialize;
use shepherd_apple::enroll_profile::{enrollment_profile, EnrollProfileParams};
use shepherd_apple::{
    process_checkin, process_command_report, AppleError, CheckinOutcome,
    ENROLL_PROFILE_CONTENT_TYPE,
};
use shepherd_pki::ca;
use shepherd_pki::scep::{CA_CERT_CONTENT_TYPE, PKI_OPERATION_CONTENT_TYPE};
use shepherd_reconciler::{enrollment, observe};
use shepherd_store::Store;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AppState;

/// SHA-256 of the client certificate forwarded by the TLS terminator.
fn presented_fingerprint(headers: &HeaderMap) -> Option<String> {
    for name in ["x-ssl-client-cert", "x-client-cert", "ssl-client-cert"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            match ca::client_cert_der(value) {
                Ok(der) => return Some(ca::fingerprint(&der)),
                Err(e) => {
                    warn!(header = name, error = %e, "unparseable client cert header");
                    return None;
                }
            }
        }
    }
    None
}

fn map_checkin_error(e: AppleError) -> ApiError {
    match e {
        AppleError::CertMismatch => ApiError::unauthorized(e.to_string()),
        // Missing association during a check-in is a server-side
        // inconsistency, not client error.
        AppleError::MissingCertAssociation(_) => ApiError::internal(e.to_string()),
        AppleError::NotEnrolled(_) => ApiError::unauthorized(e.to_string()),
        AppleError::Plist(_) | AppleError::MissingField(_) => ApiError::bad_request(e.to_string()),
        other => ApiError::internal(other.to_string()),
    }
}

// ── Check-in ──────────────────────────────────────────────────────────────────

pub async fn checkin(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let fingerprint = presented_fingerprint(&headers);
    let outcome = process_checkin(state.store.as_ref(), &body, fingerprint.as_deref())
        .await
        .map_err(map_checkin_error)?;

    match outcome {
        CheckinOutcome::Handled => Ok(StatusCode::OK.into_response()),
        CheckinOutcome::Body(body) => Ok((StatusCode::OK, body).into_response()),
        CheckinOutcome::Enrolled {
            device_uuid,
            first_token_update,
            awaiting_configuration,
        } => {
            if first_token_update {
                debug!(device_uuid, awaiting_configuration, "scheduling post-enrollment work");
                enrollment::schedule_post_enrollment(state.store.as_ref(), &device_uuid).await?;
            }
            Ok(StatusCode::OK.into_response())
        }
    }
}

// ── Command endpoint ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ServerQuery {
    pub enrollment_reference: Option<String>,
}

pub async fn server(
    State(state): State<AppState>,
    Query(query): Query<ServerQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let fingerprint = presented_fingerprint(&headers);
    let outcome = process_command_report(state.store.as_ref(), &body, fingerprint.as_deref())
        .await
        .map_err(map_checkin_error)?;

    // Bind the IdP reference carried on the ServerURL to the enrollment.
    if let Some(reference) = &query.enrollment_reference {
        if let Some(mut e) = state.store.get_apple_enrollment(&outcome.device_uuid).await? {
            if e.enrollment_reference.as_deref() != Some(reference) {
                e.enrollment_reference = Some(reference.clone());
                state.store.upsert_apple_enrollment(&e).await?;
            }
        }
    }

    if let Some((command_uuid, status, error_detail)) = &outcome.settled {
        observe::handle_command_result(
            state.store.as_ref(),
            command_uuid,
            status,
            error_detail.as_deref(),
            Utc::now(),
        )
        .await?;
    }

    match outcome.next_command_payload {
        Some(payload) => Ok((StatusCode::OK, payload).into_response()),
        None => Ok(StatusCode::OK.into_response()),
    }
}

// ── SCEP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ScepQuery {
    pub operation: Option<String>,
    pub challenge: Option<String>,
}

pub async fn scep_get(
    State(state): State<AppState>,
    Query(query): Query<ScepQuery>,
) -> Result<Response, ApiError> {
    match query.operation.as_deref() {
        Some("GetCACert") => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, CA_CERT_CONTENT_TYPE)],
            state.scep.ca_cert_der(),
        )
            .into_response()),
        Some("GetCACaps") => Ok((StatusCode::OK, state.scep.ca_caps()).into_response()),
        other => Err(ApiError::bad_request(format!(
            "unsupported SCEP operation: {:?}",
            other.unwrap_or("")
        ))),
    }
}

pub async fn scep_post(
    State(state): State<AppState>,
    Query(query): Query<ScepQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let challenge = query.challenge.unwrap_or_default();
    let issued = state.scep.issue(&body, &challenge)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, PKI_OPERATION_CONTENT_TYPE)],
        issued.cert_der,
    )
        .into_response())
}

// ── Enrollment profile ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EnrollQuery {
    pub token: Option<String>,
    pub enrollment_reference: Option<String>,
}

pub async fn enroll(
    State(state): State<AppState>,
    Query(query): Query<EnrollQuery>,
) -> Result<Response, ApiError> {
    let settings = state.store.get_settings().await?;
    let token = query.token.unwrap_or_default();
    if settings.enroll_profile_token.is_empty() || token != settings.enroll_profile_token {
        return Err(ApiError::unauthorized("invalid enrollment token"));
    }

    let profile = enrollment_profile(&EnrollProfileParams {
        server_url: state.server_url.to_string(),
        scep_challenge: state.scep_challenge.to_string(),
        topic: state.apns_topic.to_string(),
        organization: state.organization.to_string(),
        enrollment_reference: query.enrollment_reference,
    })
    .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, ENROLL_PROFILE_CONTENT_TYPE),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        profile,
    )
        .into_response())
}

// ── SSO callback ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SsoCallbackQuery {
    pub subject: String,
    pub username: String,
    pub fullname: String,
}

/// IdP return leg of the SSO-gated enrollment flow. The same subject always
/// receives the same enrollment reference; the reference, the profile token,
/// and (if present) an EULA token ride the redirect query string.
pub async fn sso_callback(
    State(state): State<AppState>,
    Query(query): Query<SsoCallbackQuery>,
) -> Result<Redirect, ApiError> {
    let account = state
        .store
        .upsert_idp_account(&shepherd_domain::IdpAccount {
            subject: query.subject,
            username: query.username,
            fullname: query.fullname,
            enrollment_reference: shepherd_pki::opaque_token(),
        })
        .await?;

    let settings = state.store.get_settings().await?;
    let mut location = format!(
        "{}/mdm/sso/done?enrollment_reference={}&profile_token={}",
        state.server_url, account.enrollment_reference, settings.enroll_profile_token,
    );
    if let Some(eula) = state.store.get_eula(None).await? {
        location.push_str(&format!("&eula_token={}", eula.token));
    }
    Ok(Redirect::temporary(&location))
}
