//! Device-facing Windows endpoints: the MS-MDE2 SOAP services and the SyncML
//! management session.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use shepherd_windows::soap::soap_fault;
use shepherd_windows::{
    process_discovery, process_enrollment, process_management, process_policy, WindowsError,
    SOAP_CONTENT_TYPE, SYNCML_CONTENT_TYPE,
};
use tracing::warn;

use crate::state::AppState;

fn soap_response(xml: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, SOAP_CONTENT_TYPE)],
        xml,
    )
        .into_response()
}

fn fault_response(e: WindowsError) -> Response {
    warn!(error = %e, "windows MDM request failed");
    let (code, reason) = match &e {
        WindowsError::Fault { code, reason } => (*code, reason.clone()),
        other => ("s:Receiver", other.to_string()),
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, SOAP_CONTENT_TYPE)],
        soap_fault(code, &reason, None),
    )
        .into_response()
}

pub async fn discovery(State(state): State<AppState>, body: String) -> Response {
    match process_discovery(&state.server_url, &body) {
        Ok(xml) => soap_response(xml),
        Err(e) => fault_response(e),
    }
}

pub async fn policy(State(state): State<AppState>, body: String) -> Response {
    match process_policy(state.store.as_ref(), &body).await {
        Ok(xml) => soap_response(xml),
        Err(e) => fault_response(e),
    }
}

pub async fn enrollment(State(state): State<AppState>, body: String) -> Response {
    match process_enrollment(state.store.as_ref(), &state.wstep_ca, &state.server_url, &body).await
    {
        Ok(xml) => soap_response(xml),
        Err(e) => fault_response(e),
    }
}

pub async fn management(State(state): State<AppState>, body: String) -> Response {
    match process_management(state.store.as_ref(), &state.server_url, &body).await {
        Ok(outcome) => {
            // Profile commands settle through the shared observation path.
            for (command_uuid, status) in &outcome.settled {
                if let Err(e) = shepherd_reconciler::observe::handle_command_result(
                    state.store.as_ref(),
                    command_uuid,
                    status,
                    None,
                    chrono::Utc::now(),
                )
                .await
                {
                    warn!(command_uuid, error = %e, "failed to settle command result");
                }
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, SYNCML_CONTENT_TYPE)],
                outcome.response,
            )
                .into_response()
        }
        Err(e) => fault_response(e),
    }
}

/// Federated-auth page for automatic enrollment: posts the IdP token back to
/// the native enrollment client.
pub async fn authenticate(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Shepherd MDM enrollment</title></head>
<body>
<form method="post" action="ms-app://windows.immersivecontrolpanel">
  <p>Sign in to continue enrolling this device.</p>
  <input type="hidden" name="wresult" value="" id="token"/>
  <input type="submit" value="Continue"/>
</form>
<p><a href="{}/EnrollmentServer/TOS.svc">Terms of service</a></p>
</body>
</html>"#,
        state.server_url
    ))
}

pub async fn tos() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Terms of service</title></head>
<body>
<h1>Terms of service</h1>
<p>This device will be managed by your organization.</p>
<form method="post" action="ms-app://windows.immersivecontrolpanel">
  <input type="hidden" name="IsAccepted" value="true"/>
  <input type="submit" value="Accept"/>
</form>
</body>
</html>"#,
    )
}
