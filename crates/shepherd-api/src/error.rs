use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNAUTHORIZED, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, message: msg.into() }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNPROCESSABLE_ENTITY, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_GATEWAY, message: msg.into() }
    }

    pub fn gateway_timeout(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::GATEWAY_TIMEOUT, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<shepherd_store::StoreError> for ApiError {
    fn from(e: shepherd_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<shepherd_reconciler::ReconcileError> for ApiError {
    fn from(e: shepherd_reconciler::ReconcileError) -> Self {
        use shepherd_reconciler::ReconcileError as E;
        match e {
            E::HostNotEnrolled(_) => ApiError::bad_request(e.to_string()),
            E::NoPreassignedProfiles(_) => ApiError::not_found(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<shepherd_pki::PkiError> for ApiError {
    fn from(e: shepherd_pki::PkiError) -> Self {
        match e {
            shepherd_pki::PkiError::BadChallenge => ApiError::unauthorized(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<shepherd_abm::AbmError> for ApiError {
    fn from(e: shepherd_abm::AbmError) -> Self {
        ApiError::bad_gateway(e.to_string())
    }
}
