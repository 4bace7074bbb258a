pub mod apple;
pub mod operator;
pub mod orbit;
pub mod windows;

use axum::extract::State;
use axum::http::StatusCode;
use shepherd_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.list_hosts().await?;
    Ok(StatusCode::OK)
}
