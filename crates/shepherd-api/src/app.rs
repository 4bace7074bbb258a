use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers::{self, apple, operator, orbit, windows};
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    // Device- and host-facing surface: authenticated by client certs, node
    // keys, and capability tokens.
    let device = Router::new()
        // Apple wire
        .route("/mdm/apple/checkin", post(apple::checkin).put(apple::checkin))
        .route("/mdm/apple/server", post(apple::server).put(apple::server))
        .route("/mdm/apple/scep", get(apple::scep_get).post(apple::scep_post))
        .route("/mdm/apple/enroll", get(apple::enroll))
        .route("/mdm/sso/callback", get(apple::sso_callback))
        // Capability-token downloads
        .route("/mdm/apple/bootstrap", get(operator::download_bootstrap))
        .route("/mdm/apple/bootstrap/manifest", get(operator::bootstrap_manifest))
        .route("/mdm/apple/setup/eula/:token", get(operator::download_eula))
        // Windows wire
        .route("/EnrollmentServer/Discovery.svc", post(windows::discovery))
        .route("/EnrollmentServer/Policy.svc", post(windows::policy))
        .route("/EnrollmentServer/Enrollment.svc", post(windows::enrollment))
        .route("/ManagementServer/Manage.svc", post(windows::management))
        .route("/EnrollmentServer/Authenticate.svc", get(windows::authenticate))
        .route("/EnrollmentServer/TOS.svc", get(windows::tos))
        // Agent-updater
        .route("/orbit/config", post(orbit::orbit_config))
        .route("/orbit/disk_encryption_key", post(orbit::submit_disk_encryption_key))
        .route("/orbit/profiles_report", post(orbit::orbit_profiles_report))
        .route("/device/:token/migrate_mdm", post(orbit::migrate_mdm));

    // Operator surface behind the bearer token.
    let operator_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/status", get(operator::status))
        .route("/activities", get(operator::list_activities))
        // Profiles
        .route("/mdm/apple/profiles/batch", post(operator::batch_profiles))
        .route("/mdm/apple/profiles", get(operator::list_profiles))
        .route("/mdm/apple/profiles/preassign", post(operator::preassign_profile))
        .route("/mdm/apple/profiles/match", post(operator::match_profiles))
        // Command pipeline
        .route("/mdm/commands/run", post(operator::run_command))
        .route("/mdm/apple/enqueue", post(operator::run_command))
        .route("/mdm/commandresults", get(operator::command_results))
        .route("/mdm/apple/commands", get(operator::list_commands))
        // Bootstrap package / EULA / setup assistant
        .route(
            "/mdm/apple/bootstrap",
            post(operator::upload_bootstrap).delete(operator::delete_bootstrap),
        )
        .route("/mdm/apple/setup/eula", post(operator::upload_eula))
        .route("/mdm/apple/setup/eula/:token", delete(operator::delete_eula))
        .route(
            "/mdm/apple/enrollment_profile",
            post(operator::put_setup_assistant)
                .get(operator::get_setup_assistant)
                .delete(operator::delete_setup_assistant),
        )
        // Configuration
        .route("/config", patch(operator::patch_config))
        .route("/teams/:id", patch(operator::patch_team))
        .route("/spec/teams", post(operator::create_team))
        .route("/hosts/transfer", post(operator::transfer_hosts))
        .route("/hosts/report/profiles", post(operator::report_installed_profiles))
        .route("/hosts/:id/encryption_key", get(operator::read_encryption_key))
        .route("/hosts/:id/mdm", delete(operator::unenroll_host))
        // Schedules
        .route("/schedules/:name/trigger", post(operator::trigger_schedule))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer_token,
        ));

    device
        .merge(operator_router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
