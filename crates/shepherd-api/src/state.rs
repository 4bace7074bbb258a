use std::collections::HashMap;
use std::sync::Arc;

use shepherd_abm::{AbmClient, ProfileUrls};
use shepherd_apple::ApnsClient;
use shepherd_pki::{CertificateAuthority, ScepServer};
use shepherd_store::Store;
use shepherd_worker::Schedule;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scep: Arc<ScepServer>,
    pub scep_ca: Arc<CertificateAuthority>,
    pub wstep_ca: Arc<CertificateAuthority>,
    pub apns: Option<Arc<ApnsClient>>,
    pub abm: Option<Arc<AbmClient>>,
    /// Public base URL, no trailing slash.
    pub server_url: Arc<String>,
    pub api_token: Arc<String>,
    pub scep_challenge: Arc<String>,
    /// APNs topic of the push certificate; rendered into enrollment profiles.
    pub apns_topic: Arc<String>,
    pub http: reqwest::Client,
    /// Named schedules exposed through the trigger endpoint.
    pub schedules: Arc<HashMap<String, Schedule>>,
    pub organization: Arc<String>,
}

impl AppState {
    pub fn profile_urls(&self, enroll_token: &str) -> ProfileUrls {
        ProfileUrls {
            enroll_url: format!("{}/mdm/apple/enroll?token={}", self.server_url, enroll_token),
        }
    }
}
