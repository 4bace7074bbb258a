use serde::Serialize;
use shepherd_domain::TeamId;

/// One planned change, for operator visibility and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    InstallPlanned {
        host_uuid: String,
        profile_identifier: String,
    },
    RemovePlanned {
        host_uuid: String,
        profile_identifier: String,
    },
    ManagedProfileRefreshed {
        team_id: Option<TeamId>,
        profile_identifier: String,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub hosts_seen: usize,
    pub commands_enqueued: usize,
    pub pushes_sent: usize,
    pub changes: Vec<Change>,
    /// Per-host errors; one bad host never aborts the pass.
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn new() -> Self {
        Self::default()
    }
}
