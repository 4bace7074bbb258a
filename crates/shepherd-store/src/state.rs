use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use shepherd_domain::{HostId, Platform, TeamId};
use uuid::Uuid;

// ── Checksums ─────────────────────────────────────────────────────────────────

/// SHA-256 hex digest of a profile payload. Drives drift detection: the
/// reconciler re-plans an install when the desired checksum differs from the
/// one recorded on the host row.
pub fn compute_checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    hex::encode(digest)
}

// ── Host seed ─────────────────────────────────────────────────────────────────

/// Identity fields used to find-or-create a host. The store matches by
/// hardware UUID first, then serial; hostname and platform refresh on every
/// upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSeed {
    pub uuid: String,
    pub serial: String,
    pub hostname: String,
    pub platform: Platform,
}

// ── Observations ──────────────────────────────────────────────────────────────

/// Latest observed set of installed profile identifiers for a host, as
/// reported by the inventory pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledProfiles {
    pub host_uuid: String,
    pub identifiers: Vec<String>,
    pub reported_at: DateTime<Utc>,
}

// ── Durable jobs ──────────────────────────────────────────────────────────────

/// A one-shot background job. Delivery is at-least-once; handlers must be
/// idempotent on `(kind, args)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub args: Value,
    pub retries: u32,
    pub not_before: DateTime<Utc>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Activity feed ─────────────────────────────────────────────────────────────

/// Operator-visible audit records. The MDM subsystem treats this as a sink;
/// it is read back only through the activities API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activity {
    MdmEnrolled {
        at: DateTime<Utc>,
        host_uuid: String,
        platform: Platform,
    },
    MdmUnenrolled {
        at: DateTime<Utc>,
        host_uuid: String,
        platform: Platform,
    },
    EditedProfiles {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
        platform: Platform,
    },
    EnabledDiskEncryption {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
    },
    DisabledDiskEncryption {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
    },
    ReadHostDiskEncryptionKey {
        at: DateTime<Utc>,
        host_id: HostId,
        reader: String,
    },
    AddedBootstrapPackage {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
        name: String,
    },
    DeletedBootstrapPackage {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
        name: String,
    },
    ChangedMacosSetupAssistant {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
        name: String,
    },
    DeletedMacosSetupAssistant {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
    },
    AddedEula {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
        name: String,
    },
    DeletedEula {
        at: DateTime<Utc>,
        team_id: Option<TeamId>,
    },
}

impl Activity {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Activity::MdmEnrolled { at, .. }
            | Activity::MdmUnenrolled { at, .. }
            | Activity::EditedProfiles { at, .. }
            | Activity::EnabledDiskEncryption { at, .. }
            | Activity::DisabledDiskEncryption { at, .. }
            | Activity::ReadHostDiskEncryptionKey { at, .. }
            | Activity::AddedBootstrapPackage { at, .. }
            | Activity::DeletedBootstrapPackage { at, .. }
            | Activity::ChangedMacosSetupAssistant { at, .. }
            | Activity::DeletedMacosSetupAssistant { at, .. }
            | Activity::AddedEula { at, .. }
            | Activity::DeletedEula { at, .. } => *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_hex_sha256() {
        let a = compute_checksum(b"payload");
        let b = compute_checksum(b"payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, compute_checksum(b"other"));
    }

    #[test]
    fn activity_serializes_with_kind_tag() {
        let a = Activity::MdmEnrolled {
            at: Utc::now(),
            host_uuid: "U1".into(),
            platform: Platform::Darwin,
        };
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["kind"], "mdm_enrolled");
        assert_eq!(v["platform"], "darwin");
    }
}
