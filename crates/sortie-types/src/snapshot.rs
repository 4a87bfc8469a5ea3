use serde::{Deserialize, Serialize};

/// Metadata block embedded in every snapshot file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub mission_id: String,
    pub timestamp: String,
    pub stage: String,
    pub sha256_hash: String,
    pub file_path: String,
    #[serde(default)]
    pub stage_hint: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// On-disk snapshot: metadata plus a verbatim copy of the mission state.
///
/// Filename: `snapshot_<mission_id>_<ts>_<hash8>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub snapshot_metadata: SnapshotMetadata,
    pub mission_state: serde_json::Value,
}
