use serde::{Deserialize, Serialize};

use crate::util::now_iso;

/// Status of a single agent's checkpoint record.
///
/// Status is monotone toward a terminal value: once COMPLETED, FAILED or
/// TIMEOUT is published, the record never leaves that set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckpointStatus::Completed | CheckpointStatus::Failed | CheckpointStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Timeout => "timeout",
        }
    }
}

/// Per-agent synchronization record, published atomically via rename
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub agent_id: String,
    pub mission_id: String,
    pub status: CheckpointStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentCheckpoint {
    pub fn new(agent_id: &str, mission_id: &str, status: CheckpointStatus) -> Self {
        let now = now_iso();
        AgentCheckpoint {
            agent_id: agent_id.to_string(),
            mission_id: mission_id.to_string(),
            status,
            created_at: now.clone(),
            updated_at: now,
            progress: 0.0,
            result: None,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }
}
