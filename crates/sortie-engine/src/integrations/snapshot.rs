//! Snapshots mission state at every stage boundary.

use std::sync::Arc;

use sortie_store::SnapshotManager;

use crate::events::{IntegrationEvent, IntegrationHandler};

pub struct SnapshotIntegration {
    manager: Arc<SnapshotManager>,
}

impl SnapshotIntegration {
    pub fn new(manager: Arc<SnapshotManager>) -> Self {
        SnapshotIntegration { manager }
    }
}

impl IntegrationHandler for SnapshotIntegration {
    fn name(&self) -> &str {
        "snapshots"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn on_stage_started(&mut self, event: &IntegrationEvent) -> anyhow::Result<Option<String>> {
        self.manager.create(Some(event.stage.as_str()), serde_json::Value::Null)?;
        Ok(None)
    }

    fn on_mission_completed(&mut self, event: &IntegrationEvent) -> anyhow::Result<()> {
        self.manager.create(
            Some("mission_completed"),
            serde_json::json!({"mission_id": event.mission.mission_id}),
        )?;
        Ok(())
    }
}
