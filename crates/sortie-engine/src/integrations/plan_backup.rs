//! Backs up every file the implementation plan names when PLANNING ends.

use std::path::{Path, PathBuf};

use sortie_types::Stage;

use crate::events::{IntegrationEvent, IntegrationHandler};
use crate::plan_backup::backup_planned_files;

pub struct PlanBackupIntegration {
    backups_root: PathBuf,
}

impl PlanBackupIntegration {
    pub fn new(backups_root: &Path) -> Self {
        PlanBackupIntegration { backups_root: backups_root.to_path_buf() }
    }
}

impl IntegrationHandler for PlanBackupIntegration {
    fn name(&self) -> &str {
        "plan_backup"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn on_stage_ended(&mut self, event: &IntegrationEvent) -> anyhow::Result<()> {
        if event.stage != Stage::Planning {
            return Ok(());
        }
        let workspace = Path::new(&event.mission.mission_workspace);
        let report = backup_planned_files(
            workspace,
            &self.backups_root,
            &event.mission.mission_id,
        )?;
        if !report.missing.is_empty() {
            tracing::debug!(missing = report.missing.len(),
                "plan referenced files that do not exist yet");
        }
        Ok(())
    }
}
