//! Intra-stage crash-recovery checkpoints.
//!
//! Each stage-running attempt records its progress under
//! `checkpoints/<mission_id>/<stage>/checkpoint.json`. On startup the
//! engine scans these records, finds the newest one belonging to a
//! non-complete mission, and prepends a recovery blurb to the next prompt
//! so the session resumes instead of restarting.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use sortie_types::{now_iso, parse_iso, Stage};

use crate::atomic;

const MAX_MISSION_ID_LENGTH: usize = 100;

/// Progress record for one stage attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub checkpoint_id: String,
    pub mission_id: String,
    pub stage: Stage,
    pub timestamp: String,
    #[serde(default)]
    pub progress: serde_json::Value,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub recovery_hint: String,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default = "default_cycle")]
    pub cycle: u32,
}

fn default_cycle() -> u32 {
    1
}

impl RecoveryRecord {
    /// Human-readable resume blurb injected into the next PLANNING or
    /// BUILDING prompt after a crash.
    pub fn recovery_context(&self) -> String {
        let age = match parse_iso(&self.timestamp) {
            Some(ts) => {
                let minutes = (chrono::Utc::now() - ts).num_seconds() as f64 / 60.0;
                format!("{:.1} minutes ago", minutes)
            }
            None => "unknown time ago".to_string(),
        };

        let mut files_info = String::new();
        if !self.files_created.is_empty() {
            let shown: Vec<&str> =
                self.files_created.iter().take(5).map(String::as_str).collect();
            files_info.push_str(&format!("\n  Files created: {}", shown.join(", ")));
            if self.files_created.len() > 5 {
                files_info.push_str(&format!(" (+{} more)", self.files_created.len() - 5));
            }
        }
        if !self.files_modified.is_empty() {
            let shown: Vec<&str> =
                self.files_modified.iter().take(5).map(String::as_str).collect();
            files_info.push_str(&format!("\n  Files modified: {}", shown.join(", ")));
        }

        let progress = if self.progress.is_null() {
            "No progress data".to_string()
        } else {
            serde_json::to_string_pretty(&self.progress).unwrap_or_default()
        };

        let hint = if self.recovery_hint.is_empty() {
            "No specific hint"
        } else {
            &self.recovery_hint
        };

        format!(
            "\n=== CRASH RECOVERY ===\n\
             Your previous session crashed during the **{}** stage ({}).\n\n\
             **Mission:** {}\n\
             **Iteration:** {}\n\
             **Cycle:** {}\n\n\
             **Progress at crash:**\n{}\n{}\n\n\
             **Recovery hint:** {}\n\n\
             IMPORTANT: Resume from where you left off. Do NOT restart from scratch.\n\
             Check which files already exist before recreating them.\n\
             === END CRASH RECOVERY ===\n",
            self.stage, age, self.mission_id, self.iteration, self.cycle,
            progress, files_info, hint
        )
    }
}

/// Checkpoint manager for one (mission, stage) pair
pub struct StageRecovery {
    mission_id: String,
    stage: Stage,
    checkpoint_file: PathBuf,
    backups_dir: PathBuf,
}

impl StageRecovery {
    pub fn new(checkpoints_root: &Path, mission_id: &str, stage: Stage) -> Result<Self> {
        validate_mission_id(mission_id)?;
        let dir = checkpoints_root.join(mission_id).join(stage.as_str());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating recovery dir {}", dir.display()))?;
        Ok(StageRecovery {
            mission_id: mission_id.to_string(),
            stage,
            checkpoint_file: dir.join("checkpoint.json"),
            backups_dir: dir.join("file_backups"),
        })
    }

    /// Save a progress checkpoint, backing up named files first so a later
    /// rollback can restore them.
    pub fn save_progress(
        &self,
        progress: serde_json::Value,
        files_created: Vec<String>,
        files_modified: Vec<String>,
        recovery_hint: &str,
        iteration: u32,
        cycle: u32,
    ) -> Result<String> {
        if !files_modified.is_empty() {
            self.backup_files(&files_modified);
        }

        let now = now_iso();
        let checkpoint_id = format!(
            "{}_{}_{}",
            self.mission_id,
            self.stage.as_str(),
            now.replace([':', '.'], "-")
        );

        let record = RecoveryRecord {
            checkpoint_id: checkpoint_id.clone(),
            mission_id: self.mission_id.clone(),
            stage: self.stage,
            timestamp: now,
            progress,
            files_created,
            files_modified,
            recovery_hint: recovery_hint.to_string(),
            iteration,
            cycle,
        };

        atomic::write_json(&self.checkpoint_file, &record)?;
        tracing::info!(checkpoint = %checkpoint_id, "stage checkpoint saved");
        Ok(checkpoint_id)
    }

    fn backup_files(&self, files: &[String]) {
        if std::fs::create_dir_all(&self.backups_dir).is_err() {
            return;
        }
        let stamp = now_iso().replace([':', '.'], "-");
        for file_path in files {
            let src = Path::new(file_path);
            if !src.exists() {
                continue;
            }
            let Some(name) = src.file_name() else { continue };
            let backup = self
                .backups_dir
                .join(format!("{}.{}", name.to_string_lossy(), stamp));
            if let Err(e) = std::fs::copy(src, &backup) {
                tracing::warn!(file = file_path, error = %e, "file backup failed");
            }
        }
    }

    pub fn latest(&self) -> Option<RecoveryRecord> {
        if !self.checkpoint_file.exists() {
            return None;
        }
        let value: Option<RecoveryRecord> = atomic::read_json(&self.checkpoint_file, None);
        value
    }

    /// Clear the checkpoint after the stage completes. File backups stay.
    pub fn clear(&self) {
        if self.checkpoint_file.exists() {
            if let Err(e) = std::fs::remove_file(&self.checkpoint_file) {
                tracing::warn!(error = %e, "failed to clear stage checkpoint");
            } else {
                tracing::info!(mission = %self.mission_id, stage = %self.stage,
                    "stage checkpoint cleared");
            }
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }
}

fn validate_mission_id(mission_id: &str) -> Result<()> {
    if mission_id.is_empty() {
        bail!("mission_id cannot be empty");
    }
    if mission_id.len() > MAX_MISSION_ID_LENGTH {
        bail!("mission_id too long (max {} chars)", MAX_MISSION_ID_LENGTH);
    }
    if !mission_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        bail!("mission_id must contain only alphanumerics, underscores or hyphens");
    }
    Ok(())
}

/// Scan every mission/stage checkpoint under the root, newest first.
pub fn scan_checkpoints(checkpoints_root: &Path) -> Vec<RecoveryRecord> {
    let mut records = Vec::new();
    if !checkpoints_root.exists() {
        return records;
    }

    for entry in walkdir::WalkDir::new(checkpoints_root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_name() != "checkpoint.json" {
            continue;
        }
        let record: Option<RecoveryRecord> = atomic::read_json(entry.path(), None);
        if let Some(record) = record {
            records.push(record);
        }
    }

    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    records
}

/// Newest checkpoint whose mission is not COMPLETE, judged by the mission
/// record currently on disk.
pub fn detect_incomplete_mission(
    checkpoints_root: &Path,
    mission_path: &Path,
) -> Option<RecoveryRecord> {
    let mission: Option<sortie_types::MissionRecord> = atomic::read_json(mission_path, None);

    for record in scan_checkpoints(checkpoints_root) {
        match &mission {
            Some(m) if m.mission_id == record.mission_id => {
                if !m.is_complete() {
                    return Some(record);
                }
            }
            // No live mission record for it: treat as incomplete leftovers
            _ => return Some(record),
        }
    }
    None
}

/// Remove stage checkpoints older than `max_age_days`.
pub fn clean_old_checkpoints(checkpoints_root: &Path, max_age_days: i64) -> usize {
    let mut removed = 0;
    for record in scan_checkpoints(checkpoints_root) {
        let Some(age) = sortie_types::days_old(&record.timestamp) else { continue };
        if age > max_age_days {
            let dir = checkpoints_root
                .join(&record.mission_id)
                .join(record.stage.as_str());
            if std::fs::remove_dir_all(&dir).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}
