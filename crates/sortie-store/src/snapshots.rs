//! SHA-256 verified snapshots of mission state.
//!
//! Snapshots are full copies of the mission record with an embedded
//! metadata block. The digest covers the canonical compact encoding of
//! the state, so restore-then-snapshot reproduces the original digest and
//! any bit flip in the state section fails verification.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};

use sortie_types::{now_iso, parse_iso, sha256_hex, SnapshotFile, SnapshotMetadata};

use crate::atomic;

/// Keep this many snapshots from the last 24 hours
const MAX_HOURLY_SNAPSHOTS: usize = 24;
/// Plus the newest snapshot per day for this many days
const MAX_DAILY_SNAPSHOTS: usize = 7;

pub struct SnapshotManager {
    snapshots_dir: PathBuf,
    mission_path: PathBuf,
}

impl SnapshotManager {
    pub fn new(snapshots_dir: &Path, mission_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(snapshots_dir)
            .with_context(|| format!("creating snapshot dir {}", snapshots_dir.display()))?;
        Ok(SnapshotManager {
            snapshots_dir: snapshots_dir.to_path_buf(),
            mission_path: mission_path.to_path_buf(),
        })
    }

    fn canonical_hash(state: &serde_json::Value) -> Result<String> {
        let compact = serde_json::to_vec(state)?;
        Ok(sha256_hex(&compact))
    }

    /// Snapshot the current mission state. Returns None when there is no
    /// mission file to capture.
    pub fn create(
        &self,
        stage_hint: Option<&str>,
        extra: serde_json::Value,
    ) -> Result<Option<SnapshotMetadata>> {
        if !self.mission_path.exists() {
            tracing::debug!("no mission state to snapshot");
            return Ok(None);
        }

        let state: serde_json::Value =
            atomic::read_json(&self.mission_path, serde_json::Value::Null);
        if state.is_null() {
            return Ok(None);
        }

        let mission_id = state
            .get("mission_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let stage = state
            .get("current_stage")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();

        let hash = Self::canonical_hash(&state)?;
        let timestamp = now_iso();
        let ts_clean = timestamp.replace([':', '.'], "-");
        let snapshot_id = format!("snapshot_{}_{}_{}", mission_id, ts_clean, &hash[..8]);
        let path = self.snapshots_dir.join(format!("{}.json", snapshot_id));

        let metadata = SnapshotMetadata {
            snapshot_id: snapshot_id.clone(),
            mission_id,
            timestamp,
            stage,
            sha256_hash: hash,
            file_path: path.to_string_lossy().to_string(),
            stage_hint: stage_hint.map(str::to_string),
            extra,
        };

        let file = SnapshotFile { snapshot_metadata: metadata.clone(), mission_state: state };

        // Temp + rename so a crash mid-write leaves no partial snapshot
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("writing snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("publishing snapshot {}", path.display()))?;

        tracing::info!(snapshot = %snapshot_id, "snapshot created");
        let rotated = self.rotate()?;
        if rotated > 0 {
            tracing::info!(count = rotated, "rotated out old snapshots");
        }

        Ok(Some(metadata))
    }

    fn load_file(&self, metadata: &SnapshotMetadata) -> Result<SnapshotFile> {
        let content = std::fs::read_to_string(&metadata.file_path)
            .with_context(|| format!("reading snapshot {}", metadata.file_path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing snapshot {}", metadata.file_path))
    }

    /// Recompute the digest of the embedded state and compare to the
    /// stored one.
    pub fn verify(&self, snapshot_id: &str) -> Result<bool> {
        let Some(metadata) = self.get(snapshot_id) else {
            return Ok(false);
        };
        let file = self.load_file(&metadata)?;
        let recomputed = Self::canonical_hash(&file.mission_state)?;
        Ok(recomputed == file.snapshot_metadata.sha256_hash)
    }

    /// Rewrite the mission state from a snapshot. Refuses when integrity
    /// verification fails; the previous state is kept as
    /// `.pre_restore_backup`.
    pub fn restore(&self, snapshot_id: &str, verify_first: bool) -> Result<()> {
        let Some(metadata) = self.get(snapshot_id) else {
            bail!("snapshot not found: {}", snapshot_id);
        };

        if verify_first && !self.verify(snapshot_id)? {
            bail!("snapshot integrity verification failed: {}", snapshot_id);
        }

        let file = self.load_file(&metadata)?;

        if self.mission_path.exists() {
            let backup = self.mission_path.with_extension("json.pre_restore_backup");
            std::fs::copy(&self.mission_path, &backup)
                .with_context(|| format!("backing up to {}", backup.display()))?;
        }

        atomic::write_json(&self.mission_path, &file.mission_state)?;
        tracing::info!(snapshot = snapshot_id, "mission state restored");
        Ok(())
    }

    /// All snapshots, newest first.
    pub fn list(&self) -> Vec<SnapshotMetadata> {
        let mut snapshots = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.snapshots_dir) else {
            return snapshots;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("snapshot_") || !name.ends_with(".json") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };
            match serde_json::from_str::<SnapshotFile>(&content) {
                Ok(file) => {
                    let mut metadata = file.snapshot_metadata;
                    metadata.file_path = entry.path().to_string_lossy().to_string();
                    snapshots.push(metadata);
                }
                Err(e) => {
                    tracing::warn!(file = %entry.path().display(), error = %e,
                        "unreadable snapshot skipped");
                }
            }
        }

        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        snapshots
    }

    pub fn latest(&self) -> Option<SnapshotMetadata> {
        self.list().into_iter().next()
    }

    pub fn get(&self, snapshot_id: &str) -> Option<SnapshotMetadata> {
        self.list().into_iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Apply the rotation policy: keep the 24 newest within the last 24
    /// hours, plus the newest per day for the last 7 days. Returns the
    /// number of deleted snapshots.
    pub fn rotate(&self) -> Result<usize> {
        let snapshots = self.list();
        if snapshots.is_empty() {
            return Ok(0);
        }

        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let mut recent = Vec::new();
        let mut older = Vec::new();

        for snapshot in snapshots {
            match parse_iso(&snapshot.timestamp) {
                Some(ts) if ts > cutoff => recent.push(snapshot),
                _ => older.push(snapshot),
            }
        }

        let mut to_delete: Vec<SnapshotMetadata> =
            recent.split_off(recent.len().min(MAX_HOURLY_SNAPSHOTS));

        // Newest per day for older snapshots; the rest go
        let mut daily: Vec<(String, SnapshotMetadata)> = Vec::new();
        for snapshot in older {
            let day = match parse_iso(&snapshot.timestamp) {
                Some(ts) => ts.format("%Y-%m-%d").to_string(),
                None => {
                    to_delete.push(snapshot);
                    continue;
                }
            };
            if daily.iter().any(|(d, _)| *d == day) {
                to_delete.push(snapshot);
            } else {
                daily.push((day, snapshot));
            }
        }
        for (_, snapshot) in daily.into_iter().skip(MAX_DAILY_SNAPSHOTS) {
            to_delete.push(snapshot);
        }

        let mut removed = 0;
        for snapshot in to_delete {
            if std::fs::remove_file(&snapshot.file_path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Background loop: snapshot every `interval` while a mission is
    /// active. Stops when `stop` is set.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> Result<std::thread::JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("snapshot-scheduler".to_string())
            .spawn(move || {
                let tick = Duration::from_secs(5).min(interval);
                let mut waited = Duration::ZERO;
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    waited += tick;
                    if waited < interval {
                        continue;
                    }
                    waited = Duration::ZERO;
                    if self.mission_is_active() {
                        if let Err(e) = self.create(Some("scheduled"), serde_json::Value::Null)
                        {
                            tracing::warn!(error = %e, "scheduled snapshot failed");
                        }
                    }
                }
            })
            .context("spawning snapshot scheduler")?;
        Ok(handle)
    }

    fn mission_is_active(&self) -> bool {
        let state: serde_json::Value =
            atomic::read_json(&self.mission_path, serde_json::Value::Null);
        match state.get("current_stage").and_then(|v| v.as_str()) {
            Some(stage) => stage != "COMPLETE",
            None => false,
        }
    }
}

/// Emits a warning when no snapshot was taken for too long during an
/// active mission, with a cooldown between identical alerts.
pub struct StaleBackupMonitor {
    max_age: ChronoDuration,
    cooldown: ChronoDuration,
    last_alert_at: Option<chrono::DateTime<Utc>>,
}

impl StaleBackupMonitor {
    pub fn new(max_age: Duration, cooldown: Duration) -> Self {
        StaleBackupMonitor {
            max_age: ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(2)),
            cooldown: ChronoDuration::from_std(cooldown)
                .unwrap_or(ChronoDuration::minutes(30)),
            last_alert_at: None,
        }
    }

    /// Returns a warning message when the newest snapshot is older than
    /// the threshold and the cooldown has elapsed since the last alert.
    pub fn check(&mut self, manager: &SnapshotManager) -> Option<String> {
        if !manager.mission_is_active() {
            return None;
        }

        let now = Utc::now();
        if let Some(last) = self.last_alert_at {
            if now - last < self.cooldown {
                return None;
            }
        }

        let stale = match manager.latest() {
            Some(latest) => match parse_iso(&latest.timestamp) {
                Some(ts) => now - ts > self.max_age,
                None => true,
            },
            None => true,
        };

        if stale {
            self.last_alert_at = Some(now);
            let message = format!(
                "no mission snapshot in the last {} minutes during an active mission",
                self.max_age.num_minutes()
            );
            tracing::warn!("{}", message);
            Some(message)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sortie_types::MissionRecord;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (SnapshotManager, PathBuf) {
        let mission_path = dir.path().join("state").join("mission.json");
        let snapshots_dir = dir.path().join("snapshots");
        let mission = MissionRecord::new("snapshot me", 3, "/tmp/ws");
        atomic::write_json(&mission_path, &mission).unwrap();
        let manager = SnapshotManager::new(&snapshots_dir, &mission_path).unwrap();
        (manager, mission_path)
    }

    #[test]
    fn test_create_and_verify() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        let metadata = manager.create(Some("test"), json!({})).unwrap().unwrap();
        assert_eq!(metadata.sha256_hash.len(), 64);
        assert!(manager.verify(&metadata.snapshot_id).unwrap());
    }

    #[test]
    fn test_bit_flip_fails_verification() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);
        let metadata = manager.create(None, json!({})).unwrap().unwrap();

        // Tamper with the state section on disk
        let content = std::fs::read_to_string(&metadata.file_path).unwrap();
        let mut file: SnapshotFile = serde_json::from_str(&content).unwrap();
        file.mission_state["problem_statement"] = json!("tampered");
        std::fs::write(&metadata.file_path, serde_json::to_vec_pretty(&file).unwrap())
            .unwrap();

        assert!(!manager.verify(&metadata.snapshot_id).unwrap());
    }

    #[test]
    fn test_restore_roundtrip_preserves_hash() {
        let dir = TempDir::new().unwrap();
        let (manager, mission_path) = setup(&dir);

        let first = manager.create(None, json!({})).unwrap().unwrap();
        manager.restore(&first.snapshot_id, true).unwrap();
        let second = manager.create(None, json!({})).unwrap().unwrap();

        assert_eq!(first.sha256_hash, second.sha256_hash);
        assert!(mission_path.with_extension("json.pre_restore_backup").exists());
    }

    #[test]
    fn test_restore_refuses_tampered_snapshot() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);
        let metadata = manager.create(None, json!({})).unwrap().unwrap();

        let content = std::fs::read_to_string(&metadata.file_path).unwrap();
        let mut file: SnapshotFile = serde_json::from_str(&content).unwrap();
        file.mission_state["mission_id"] = json!("evil");
        std::fs::write(&metadata.file_path, serde_json::to_vec_pretty(&file).unwrap())
            .unwrap();

        assert!(manager.restore(&metadata.snapshot_id, true).is_err());
    }

    #[test]
    fn test_no_mission_file_yields_none() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(
            &dir.path().join("snaps"),
            &dir.path().join("absent.json"),
        )
        .unwrap();
        assert!(manager.create(None, json!({})).unwrap().is_none());
    }

    #[test]
    fn test_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let (manager, mission_path) = setup(&dir);

        manager.create(None, json!({})).unwrap();
        // Mutate so the second snapshot has a different id
        let mut mission: MissionRecord =
            atomic::read_json(&mission_path, MissionRecord::new("x", 1, "y"));
        mission.record_history("step", json!({}));
        atomic::write_json(&mission_path, &mission).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let second = manager.create(None, json!({})).unwrap().unwrap();

        let listed = manager.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].snapshot_id, second.snapshot_id);
    }

    #[test]
    fn test_stale_monitor_cooldown() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        let mut monitor =
            StaleBackupMonitor::new(Duration::from_secs(0), Duration::from_secs(3600));
        // No snapshots yet: first check alerts, second is inside cooldown
        assert!(monitor.check(&manager).is_some());
        assert!(monitor.check(&manager).is_none());
    }
}
