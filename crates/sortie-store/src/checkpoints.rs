//! File-based synchronization for parallel LLM agents.
//!
//! Each agent owns one record file in a per-mission directory. Writes go
//! through a temp file + rename so readers either see the previous record
//! or the new one, never a torn write. Parents join on their children by
//! polling `wait_for_all`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;

use sortie_types::{now_iso, AgentCheckpoint, CheckpointStatus};

pub struct CheckpointStore {
    mission_id: String,
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint directory for a mission.
    pub fn new(checkpoints_root: &Path, mission_id: &str) -> Result<Self> {
        let dir = checkpoints_root.join(mission_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;
        Ok(CheckpointStore { mission_id: mission_id.to_string(), dir })
    }

    /// Isolated namespace for sub-agents spawned by one worker. Sub-agents
    /// of different parents never share a directory.
    pub fn subagent_namespace(&self, parent_agent_id: &str) -> Result<CheckpointStore> {
        let ns = format!("{}_sub_{}", self.mission_id, parent_agent_id);
        let root = self
            .dir
            .parent()
            .context("checkpoint dir has no parent")?;
        CheckpointStore::new(root, &ns)
    }

    pub fn mission_id(&self) -> &str {
        &self.mission_id
    }

    fn path_for(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", agent_id))
    }

    fn atomic_write(&self, path: &Path, checkpoint: &AgentCheckpoint) -> Result<()> {
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("writing temp checkpoint {}", tmp.display()))?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e).with_context(|| format!("publishing checkpoint {}", path.display()))
            }
        }
    }

    pub fn create(
        &self,
        agent_id: &str,
        status: CheckpointStatus,
    ) -> Result<AgentCheckpoint> {
        let checkpoint = AgentCheckpoint::new(agent_id, &self.mission_id, status);
        self.atomic_write(&self.path_for(agent_id), &checkpoint)?;
        tracing::debug!(agent = agent_id, status = status.as_str(), "checkpoint created");
        Ok(checkpoint)
    }

    /// Read an agent's record. A missing or mid-rename file reads as None;
    /// callers retry on their next poll.
    pub fn read(&self, agent_id: &str) -> Option<AgentCheckpoint> {
        let path = self.path_for(agent_id);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(cp) => Some(cp),
            Err(e) => {
                tracing::warn!(agent = agent_id, error = %e, "corrupt checkpoint");
                None
            }
        }
    }

    /// Apply a mutation and republish. A record that already reached a
    /// terminal status keeps it: status is monotone.
    pub fn update<F>(&self, agent_id: &str, apply: F) -> Result<Option<AgentCheckpoint>>
    where
        F: FnOnce(&mut AgentCheckpoint),
    {
        let Some(mut checkpoint) = self.read(agent_id) else {
            tracing::warn!(agent = agent_id, "cannot update missing checkpoint");
            return Ok(None);
        };

        let prior_status = checkpoint.status;
        apply(&mut checkpoint);
        if prior_status.is_terminal() && checkpoint.status != prior_status {
            checkpoint.status = prior_status;
        }
        checkpoint.updated_at = now_iso();

        self.atomic_write(&self.path_for(agent_id), &checkpoint)?;
        Ok(Some(checkpoint))
    }

    pub fn mark_completed(
        &self,
        agent_id: &str,
        result: Value,
    ) -> Result<Option<AgentCheckpoint>> {
        self.update(agent_id, |cp| {
            cp.status = CheckpointStatus::Completed;
            cp.result = Some(result);
            cp.progress = 1.0;
        })
    }

    pub fn mark_failed(&self, agent_id: &str, error: &str) -> Result<Option<AgentCheckpoint>> {
        self.update(agent_id, |cp| {
            cp.status = CheckpointStatus::Failed;
            cp.error = Some(error.to_string());
        })
    }

    pub fn mark_timeout(&self, agent_id: &str) -> Result<Option<AgentCheckpoint>> {
        self.update(agent_id, |cp| cp.status = CheckpointStatus::Timeout)
    }

    pub fn is_complete(&self, agent_id: &str) -> bool {
        self.read(agent_id).map(|cp| cp.status.is_terminal()).unwrap_or(false)
    }

    pub fn all_complete(&self, agent_ids: &[String]) -> bool {
        agent_ids.iter().all(|id| self.is_complete(id))
    }

    /// Status string per agent; absent records report "not_found".
    pub fn completion_status(&self, agent_ids: &[String]) -> BTreeMap<String, String> {
        agent_ids
            .iter()
            .map(|id| {
                let status = self
                    .read(id)
                    .map(|cp| cp.status.as_str().to_string())
                    .unwrap_or_else(|| "not_found".to_string());
                (id.clone(), status)
            })
            .collect()
    }

    /// Poll until every agent reaches a terminal status or the deadline
    /// passes. At the deadline, non-terminal records are forced to TIMEOUT.
    /// Returns true only if every agent ended COMPLETED.
    pub fn wait_for_all(
        &self,
        agent_ids: &[String],
        timeout: Duration,
        poll_interval: Duration,
        mut progress: Option<&mut dyn FnMut(&BTreeMap<String, String>)>,
    ) -> bool {
        let started = Instant::now();

        loop {
            if started.elapsed() >= timeout {
                tracing::warn!(mission = %self.mission_id, "timeout waiting for agents");
                for agent_id in agent_ids {
                    if !self.is_complete(agent_id) {
                        let _ = self.mark_timeout(agent_id);
                    }
                }
                return false;
            }

            let statuses = self.completion_status(agent_ids);
            if let Some(callback) = progress.as_deref_mut() {
                callback(&statuses);
            }

            if self.all_complete(agent_ids) {
                return agent_ids
                    .iter()
                    .all(|id| statuses.get(id).map(String::as_str) == Some("completed"));
            }

            std::thread::sleep(poll_interval);
        }
    }

    pub fn list_agents(&self) -> Vec<String> {
        let mut agents = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || !name.ends_with(".json") {
                    continue;
                }
                agents.push(name.trim_end_matches(".json").to_string());
            }
        }
        agents.sort();
        agents
    }

    /// Result payload per agent (None where no result was published).
    pub fn results(&self, agent_ids: Option<&[String]>) -> BTreeMap<String, Option<Value>> {
        let ids: Vec<String> = match agent_ids {
            Some(ids) => ids.to_vec(),
            None => self.list_agents(),
        };
        ids.into_iter()
            .map(|id| {
                let result = self.read(&id).and_then(|cp| cp.result);
                (id, result)
            })
            .collect()
    }

    /// Status histogram across all agents in this mission.
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for agent_id in self.list_agents() {
            if let Some(cp) = self.read(&agent_id) {
                *by_status.entry(cp.status.as_str().to_string()).or_default() += 1;
            }
        }
        by_status
    }

    /// Remove checkpoint files, optionally keeping completed ones.
    pub fn cleanup(&self, keep_completed: bool) -> Result<usize> {
        let mut removed = 0;
        for agent_id in self.list_agents() {
            if keep_completed {
                if let Some(cp) = self.read(&agent_id) {
                    if cp.status == CheckpointStatus::Completed {
                        continue;
                    }
                }
            }
            std::fs::remove_file(self.path_for(&agent_id))
                .with_context(|| format!("removing checkpoint for {}", agent_id))?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path(), "mission_test").unwrap()
    }

    #[test]
    fn test_create_and_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create("agent_1", CheckpointStatus::InProgress).unwrap();
        let cp = store.read("agent_1").unwrap();
        assert_eq!(cp.status, CheckpointStatus::InProgress);
        assert_eq!(cp.mission_id, "mission_test");
    }

    #[test]
    fn test_mark_completed_sets_progress() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create("agent_1", CheckpointStatus::InProgress).unwrap();
        store.mark_completed("agent_1", json!({"files": ["a.rs"]})).unwrap();
        let cp = store.read("agent_1").unwrap();
        assert_eq!(cp.status, CheckpointStatus::Completed);
        assert_eq!(cp.progress, 1.0);
        assert!(cp.result.is_some());
    }

    #[test]
    fn test_terminal_status_is_monotone() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create("agent_1", CheckpointStatus::InProgress).unwrap();
        store.mark_failed("agent_1", "boom").unwrap();

        // Attempt to drag it back to in-progress must not stick
        store
            .update("agent_1", |cp| cp.status = CheckpointStatus::InProgress)
            .unwrap();
        assert_eq!(store.read("agent_1").unwrap().status, CheckpointStatus::Failed);
    }

    #[test]
    fn test_wait_for_all_success() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ids = vec!["a1".to_string(), "a2".to_string()];
        store.create("a1", CheckpointStatus::InProgress).unwrap();
        store.create("a2", CheckpointStatus::InProgress).unwrap();
        store.mark_completed("a1", json!({})).unwrap();
        store.mark_completed("a2", json!({})).unwrap();

        let ok = store.wait_for_all(
            &ids,
            Duration::from_secs(2),
            Duration::from_millis(10),
            None,
        );
        assert!(ok);
    }

    #[test]
    fn test_wait_for_all_deadline_forces_timeout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ids = vec!["slow".to_string()];
        store.create("slow", CheckpointStatus::InProgress).unwrap();

        let ok = store.wait_for_all(
            &ids,
            Duration::from_millis(50),
            Duration::from_millis(10),
            None,
        );
        assert!(!ok);
        assert_eq!(store.read("slow").unwrap().status, CheckpointStatus::Timeout);
    }

    #[test]
    fn test_wait_for_all_fails_on_any_failure() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ids = vec!["good".to_string(), "bad".to_string()];
        store.create("good", CheckpointStatus::InProgress).unwrap();
        store.create("bad", CheckpointStatus::InProgress).unwrap();
        store.mark_completed("good", json!({})).unwrap();
        store.mark_failed("bad", "oops").unwrap();

        let ok = store.wait_for_all(
            &ids,
            Duration::from_secs(2),
            Duration::from_millis(10),
            None,
        );
        assert!(!ok);
    }

    #[test]
    fn test_subagent_namespace_is_isolated() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let sub_a = store.subagent_namespace("worker_a").unwrap();
        let sub_b = store.subagent_namespace("worker_b").unwrap();
        sub_a.create("sub_1", CheckpointStatus::InProgress).unwrap();
        assert!(sub_b.read("sub_1").is_none());
        assert!(sub_a.read("sub_1").is_some());
    }

    #[test]
    fn test_cleanup_keep_completed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create("done", CheckpointStatus::InProgress).unwrap();
        store.mark_completed("done", json!({})).unwrap();
        store.create("pending", CheckpointStatus::Pending).unwrap();

        let removed = store.cleanup(true).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_agents(), vec!["done".to_string()]);
    }
}
