//! Priority + schedule + dependency ordered mission queue.
//!
//! Queue state lives in a single JSON file behind the atomic store; every
//! operation is load-modify-save. Readiness is a pure function of the
//! queue contents, the clock and the dependency store, so two calls at
//! the same instant agree on the next item.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::Serialize;

use sortie_store::atomic;
use sortie_types::{
    now_iso, parse_iso, DependencyStatus, MissionRecord, Priority, QueueItem, QueueState,
    StartCondition,
};

use crate::deps::{self, DependencySuggestion};
use crate::estimate;

/// Recommended poll interval for the auto-advancement watcher
pub const ADVANCE_POLL_INTERVAL_SECS: u64 = 10;

/// Partial update for a queue item; `Some(None)` clears an optional field
#[derive(Debug, Default, Clone)]
pub struct QueueItemPatch {
    pub mission_title: Option<String>,
    pub mission_description: Option<String>,
    pub cycle_budget: Option<u32>,
    pub priority: Option<Priority>,
    pub scheduled_start: Option<Option<String>>,
    pub start_condition: Option<Option<String>>,
    pub depends_on: Option<Option<String>>,
    pub estimated_minutes: Option<Option<u32>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub id: String,
    pub mission_title: String,
    pub priority: Priority,
    pub estimated_start: String,
    pub estimated_end: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub scheduled_start: Option<String>,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub dependency_status: Option<DependencyStatus>,
    pub is_ready: bool,
    pub cycle_budget: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub total_items: usize,
    pub enabled: bool,
    pub paused: bool,
    #[serde(default)]
    pub paused_at: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<String>,
    pub by_priority: BTreeMap<String, usize>,
    pub ready: usize,
    pub waiting: usize,
    pub blocked: usize,
    pub total_estimated_minutes: u64,
    pub total_estimated_hours: f64,
}

pub struct QueueScheduler {
    queue_path: PathBuf,
    mission_path: PathBuf,
    mission_logs_dir: PathBuf,
}

impl QueueScheduler {
    pub fn new(queue_path: &Path, mission_path: &Path, mission_logs_dir: &Path) -> Self {
        QueueScheduler {
            queue_path: queue_path.to_path_buf(),
            mission_path: mission_path.to_path_buf(),
            mission_logs_dir: mission_logs_dir.to_path_buf(),
        }
    }

    pub fn state(&self) -> QueueState {
        atomic::read_json(&self.queue_path, QueueState::default())
    }

    fn save(&self, state: &QueueState) -> Result<()> {
        atomic::write_json(&self.queue_path, state)
    }

    /// Add an item, estimating its duration when unset, and re-sort.
    /// Returns the stored item and its 1-based queue position.
    pub fn add(&self, mut item: QueueItem) -> Result<(QueueItem, usize)> {
        let mut state = self.state();

        if item.estimated_minutes.is_none() && state.auto_estimate_time {
            item.estimated_minutes = Some(estimate::estimate_from_history(
                &self.mission_logs_dir,
                &item.mission_description,
                item.cycle_budget,
            ));
        }

        state.queue.push(item.clone());
        Self::sort_queue(&mut state.queue);
        self.save(&state)?;

        let position = state
            .queue
            .iter()
            .position(|q| q.id == item.id)
            .map(|i| i + 1)
            .unwrap_or(state.queue.len());

        // The stored copy carries the estimate
        let stored = state
            .queue
            .iter()
            .find(|q| q.id == item.id)
            .cloned()
            .unwrap_or(item);

        Ok((stored, position))
    }

    pub fn remove(&self, queue_id: &str) -> Result<bool> {
        let mut state = self.state();
        let before = state.queue.len();
        state.queue.retain(|q| q.id != queue_id);
        let removed = state.queue.len() < before;
        if removed {
            self.save(&state)?;
        }
        Ok(removed)
    }

    pub fn update(&self, queue_id: &str, patch: QueueItemPatch) -> Result<Option<QueueItem>> {
        let mut state = self.state();
        let Some(item) = state.queue.iter_mut().find(|q| q.id == queue_id) else {
            return Ok(None);
        };

        if let Some(title) = patch.mission_title {
            item.mission_title = title;
        }
        if let Some(description) = patch.mission_description {
            item.mission_description = description;
        }
        if let Some(budget) = patch.cycle_budget {
            item.cycle_budget = budget.clamp(1, 10);
        }
        if let Some(priority) = patch.priority {
            item.priority = priority;
        }
        if let Some(scheduled) = patch.scheduled_start {
            item.scheduled_start = scheduled;
        }
        if let Some(condition) = patch.start_condition {
            item.start_condition = condition;
        }
        if let Some(depends) = patch.depends_on {
            item.depends_on = depends;
        }
        if let Some(estimate) = patch.estimated_minutes {
            item.estimated_minutes = estimate;
        }
        if let Some(tags) = patch.tags {
            item.tags = tags;
        }

        let updated = item.clone();
        Self::sort_queue(&mut state.queue);
        self.save(&state)?;
        Ok(Some(updated))
    }

    /// Sort key: (priority weight, effective scheduled start, queued_at).
    /// A missing or unparseable schedule means "ready now".
    pub fn sort_queue(items: &mut [QueueItem]) {
        let now = Utc::now();
        items.sort_by(|a, b| {
            let key = |item: &QueueItem| -> (u32, DateTime<Utc>, String) {
                let scheduled = item
                    .scheduled_start
                    .as_deref()
                    .and_then(parse_iso)
                    .unwrap_or(now);
                (item.priority.weight(), scheduled, item.queued_at.clone())
            };
            key(a).cmp(&key(b))
        });
    }

    /// Whether no mission is currently in flight.
    pub fn is_idle(&self) -> bool {
        let mission: Option<MissionRecord> = atomic::read_json(&self.mission_path, None);
        match mission {
            Some(m) => m.is_complete(),
            None => true,
        }
    }

    pub fn check_dependency(&self, mission_id: &str) -> DependencyStatus {
        deps::check_dependency(&self.mission_logs_dir, &self.mission_path, mission_id)
    }

    fn item_is_ready(&self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        if let Some(scheduled) = item.scheduled_start.as_deref().and_then(parse_iso) {
            if scheduled > now {
                return false;
            }
        }

        if let Some(condition) = item.parsed_start_condition() {
            match condition {
                StartCondition::IdleAfter { hour, minute } => {
                    let local = chrono::Local::now();
                    let past_clock = (local.hour(), local.minute()) >= (hour, minute);
                    if !past_clock || !self.is_idle() {
                        return false;
                    }
                }
                StartCondition::At(instant) => {
                    if let Some(at) = parse_iso(&instant) {
                        if now < at {
                            return false;
                        }
                    }
                }
                StartCondition::AfterMission(mission_id) => {
                    if self.check_dependency(&mission_id) != DependencyStatus::Ready {
                        return false;
                    }
                }
            }
        }

        if let Some(depends_on) = &item.depends_on {
            match self.check_dependency(depends_on) {
                DependencyStatus::Ready => {}
                DependencyStatus::Blocked => {
                    tracing::warn!(item = %item.id, dependency = %depends_on,
                        "queue item blocked: dependency failed");
                    return false;
                }
                _ => return false,
            }
        }

        true
    }

    /// First ready item in sorted order, or None. Pure with respect to
    /// queue contents, clock and the dependency store.
    pub fn next_ready(&self) -> Option<QueueItem> {
        let state = self.state();
        if !state.enabled || state.paused {
            return None;
        }

        let mut items = state.queue;
        Self::sort_queue(&mut items);

        let now = Utc::now();
        items.into_iter().find(|item| self.item_is_ready(item, now))
    }

    /// Remove and return the next ready item, stamping
    /// `last_processed_at`. Callers hold the processing lock around this
    /// plus the new mission's initial state write.
    pub fn take_next_ready(&self) -> Result<Option<QueueItem>> {
        let Some(next) = self.next_ready() else {
            return Ok(None);
        };
        let mut state = self.state();
        state.queue.retain(|q| q.id != next.id);
        state.last_processed_at = Some(now_iso());
        self.save(&state)?;
        Ok(Some(next))
    }

    // Pause/resume affects only new advancement; both are idempotent.

    pub fn pause(&self, reason: Option<&str>) -> Result<()> {
        let mut state = self.state();
        state.paused = true;
        state.paused_at = Some(now_iso());
        state.pause_reason =
            Some(reason.unwrap_or("Manually paused").to_string());
        self.save(&state)?;
        tracing::info!(reason = state.pause_reason.as_deref().unwrap_or(""), "queue paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<bool> {
        let mut state = self.state();
        let was_paused = state.paused;
        state.paused = false;
        state.paused_at = None;
        state.pause_reason = None;
        self.save(&state)?;
        if was_paused {
            tracing::info!("queue resumed");
        }
        Ok(was_paused)
    }

    pub fn set_enabled(&self, enabled: Option<bool>) -> Result<bool> {
        let mut state = self.state();
        state.enabled = enabled.unwrap_or(!state.enabled);
        let now_enabled = state.enabled;
        self.save(&state)?;
        Ok(now_enabled)
    }

    pub fn clear(&self) -> Result<usize> {
        let mut state = self.state();
        let count = state.queue.len();
        state.queue.clear();
        self.save(&state)?;
        Ok(count)
    }

    /// Manual reorder by id list. Unknown ids are ignored; missing items
    /// append in their old order. The next priority sort overrides any
    /// manual order that conflicts with priorities.
    pub fn reorder(&self, new_order: &[String]) -> Result<bool> {
        let mut state = self.state();
        let mut remaining = std::mem::take(&mut state.queue);
        let mut reordered = Vec::with_capacity(remaining.len());

        for id in new_order {
            if let Some(position) = remaining.iter().position(|q| &q.id == id) {
                reordered.push(remaining.remove(position));
            }
        }
        reordered.extend(remaining);

        state.queue = reordered;
        self.save(&state)?;
        Ok(true)
    }

    /// Project estimated start/end instants across the sorted queue.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let state = self.state();
        let mut items = state.queue;
        Self::sort_queue(&mut items);

        let now = Utc::now();
        let mut clock = now;
        let mut entries = Vec::with_capacity(items.len());

        for item in items {
            let mut start = clock;
            if let Some(scheduled) = item.scheduled_start.as_deref().and_then(parse_iso) {
                if scheduled > start {
                    start = scheduled;
                }
            }

            let duration =
                item.estimated_minutes.unwrap_or(estimate::DEFAULT_CYCLE_TIME_MINUTES);
            let end = start + ChronoDuration::minutes(i64::from(duration));

            let dependency_status =
                item.depends_on.as_deref().map(|dep| self.check_dependency(dep));

            entries.push(TimelineEntry {
                is_ready: self.item_is_ready(&item, now),
                id: item.id,
                mission_title: item.mission_title,
                priority: item.priority,
                estimated_start: start.to_rfc3339(),
                estimated_end: end.to_rfc3339(),
                duration_minutes: duration,
                scheduled_start: item.scheduled_start,
                depends_on: item.depends_on,
                dependency_status,
                cycle_budget: item.cycle_budget,
            });

            clock = end;
        }

        entries
    }

    pub fn statistics(&self) -> QueueStatistics {
        let state = self.state();
        let now = Utc::now();

        let mut by_priority: BTreeMap<String, usize> = BTreeMap::new();
        let mut ready = 0;
        let mut waiting = 0;
        let mut blocked = 0;
        let mut total_minutes: u64 = 0;

        for item in &state.queue {
            let label = format!("{:?}", item.priority).to_lowercase();
            *by_priority.entry(label).or_default() += 1;
            total_minutes +=
                u64::from(item.estimated_minutes.unwrap_or(estimate::DEFAULT_CYCLE_TIME_MINUTES));

            if let Some(dep) = &item.depends_on {
                match self.check_dependency(dep) {
                    DependencyStatus::Blocked => {
                        blocked += 1;
                        continue;
                    }
                    DependencyStatus::Waiting | DependencyStatus::NotFound => {
                        waiting += 1;
                        continue;
                    }
                    DependencyStatus::Ready => {}
                }
            }

            if self.item_is_ready(item, now) {
                ready += 1;
            } else {
                waiting += 1;
            }
        }

        QueueStatistics {
            total_items: state.queue.len(),
            enabled: state.enabled,
            paused: state.paused,
            paused_at: state.paused_at,
            pause_reason: state.pause_reason,
            by_priority,
            ready,
            waiting,
            blocked,
            total_estimated_minutes: total_minutes,
            total_estimated_hours: (total_minutes as f64 / 60.0 * 10.0).round() / 10.0,
        }
    }

    pub fn suggest_dependencies(&self) -> Vec<DependencySuggestion> {
        deps::suggest_dependencies(&self.state().queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_types::Stage;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir) -> QueueScheduler {
        QueueScheduler::new(
            &dir.path().join("state").join("mission_queue.json"),
            &dir.path().join("state").join("mission.json"),
            &dir.path().join("missions").join("mission_logs"),
        )
    }

    fn item_with_priority(title: &str, priority: Priority) -> QueueItem {
        let mut item = QueueItem::new(title, "some work", 3);
        item.priority = priority;
        item
    }

    #[test]
    fn test_add_sorts_by_priority() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        scheduler.add(item_with_priority("low", Priority::Low)).unwrap();
        scheduler.add(item_with_priority("critical", Priority::Critical)).unwrap();
        let (_, position) = scheduler.add(item_with_priority("high", Priority::High)).unwrap();

        assert_eq!(position, 2);
        let state = scheduler.state();
        assert_eq!(state.queue[0].mission_title, "critical");
        assert_eq!(state.queue[1].mission_title, "high");
        assert_eq!(state.queue[2].mission_title, "low");
    }

    #[test]
    fn test_ties_break_by_queued_at() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        let mut first = QueueItem::new("first", "work", 3);
        first.queued_at = "2026-07-01T10:00:00+00:00".to_string();
        let mut second = QueueItem::new("second", "work", 3);
        second.queued_at = "2026-07-01T09:00:00+00:00".to_string();

        scheduler.add(first).unwrap();
        scheduler.add(second).unwrap();

        let state = scheduler.state();
        assert_eq!(state.queue[0].mission_title, "second");
    }

    #[test]
    fn test_next_ready_respects_schedule() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        let mut future = QueueItem::new("future", "work", 3);
        future.scheduled_start =
            Some((Utc::now() + ChronoDuration::hours(2)).to_rfc3339());
        scheduler.add(future).unwrap();

        assert!(scheduler.next_ready().is_none());

        scheduler.add(QueueItem::new("now", "work", 3)).unwrap();
        assert_eq!(scheduler.next_ready().unwrap().mission_title, "now");
    }

    #[test]
    fn test_dependency_gates_next_ready() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        let mut gated = QueueItem::new("gated", "work", 3);
        gated.depends_on = Some("mission_m123".to_string());
        scheduler.add(gated).unwrap();

        // No log for the dependency yet
        assert!(scheduler.next_ready().is_none());

        // Write a completed log and it becomes ready
        let logs = dir.path().join("missions").join("mission_logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(
            logs.join("mission_m123_log.json"),
            serde_json::to_vec(&serde_json::json!({"final_stage": "COMPLETE"})).unwrap(),
        )
        .unwrap();

        assert_eq!(scheduler.next_ready().unwrap().mission_title, "gated");
    }

    #[test]
    fn test_next_ready_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.add(QueueItem::new("a", "work", 3)).unwrap();
        scheduler.add(QueueItem::new("b", "work", 3)).unwrap();

        let first = scheduler.next_ready().unwrap();
        let second = scheduler.next_ready().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_pause_blocks_and_resume_restores() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.add(QueueItem::new("a", "work", 3)).unwrap();

        scheduler.pause(Some("maintenance")).unwrap();
        assert!(scheduler.next_ready().is_none());
        // Idempotent
        scheduler.pause(None).unwrap();

        assert!(scheduler.resume().unwrap());
        assert!(!scheduler.resume().unwrap());
        assert!(scheduler.next_ready().is_some());
    }

    #[test]
    fn test_take_next_ready_removes_item() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.add(QueueItem::new("only", "work", 3)).unwrap();

        let taken = scheduler.take_next_ready().unwrap().unwrap();
        assert_eq!(taken.mission_title, "only");
        assert!(scheduler.state().queue.is_empty());
        assert!(scheduler.state().last_processed_at.is_some());
        assert!(scheduler.take_next_ready().unwrap().is_none());
    }

    #[test]
    fn test_is_idle_tracks_mission_state() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        assert!(scheduler.is_idle());

        let mission_path = dir.path().join("state").join("mission.json");
        let mut mission = MissionRecord::new("busy", 3, "/tmp/ws");
        atomic::write_json(&mission_path, &mission).unwrap();
        assert!(!scheduler.is_idle());

        mission.current_stage = Stage::Complete;
        atomic::write_json(&mission_path, &mission).unwrap();
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_timeline_walks_clock_forward() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        let mut a = QueueItem::new("a", "work", 3);
        a.estimated_minutes = Some(30);
        let mut b = QueueItem::new("b", "work", 3);
        b.estimated_minutes = Some(60);
        scheduler.add(a).unwrap();
        scheduler.add(b).unwrap();

        let timeline = scheduler.timeline();
        assert_eq!(timeline.len(), 2);
        // Second item starts when the first ends
        assert_eq!(timeline[0].estimated_end, timeline[1].estimated_start);
    }

    #[test]
    fn test_statistics_counts() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.add(item_with_priority("a", Priority::High)).unwrap();
        scheduler.add(item_with_priority("b", Priority::Normal)).unwrap();

        let mut gated = QueueItem::new("c", "work", 3);
        gated.depends_on = Some("mission_nope".to_string());
        scheduler.add(gated).unwrap();

        let stats = scheduler.statistics();
        assert_eq!(stats.total_items, 3);
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.by_priority.get("high"), Some(&1));
        assert!(stats.total_estimated_minutes > 0);
    }

    #[test]
    fn test_reorder_then_sort_reimposes_priority() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let (low, _) = scheduler.add(item_with_priority("low", Priority::Low)).unwrap();
        let (high, _) = scheduler.add(item_with_priority("high", Priority::High)).unwrap();

        // Manually put the low-priority item first
        scheduler.reorder(&[low.id.clone(), high.id.clone()]).unwrap();
        assert_eq!(scheduler.state().queue[0].id, low.id);

        // Any subsequent add re-sorts and priority wins again
        scheduler.add(item_with_priority("normal", Priority::Normal)).unwrap();
        assert_eq!(scheduler.state().queue[0].id, high.id);
    }

    #[test]
    fn test_update_patch() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let (item, _) = scheduler.add(QueueItem::new("orig", "work", 3)).unwrap();

        let updated = scheduler
            .update(
                &item.id,
                QueueItemPatch {
                    priority: Some(Priority::Critical),
                    estimated_minutes: Some(Some(90)),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.priority, Priority::Critical);
        assert_eq!(updated.estimated_minutes, Some(90));

        assert!(scheduler
            .update("queue_missing", QueueItemPatch::default())
            .unwrap()
            .is_none());
    }
}
