use serde::{Deserialize, Serialize};

use crate::util::{now_iso, parse_iso, short_id};

/// Queue priority; lower weight sorts earlier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn weight(&self) -> u32 {
        match self {
            Priority::Critical => 0,
            Priority::High => 5,
            Priority::Normal => 10,
            Priority::Low => 20,
        }
    }

    /// Lenient parse for user input; anything unrecognized is NORMAL.
    pub fn parse_lenient(value: &str) -> Priority {
        match value.to_ascii_lowercase().as_str() {
            "critical" => Priority::Critical,
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Outcome of a dependency check against the mission log store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Ready,
    Waiting,
    Blocked,
    NotFound,
}

/// Parsed form of a queue item's `start_condition` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCondition {
    /// `idle_after:HH:MM` — past the clock time AND no mission in flight
    IdleAfter { hour: u32, minute: u32 },
    /// `at:<iso>` — not before the given instant
    At(String),
    /// `after_mission:<id>` — dependency rule on the named mission
    AfterMission(String),
}

impl StartCondition {
    pub fn parse(raw: &str) -> Option<StartCondition> {
        if let Some(rest) = raw.strip_prefix("idle_after:") {
            let (h, m) = rest.split_once(':')?;
            let hour: u32 = h.parse().ok()?;
            let minute: u32 = m.parse().ok()?;
            if hour < 24 && minute < 60 {
                return Some(StartCondition::IdleAfter { hour, minute });
            }
            return None;
        }
        if let Some(rest) = raw.strip_prefix("at:") {
            parse_iso(rest)?;
            return Some(StartCondition::At(rest.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("after_mission:") {
            if !rest.is_empty() {
                return Some(StartCondition::AfterMission(rest.to_string()));
            }
        }
        None
    }
}

/// One queued mission awaiting advancement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    #[serde(default)]
    pub recommendation_id: Option<String>,
    pub mission_title: String,
    pub mission_description: String,
    pub cycle_budget: u32,
    pub queued_at: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_start: Option<String>,
    #[serde(default)]
    pub start_condition: Option<String>,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl QueueItem {
    pub fn new(title: &str, description: &str, cycle_budget: u32) -> Self {
        QueueItem {
            id: short_id("queue"),
            recommendation_id: None,
            mission_title: title.to_string(),
            mission_description: description.to_string(),
            cycle_budget: cycle_budget.clamp(1, 10),
            queued_at: now_iso(),
            priority: Priority::Normal,
            scheduled_start: None,
            start_condition: None,
            depends_on: None,
            estimated_minutes: None,
            created_by: None,
            tags: Vec::new(),
        }
    }

    pub fn parsed_start_condition(&self) -> Option<StartCondition> {
        self.start_condition.as_deref().and_then(StartCondition::parse)
    }
}

fn default_true() -> bool {
    true
}

/// Full on-disk queue state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub queue: Vec<QueueItem>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_processed_at: Option<String>,
    #[serde(default = "default_true")]
    pub auto_estimate_time: bool,
    #[serde(default)]
    pub default_priority: Priority,
    #[serde(default)]
    pub notification_settings: Option<serde_json::Value>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub paused_at: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<String>,
}

impl Default for QueueState {
    fn default() -> Self {
        QueueState {
            queue: Vec::new(),
            enabled: true,
            last_processed_at: None,
            auto_estimate_time: true,
            default_priority: Priority::Normal,
            notification_settings: None,
            paused: false,
            paused_at: None,
            pause_reason: None,
        }
    }
}

/// In-file record for the cross-process queue lock.
///
/// Valid iff `now < expires_at` AND the owning PID is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub locked_at: String,
    pub locked_by: String,
    #[serde(default)]
    pub mission_id: Option<String>,
    pub operation: String,
    pub pid: u32,
    pub expires_at: String,
}

impl LockRecord {
    pub fn is_expired(&self) -> bool {
        match parse_iso(&self.expires_at) {
            Some(expires) => chrono::Utc::now() > expires,
            // Unparseable expiry counts as expired
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_weights_order() {
        assert!(Priority::Critical.weight() < Priority::High.weight());
        assert!(Priority::High.weight() < Priority::Normal.weight());
        assert!(Priority::Normal.weight() < Priority::Low.weight());
    }

    #[test]
    fn test_priority_lenient_parse() {
        assert_eq!(Priority::parse_lenient("HIGH"), Priority::High);
        assert_eq!(Priority::parse_lenient("garbage"), Priority::Normal);
    }

    #[test]
    fn test_start_condition_parse() {
        assert_eq!(
            StartCondition::parse("idle_after:17:30"),
            Some(StartCondition::IdleAfter { hour: 17, minute: 30 })
        );
        assert_eq!(
            StartCondition::parse("after_mission:mission_ab12cd34"),
            Some(StartCondition::AfterMission("mission_ab12cd34".to_string()))
        );
        assert!(matches!(
            StartCondition::parse("at:2026-07-01T17:00:00Z"),
            Some(StartCondition::At(_))
        ));
        assert_eq!(StartCondition::parse("idle_after:25:00"), None);
        assert_eq!(StartCondition::parse("bogus"), None);
    }

    #[test]
    fn test_queue_state_defaults_from_empty_json() {
        let state: QueueState = serde_json::from_str("{}").unwrap();
        assert!(state.enabled);
        assert!(!state.paused);
        assert!(state.queue.is_empty());
        assert_eq!(state.default_priority, Priority::Normal);
    }

    #[test]
    fn test_lock_record_expiry() {
        let expired = LockRecord {
            locked_at: "2020-01-01T00:00:00Z".to_string(),
            locked_by: "test".to_string(),
            mission_id: None,
            operation: "queue_processing".to_string(),
            pid: 1,
            expires_at: "2020-01-01T00:01:00Z".to_string(),
        };
        assert!(expired.is_expired());

        let garbled = LockRecord { expires_at: "???".to_string(), ..expired.clone() };
        assert!(garbled.is_expired());
    }
}
