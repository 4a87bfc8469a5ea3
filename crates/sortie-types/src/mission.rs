use serde::{Deserialize, Serialize};

use crate::util::{now_iso, short_id};

/// One node in the fixed mission state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Planning,
    Building,
    Testing,
    Analyzing,
    CycleEnd,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Planning,
        Stage::Building,
        Stage::Testing,
        Stage::Analyzing,
        Stage::CycleEnd,
        Stage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "PLANNING",
            Stage::Building => "BUILDING",
            Stage::Testing => "TESTING",
            Stage::Analyzing => "ANALYZING",
            Stage::CycleEnd => "CYCLE_END",
            Stage::Complete => "COMPLETE",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    /// Stages reachable from this one. TESTING branches on verdict,
    /// CYCLE_END on remaining cycle budget.
    pub fn successors(&self) -> &'static [Stage] {
        match self {
            Stage::Planning => &[Stage::Building],
            Stage::Building => &[Stage::Testing],
            Stage::Testing => &[Stage::Analyzing, Stage::Building],
            Stage::Analyzing => &[Stage::CycleEnd],
            Stage::CycleEnd => &[Stage::Planning, Stage::Complete],
            Stage::Complete => &[],
        }
    }

    pub fn can_transition_to(&self, next: Stage) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped event in a mission's history log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub stage: Stage,
    pub entry: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Summary of one completed cycle, written at CYCLE_END
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u32,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub achievements: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub continuation_prompt: Option<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
}

/// The mission state file (single JSON object, single writer).
///
/// Invariants:
/// - `current_stage == COMPLETE` means the record is frozen.
/// - `current_cycle <= cycle_budget + 1` (one rollover cycle is allowed
///   before the engine forces completion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRecord {
    pub mission_id: String,
    pub problem_statement: String,
    pub current_stage: Stage,
    pub current_cycle: u32,
    #[serde(default)]
    pub iteration: u32,
    pub cycle_budget: u32,
    pub created_at: String,
    pub last_updated: String,
    pub mission_workspace: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub cycles: Vec<CycleSummary>,
    pub original_mission: String,
    #[serde(default)]
    pub final_summary: Option<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub halt_reason: Option<String>,
}

impl MissionRecord {
    pub fn new(problem_statement: &str, cycle_budget: u32, workspace: &str) -> Self {
        let now = now_iso();
        MissionRecord {
            mission_id: short_id("mission"),
            problem_statement: problem_statement.to_string(),
            current_stage: Stage::Planning,
            current_cycle: 1,
            iteration: 0,
            cycle_budget: cycle_budget.clamp(1, 10),
            created_at: now.clone(),
            last_updated: now,
            mission_workspace: workspace.to_string(),
            history: Vec::new(),
            cycles: Vec::new(),
            original_mission: problem_statement.to_string(),
            final_summary: None,
            deliverables: Vec::new(),
            halt_reason: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// Completed missions are frozen; everything else may advance.
    pub fn can_mutate(&self) -> bool {
        !self.is_complete()
    }

    /// Whether another PLANNING cycle fits inside the budget.
    pub fn cycles_remaining(&self) -> bool {
        self.current_cycle < self.cycle_budget
    }

    pub fn record_history(&mut self, entry: &str, details: serde_json::Value) {
        self.history.push(HistoryEntry {
            timestamp: now_iso(),
            stage: self.current_stage,
            entry: entry.to_string(),
            details,
        });
        self.last_updated = now_iso();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serde_wire_format() {
        assert_eq!(serde_json::to_string(&Stage::CycleEnd).unwrap(), "\"CYCLE_END\"");
        let parsed: Stage = serde_json::from_str("\"PLANNING\"").unwrap();
        assert_eq!(parsed, Stage::Planning);
    }

    #[test]
    fn test_stage_transitions() {
        assert!(Stage::Planning.can_transition_to(Stage::Building));
        assert!(Stage::Testing.can_transition_to(Stage::Building));
        assert!(Stage::Testing.can_transition_to(Stage::Analyzing));
        assert!(!Stage::Planning.can_transition_to(Stage::Complete));
        assert!(Stage::Complete.successors().is_empty());
    }

    #[test]
    fn test_mission_new_clamps_budget() {
        let m = MissionRecord::new("do a thing", 99, "/tmp/ws");
        assert_eq!(m.cycle_budget, 10);
        assert_eq!(m.current_cycle, 1);
        assert_eq!(m.original_mission, "do a thing");
        assert!(m.can_mutate());
    }

    #[test]
    fn test_mission_roundtrip() {
        let mut m = MissionRecord::new("roundtrip", 3, "/tmp/ws");
        m.record_history("started", serde_json::json!({"k": 1}));
        let json = serde_json::to_string(&m).unwrap();
        let back: MissionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mission_id, m.mission_id);
        assert_eq!(back.history.len(), 1);
        assert_eq!(back.history[0].stage, Stage::Planning);
    }
}
