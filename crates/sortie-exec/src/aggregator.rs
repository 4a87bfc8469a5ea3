//! Merges outputs from parallel agents and detects conflicts.

use serde::{Deserialize, Serialize};

use sortie_types::now_iso;

use crate::executor::{AgentResult, AgentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    FileBothModified,
    FileBothCreated,
    ContradictoryResults,
    PartialFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub agents_involved: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    pub requires_human_review: bool,
}

/// Per-agent digest carried into the merged report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub status: AgentStatus,
    pub summary: String,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

/// The final merged result of one executor run.
///
/// `success` requires zero failed/timed-out agents and no conflict that
/// needs human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedResult {
    pub mission_id: String,
    pub success: bool,
    pub total_agents: usize,
    pub completed_agents: usize,
    pub failed_agents: usize,
    pub timeout_agents: usize,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub agent_summaries: Vec<AgentSummary>,
    pub combined_summary: String,
    pub timestamp: String,
}

impl MergedResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn requires_human_review(&self) -> bool {
        self.conflicts.iter().any(|c| c.requires_human_review)
    }
}

pub fn merge(mission_id: &str, results: &[AgentResult]) -> MergedResult {
    let completed: Vec<&AgentResult> =
        results.iter().filter(|r| r.status == AgentStatus::Completed).collect();
    let failed: Vec<&AgentResult> =
        results.iter().filter(|r| r.status == AgentStatus::Failed).collect();
    let timeout: Vec<&AgentResult> =
        results.iter().filter(|r| r.status == AgentStatus::Timeout).collect();

    // file -> agents claiming it; only completed agents count
    let mut created_by: Vec<(String, Vec<String>)> = Vec::new();
    let mut modified_by: Vec<(String, Vec<String>)> = Vec::new();

    for result in &completed {
        for file in &result.files_created {
            claim(&mut created_by, file, &result.agent_id);
        }
        for file in &result.files_modified {
            claim(&mut modified_by, file, &result.agent_id);
        }
    }

    let mut conflicts = detect_conflicts(&created_by, &modified_by, &completed, &failed, &timeout);
    resolve_conflicts(&mut conflicts);

    let agent_summaries: Vec<AgentSummary> = results
        .iter()
        .map(|r| AgentSummary {
            agent_id: r.agent_id.clone(),
            status: r.status,
            summary: r
                .parsed_result
                .as_ref()
                .and_then(|p| p.get("summary"))
                .and_then(|s| s.as_str())
                .unwrap_or("No summary provided")
                .to_string(),
            files_created: r.files_created.clone(),
            files_modified: r.files_modified.clone(),
        })
        .collect();

    let combined_summary =
        combined_summary(mission_id, &completed, &failed, &timeout, &conflicts);

    let success = failed.is_empty()
        && timeout.is_empty()
        && !conflicts.iter().any(|c| c.requires_human_review);

    MergedResult {
        mission_id: mission_id.to_string(),
        success,
        total_agents: results.len(),
        completed_agents: completed.len(),
        failed_agents: failed.len(),
        timeout_agents: timeout.len(),
        files_created: created_by.iter().map(|(f, _)| f.clone()).collect(),
        files_modified: modified_by.iter().map(|(f, _)| f.clone()).collect(),
        conflicts,
        agent_summaries,
        combined_summary,
        timestamp: now_iso(),
    }
}

fn claim(claims: &mut Vec<(String, Vec<String>)>, file: &str, agent_id: &str) {
    match claims.iter_mut().find(|(f, _)| f == file) {
        Some((_, agents)) => {
            if !agents.iter().any(|a| a == agent_id) {
                agents.push(agent_id.to_string());
            }
        }
        None => claims.push((file.to_string(), vec![agent_id.to_string()])),
    }
}

fn detect_conflicts(
    created_by: &[(String, Vec<String>)],
    modified_by: &[(String, Vec<String>)],
    completed: &[&AgentResult],
    failed: &[&AgentResult],
    timeout: &[&AgentResult],
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    for (file, agents) in created_by {
        if agents.len() > 1 {
            conflicts.push(Conflict {
                kind: ConflictKind::FileBothCreated,
                agents_involved: agents.clone(),
                description: format!("File '{}' created by multiple agents", file),
                file_path: Some(file.clone()),
                resolution: None,
                requires_human_review: true,
            });
        }
    }

    for (file, agents) in modified_by {
        if agents.len() > 1 {
            conflicts.push(Conflict {
                kind: ConflictKind::FileBothModified,
                agents_involved: agents.clone(),
                description: format!("File '{}' modified by multiple agents", file),
                file_path: Some(file.clone()),
                resolution: None,
                requires_human_review: true,
            });
        }
    }

    let failed_like: Vec<&&AgentResult> = failed.iter().chain(timeout.iter()).collect();
    if !failed_like.is_empty() && !completed.is_empty() {
        conflicts.push(Conflict {
            kind: ConflictKind::PartialFailure,
            agents_involved: failed_like.iter().map(|r| r.agent_id.clone()).collect(),
            description: format!(
                "{} of {} agents failed",
                failed_like.len(),
                failed_like.len() + completed.len()
            ),
            file_path: None,
            resolution: None,
            // Escalate only when failures outnumber successes
            requires_human_review: failed_like.len() > completed.len(),
        });
    }

    conflicts
}

fn resolve_conflicts(conflicts: &mut [Conflict]) {
    for conflict in conflicts {
        match conflict.kind {
            ConflictKind::FileBothCreated => {
                conflict.resolution =
                    Some("Requires manual review to choose version".to_string());
            }
            ConflictKind::FileBothModified => {
                conflict.resolution =
                    Some("Requires manual review to merge changes".to_string());
            }
            // Informational unless the majority failed
            ConflictKind::PartialFailure => {
                conflict.resolution = Some("Proceeding with successful agents".to_string());
            }
            ConflictKind::ContradictoryResults => {}
        }
    }
}

fn combined_summary(
    mission_id: &str,
    completed: &[&AgentResult],
    failed: &[&AgentResult],
    timeout: &[&AgentResult],
    conflicts: &[Conflict],
) -> String {
    let mut lines = Vec::new();

    lines.push(format!("# Mission Summary: {}", mission_id));
    lines.push(String::new());
    lines.push("## Status".to_string());
    lines.push(format!("- Completed: {} agents", completed.len()));
    lines.push(format!("- Failed: {} agents", failed.len()));
    lines.push(format!("- Timed out: {} agents", timeout.len()));
    lines.push(format!("- Conflicts: {}", conflicts.len()));
    lines.push(String::new());

    if !completed.is_empty() {
        lines.push("## Completed Work".to_string());
        for result in completed {
            let summary = result
                .parsed_result
                .as_ref()
                .and_then(|p| p.get("summary"))
                .and_then(|s| s.as_str())
                .unwrap_or("No summary");
            lines.push(format!("### Agent: {}", result.agent_id));
            lines.push(summary.to_string());
            lines.push(String::new());
        }
    }

    if !failed.is_empty() || !timeout.is_empty() {
        lines.push("## Failures".to_string());
        for result in failed {
            let error = result.error.as_deref().unwrap_or("Unknown error");
            lines.push(format!("- **{}**: {}", result.agent_id, error));
        }
        for result in timeout {
            lines.push(format!("- **{}**: timed out", result.agent_id));
        }
        lines.push(String::new());
    }

    if !conflicts.is_empty() {
        lines.push("## Conflicts".to_string());
        for conflict in conflicts {
            lines.push(format!("- **{:?}**: {}", conflict.kind, conflict.description));
            if let Some(resolution) = &conflict.resolution {
                lines.push(format!("  - Resolution: {}", resolution));
            }
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::AgentRole;
    use serde_json::json;

    fn completed_result(agent_id: &str, created: &[&str], modified: &[&str]) -> AgentResult {
        AgentResult {
            agent_id: agent_id.to_string(),
            role: AgentRole::Worker,
            status: AgentStatus::Completed,
            response: String::new(),
            parsed_result: Some(json!({"summary": format!("work by {}", agent_id)})),
            elapsed_seconds: 1.0,
            files_created: created.iter().map(|s| s.to_string()).collect(),
            files_modified: modified.iter().map(|s| s.to_string()).collect(),
            error: None,
            subagent_results: Vec::new(),
        }
    }

    fn failed_result(agent_id: &str) -> AgentResult {
        AgentResult {
            agent_id: agent_id.to_string(),
            role: AgentRole::Worker,
            status: AgentStatus::Failed,
            response: String::new(),
            parsed_result: None,
            elapsed_seconds: 1.0,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            error: Some("boom".to_string()),
            subagent_results: Vec::new(),
        }
    }

    #[test]
    fn test_clean_merge_succeeds() {
        let results = vec![
            completed_result("a1", &["new.rs"], &[]),
            completed_result("a2", &[], &["other.rs"]),
        ];
        let merged = merge("m1", &results);
        assert!(merged.success);
        assert_eq!(merged.completed_agents, 2);
        assert!(merged.conflicts.is_empty());
        assert_eq!(merged.files_created, vec!["new.rs"]);
        assert_eq!(merged.files_modified, vec!["other.rs"]);
    }

    #[test]
    fn test_both_modified_conflict_blocks_success() {
        let results = vec![
            completed_result("a1", &[], &["src/x.rs"]),
            completed_result("a2", &[], &["src/x.rs", "src/y.rs"]),
        ];
        let merged = merge("m1", &results);
        assert!(!merged.success);
        assert_eq!(merged.conflicts.len(), 1);
        let conflict = &merged.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::FileBothModified);
        assert!(conflict.requires_human_review);
        assert_eq!(conflict.file_path.as_deref(), Some("src/x.rs"));
        // The union still lists each file once
        assert_eq!(merged.files_modified.len(), 2);
    }

    #[test]
    fn test_both_created_conflict() {
        let results = vec![
            completed_result("a1", &["dup.rs"], &[]),
            completed_result("a2", &["dup.rs"], &[]),
        ];
        let merged = merge("m1", &results);
        assert_eq!(merged.conflicts[0].kind, ConflictKind::FileBothCreated);
        assert!(merged.requires_human_review());
    }

    #[test]
    fn test_partial_failure_minority_auto_resolves() {
        let results = vec![
            completed_result("a1", &[], &[]),
            completed_result("a2", &[], &[]),
            failed_result("a3"),
        ];
        let merged = merge("m1", &results);
        assert!(!merged.success);
        let conflict = &merged.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::PartialFailure);
        assert!(!conflict.requires_human_review);
        assert_eq!(conflict.resolution.as_deref(), Some("Proceeding with successful agents"));
    }

    #[test]
    fn test_partial_failure_majority_escalates() {
        let results = vec![
            completed_result("a1", &[], &[]),
            failed_result("a2"),
            failed_result("a3"),
        ];
        let merged = merge("m1", &results);
        assert!(merged.conflicts[0].requires_human_review);
    }

    #[test]
    fn test_combined_summary_sections() {
        let results = vec![completed_result("a1", &[], &[]), failed_result("a2")];
        let merged = merge("m1", &results);
        assert!(merged.combined_summary.contains("## Status"));
        assert!(merged.combined_summary.contains("## Completed Work"));
        assert!(merged.combined_summary.contains("## Failures"));
        assert!(merged.combined_summary.contains("work by a1"));
    }
}
