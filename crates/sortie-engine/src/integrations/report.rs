//! Final-report pipeline on MISSION_COMPLETED.
//!
//! Writes the mission log JSON used by dependency checks and duration
//! estimation, saves a next-mission recommendation, and hands the report
//! to the knowledge base for learning extraction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::json;

use sortie_kb::{KnowledgeBase, SuggestionStore};
use sortie_types::{now_iso, parse_iso, MissionRecord, Suggestion, SuggestionSource};

use crate::events::{IntegrationEvent, IntegrationHandler};

pub struct ReportIntegration {
    mission_logs_dir: PathBuf,
    suggestions: Option<Arc<Mutex<SuggestionStore>>>,
    kb: Option<Arc<KnowledgeBase>>,
}

impl ReportIntegration {
    pub fn new(
        mission_logs_dir: &Path,
        suggestions: Option<Arc<Mutex<SuggestionStore>>>,
        kb: Option<Arc<KnowledgeBase>>,
    ) -> Self {
        ReportIntegration {
            mission_logs_dir: mission_logs_dir.to_path_buf(),
            suggestions,
            kb,
        }
    }

    fn build_report(mission: &MissionRecord) -> serde_json::Value {
        let duration_seconds = parse_iso(&mission.created_at)
            .zip(parse_iso(&mission.last_updated))
            .map(|(start, end)| (end - start).num_seconds().max(0))
            .unwrap_or(0);

        json!({
            "mission_id": mission.mission_id,
            "original_mission": mission.original_mission,
            "problem_statement": mission.problem_statement,
            "current_stage": "COMPLETE",
            "final_stage": if mission.halt_reason.is_some() { "ABORTED" } else { "COMPLETE" },
            "halt_reason": mission.halt_reason,
            "total_cycles": mission.current_cycle,
            "total_duration_seconds": duration_seconds,
            "created_at": mission.created_at,
            "completed_at": now_iso(),
            "cycles": mission.cycles,
            "history": mission.history,
            "final_summary": mission.final_summary,
            "deliverables": mission.deliverables,
        })
    }

    fn save_recommendation(&self, mission: &MissionRecord) -> anyhow::Result<()> {
        let Some(store) = &self.suggestions else { return Ok(()) };

        let mut suggestion = match &mission.halt_reason {
            Some(halt_reason) => {
                let mut s = Suggestion::new(
                    &format!("Revisit: {}", truncated_title(&mission.original_mission)),
                    &mission.original_mission,
                    SuggestionSource::DriftHalt,
                );
                s.rationale = Some(format!("Mission halted: {}", halt_reason));
                s.drift_context = Some(json!({
                    "halt_reason": halt_reason,
                    "cycles_used": mission.current_cycle,
                }));
                s.priority_score = 70.0;
                s
            }
            None => {
                let mut s = Suggestion::new(
                    &format!("Follow up: {}", truncated_title(&mission.original_mission)),
                    &mission.original_mission,
                    SuggestionSource::SuccessfulCompletion,
                );
                s.rationale = mission.final_summary.clone();
                s
            }
        };

        suggestion.source_mission_id = Some(mission.mission_id.clone());
        suggestion.source_mission_summary = mission.final_summary.clone();
        suggestion.suggested_cycles = mission.cycle_budget;

        store.lock().unwrap().add(&suggestion)?;
        Ok(())
    }
}

fn truncated_title(text: &str) -> String {
    let title: String = text.chars().take(60).collect();
    title.lines().next().unwrap_or(&title).to_string()
}

impl IntegrationHandler for ReportIntegration {
    fn name(&self) -> &str {
        "mission_report"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn on_mission_completed(&mut self, event: &IntegrationEvent) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.mission_logs_dir)?;

        let report = Self::build_report(&event.mission);
        let stamp = now_iso().replace([':', '.'], "-");
        let path = self
            .mission_logs_dir
            .join(format!("{}_{}.json", event.mission.mission_id, stamp));
        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
        tracing::info!(report = %path.display(), "mission report written");

        self.save_recommendation(&event.mission)?;

        if let Some(kb) = &self.kb {
            kb.ingest_completed_mission(&path)?;
        }
        Ok(())
    }
}
