//! Stage prompt composition.
//!
//! Each stage prompt is the problem statement, the stage instructions
//! (including its write restrictions), the ground rules, any injected
//! contexts from integrations, and on PLANNING the crash-recovery blurb.

use std::path::Path;

use sortie_types::{MissionRecord, Stage};

use crate::restrictions::permitted_roots;

pub fn stage_instructions(stage: Stage) -> &'static str {
    match stage {
        Stage::Planning => {
            "Understand the mission and produce an implementation plan.\n\
             Write `artifacts/implementation_plan.md` listing every file you\n\
             intend to create or modify, plus research notes under `research/`.\n\
             Do not write code yet."
        }
        Stage::Building => {
            "Implement the plan. You have full write access to the workspace.\n\
             Follow `artifacts/implementation_plan.md`; note deviations as you go."
        }
        Stage::Testing => {
            "Exercise what was built. Run and extend the tests; record results.\n\
             Your response must state clearly whether the tests pass."
        }
        Stage::Analyzing => {
            "Review the cycle's results. Write your analysis under\n\
             `reports/analysis/` only. Decide whether the mission should\n\
             continue another cycle, loop back to building, or halt."
        }
        Stage::CycleEnd => {
            "Summarize the cycle under `artifacts/cycle_reports/`: what was\n\
             achieved, what issues remain, and a continuation prompt for the\n\
             next cycle if one is warranted."
        }
        Stage::Complete => "The mission is complete. No further writes are permitted.",
    }
}

/// Expected JSON envelope per stage, appended to the instructions.
fn response_contract(stage: Stage) -> &'static str {
    match stage {
        Stage::Testing => {
            "\n# Response Format\nReturn JSON with:\n\
             {\n    \"status\": \"completed\" | \"failed\",\n    \"tests_passed\": true | false,\n    \"summary\": \"what was verified\",\n    \"failures\": []\n}\n"
        }
        Stage::Analyzing => {
            "\n# Response Format\nReturn JSON with:\n\
             {\n    \"status\": \"completed\",\n    \"verdict\": \"continue\" | \"regression\" | \"halt\",\n    \"summary\": \"assessment of the cycle\",\n    \"halt_reason\": null\n}\n"
        }
        Stage::CycleEnd => {
            "\n# Response Format\nReturn JSON with:\n\
             {\n    \"status\": \"completed\",\n    \"summary\": \"cycle summary\",\n    \"achievements\": [],\n    \"issues\": [],\n    \"continuation_prompt\": \"guidance for the next cycle\"\n}\n"
        }
        _ => {
            "\n# Response Format\nReturn JSON with:\n\
             {\n    \"status\": \"completed\" | \"failed\",\n    \"files_created\": [],\n    \"files_modified\": [],\n    \"summary\": \"what was accomplished\"\n}\n"
        }
    }
}

fn restrictions_block(stage: Stage) -> String {
    let roots = permitted_roots(stage);
    let description = if roots.is_empty() {
        "read-only: no writes are permitted".to_string()
    } else if roots.contains(&"") {
        "the full mission workspace".to_string()
    } else {
        roots.join(", ")
    };
    format!("# Write Restrictions\nPermitted write roots for this stage: {}\n", description)
}

/// Load the operator's ground rules, empty when the file is absent.
pub fn load_ground_rules(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

pub fn compose_stage_prompt(
    mission: &MissionRecord,
    stage: Stage,
    ground_rules: &str,
    injected_contexts: &[String],
    recovery_context: Option<&str>,
) -> String {
    let mut prompt = String::new();

    if let Some(recovery) = recovery_context {
        prompt.push_str(recovery);
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "# Mission\n{}\n\n# Current Stage: {} (cycle {} of {}, iteration {})\n\n",
        mission.problem_statement,
        stage,
        mission.current_cycle,
        mission.cycle_budget,
        mission.iteration,
    ));

    prompt.push_str(&format!("# Stage Instructions\n{}\n\n", stage_instructions(stage)));
    prompt.push_str(&restrictions_block(stage));

    if !ground_rules.is_empty() {
        prompt.push_str(&format!("\n# Ground Rules\n{}\n", ground_rules));
    }

    for context in injected_contexts {
        prompt.push('\n');
        prompt.push_str(context);
        prompt.push('\n');
    }

    prompt.push_str(response_contract(stage));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_stage_and_restrictions() {
        let mission = MissionRecord::new("build the widget", 3, "/tmp/ws");
        let prompt = compose_stage_prompt(&mission, Stage::Planning, "", &[], None);
        assert!(prompt.contains("build the widget"));
        assert!(prompt.contains("Current Stage: PLANNING"));
        assert!(prompt.contains("artifacts, research"));
        assert!(prompt.contains("Response Format"));
    }

    #[test]
    fn test_recovery_context_leads_the_prompt() {
        let mission = MissionRecord::new("m", 3, "/tmp/ws");
        let prompt = compose_stage_prompt(
            &mission,
            Stage::Building,
            "",
            &[],
            Some("=== CRASH RECOVERY ===\nresume\n"),
        );
        assert!(prompt.starts_with("=== CRASH RECOVERY ==="));
    }

    #[test]
    fn test_injected_contexts_present() {
        let mission = MissionRecord::new("m", 3, "/tmp/ws");
        let contexts = vec!["=== LEARNINGS FROM PAST MISSIONS ===\nstuff".to_string()];
        let prompt = compose_stage_prompt(&mission, Stage::Planning, "rules", &contexts, None);
        assert!(prompt.contains("LEARNINGS FROM PAST MISSIONS"));
        assert!(prompt.contains("# Ground Rules\nrules"));
    }

    #[test]
    fn test_analyzing_contract_has_verdict() {
        let mission = MissionRecord::new("m", 3, "/tmp/ws");
        let prompt = compose_stage_prompt(&mission, Stage::Analyzing, "", &[], None);
        assert!(prompt.contains("\"verdict\""));
    }
}
