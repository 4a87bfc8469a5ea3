//! The mission state machine.
//!
//! PLANNING -> BUILDING -> TESTING -> ANALYZING -> CYCLE_END -> COMPLETE,
//! with TESTING looping back to BUILDING on failure and CYCLE_END looping
//! to PLANNING while cycles remain. One engine instance drives one
//! mission at a time; the mission file has a single writer (this engine)
//! and any number of readers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use sortie_exec::executor::{ExecutorConfig, HierarchicalExecutor};
use sortie_exec::invoker::{classify_response, parse_response, LlmInvoker, ResponseKind};
use sortie_exec::splitter::MissionSplitter;
use sortie_queue::{ProcessingLock, QueueScheduler};
use sortie_store::recovery::{scan_checkpoints, StageRecovery};
use sortie_store::atomic;
use sortie_types::{
    now_iso, CycleSummary, MissionRecord, QueueItem, SplitStrategy, Stage,
};

use crate::config::InstallPaths;
use crate::error::{Error, Result};
use crate::events::{EventKind, IntegrationEvent, IntegrationRegistry};
use crate::prompts;
use crate::restrictions::WriteGuard;

/// Tuning for stage execution
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_agents: usize,
    pub max_subagents_per_agent: usize,
    pub stage_timeout: Duration,
    pub worker_model: String,
    pub subagent_model: String,
    /// Fan BUILDING/TESTING out across parallel workers
    pub use_executor: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            max_agents: 5,
            max_subagents_per_agent: 10,
            stage_timeout: Duration::from_secs(3600),
            worker_model: "sonnet".to_string(),
            subagent_model: "haiku".to_string(),
            use_executor: true,
        }
    }
}

/// Result of one stage run
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub next_stage: Stage,
    pub success: bool,
    pub summary: String,
    pub details: Value,
}

pub struct StageEngine {
    paths: InstallPaths,
    options: EngineOptions,
    invoker: Arc<dyn LlmInvoker>,
    registry: IntegrationRegistry,
    ground_rules: String,
}

impl StageEngine {
    pub fn new(
        paths: InstallPaths,
        options: EngineOptions,
        invoker: Arc<dyn LlmInvoker>,
        registry: IntegrationRegistry,
    ) -> Result<Self> {
        paths.ensure_directories()?;
        let ground_rules = prompts::load_ground_rules(&paths.ground_rules_path());
        Ok(StageEngine { paths, options, invoker, registry, ground_rules })
    }

    pub fn paths(&self) -> &InstallPaths {
        &self.paths
    }

    pub fn current_mission(&self) -> Option<MissionRecord> {
        atomic::read_json(&self.paths.mission_path(), None)
    }

    fn save_mission(&self, mission: &MissionRecord) -> Result<()> {
        atomic::write_json(&self.paths.mission_path(), mission)?;
        Ok(())
    }

    /// Create a new mission and write its initial state. Refuses while
    /// another mission is still in flight.
    pub fn begin_mission(
        &mut self,
        problem_statement: &str,
        cycle_budget: u32,
    ) -> Result<MissionRecord> {
        if let Some(current) = self.current_mission() {
            if !current.is_complete() {
                return Err(Error::InvalidOperation(format!(
                    "mission {} is still in progress ({})",
                    current.mission_id, current.current_stage
                )));
            }
        }

        let mut mission = MissionRecord::new(problem_statement, cycle_budget, "");
        let workspace = self.paths.mission_workspace(&mission.mission_id);
        mission.mission_workspace = workspace.to_string_lossy().to_string();

        for sub in ["artifacts", "research", "tests", "reports/analysis", "artifacts/cycle_reports"]
        {
            std::fs::create_dir_all(workspace.join(sub))?;
        }

        mission.record_history("mission created", json!({"cycle_budget": cycle_budget}));
        self.save_mission(&mission)?;
        tracing::info!(mission = %mission.mission_id, "mission created");
        Ok(mission)
    }

    pub fn begin_mission_from_item(&mut self, item: &QueueItem) -> Result<MissionRecord> {
        let statement = if item.mission_description.is_empty() {
            item.mission_title.clone()
        } else {
            format!("{}\n\n{}", item.mission_title, item.mission_description)
        };
        self.begin_mission(&statement, item.cycle_budget)
    }

    /// Queue advancement: under the cross-process lock, pop the next
    /// ready item and write the new mission's initial state. Returns None
    /// when the lock is contended or nothing is ready.
    pub fn advance_from_queue(
        &mut self,
        scheduler: &QueueScheduler,
        lock: &ProcessingLock,
    ) -> Result<Option<MissionRecord>> {
        if !scheduler.is_idle() {
            return Ok(None);
        }

        let Some(_guard) = lock.guard("engine", None, Duration::from_secs(5), false) else {
            tracing::debug!("queue advancement skipped: lock contended");
            return Ok(None);
        };

        let Some(item) = scheduler.take_next_ready().map_err(Error::Component)? else {
            return Ok(None);
        };

        let mission = self.begin_mission_from_item(&item)?;
        tracing::info!(mission = %mission.mission_id, queue_item = %item.id,
            "queue advanced into new mission");
        Ok(Some(mission))
    }

    /// Run the mission's current stage and transition. The engine keeps
    /// the mission advancing whenever it can: stage-level failures leave
    /// the stage unchanged for a later re-drive rather than erroring.
    pub fn advance(&mut self) -> Result<StageOutcome> {
        let Some(mut mission) = self.current_mission() else {
            return Err(Error::State("no mission state present".to_string()));
        };
        if mission.is_complete() {
            return Err(Error::InvalidOperation("mission is already COMPLETE".to_string()));
        }

        let outcome = self.run_stage(&mut mission)?;
        Ok(outcome)
    }

    /// Drive the mission until COMPLETE or until a stage fails to move.
    pub fn run_to_completion(&mut self, max_steps: usize) -> Result<Stage> {
        for _ in 0..max_steps {
            let Some(mission) = self.current_mission() else {
                return Err(Error::State("no mission state present".to_string()));
            };
            if mission.is_complete() {
                return Ok(Stage::Complete);
            }
            let outcome = self.advance()?;
            if outcome.next_stage == outcome.stage && !outcome.success {
                // Stuck stage; give the operator the failure
                return Ok(outcome.stage);
            }
        }
        Ok(self
            .current_mission()
            .map(|m| m.current_stage)
            .unwrap_or(Stage::Complete))
    }

    fn run_stage(&mut self, mission: &mut MissionRecord) -> Result<StageOutcome> {
        let stage = mission.current_stage;
        let workspace = Path::new(&mission.mission_workspace).to_path_buf();

        // Recovery context comes from a previous crashed attempt at this
        // stage, so it is computed before this attempt writes its own
        // checkpoint
        let recovery_context = if matches!(stage, Stage::Planning | Stage::Building) {
            scan_checkpoints(&self.paths.checkpoints_dir())
                .into_iter()
                .find(|record| record.mission_id == mission.mission_id && record.stage == stage)
                .map(|record| record.recovery_context())
        } else {
            None
        };

        let recovery =
            StageRecovery::new(&self.paths.checkpoints_dir(), &mission.mission_id, stage)
                .map_err(Error::Component)?;
        recovery
            .save_progress(
                json!({"status": "started"}),
                Vec::new(),
                Vec::new(),
                &format!("{} was starting", stage),
                mission.iteration,
                mission.current_cycle,
            )
            .map_err(Error::Component)?;

        let started_event = IntegrationEvent::new(EventKind::StageStarted, mission, stage);
        let contexts = self.registry.dispatch_stage_started(&started_event);

        // The guard descriptor must exist before any invocation
        let _guard = WriteGuard::install(&workspace, stage)?;

        let prompt = prompts::compose_stage_prompt(
            mission,
            stage,
            &self.ground_rules,
            &contexts,
            recovery_context.as_deref(),
        );
        self.registry.dispatch_prompt_generated(
            &IntegrationEvent::new(EventKind::PromptGenerated, mission, stage)
                .with_prompt(&prompt),
        );

        let outcome = match stage {
            Stage::Building | Stage::Testing if self.options.use_executor => {
                self.run_executor_stage(mission, stage)?
            }
            _ => self.run_single_stage(mission, stage, &prompt, &recovery)?,
        };

        // A stage that could not move persists its checkpoint for the
        // next re-drive; a completed stage clears it
        if outcome.next_stage != stage || outcome.success {
            recovery.clear();
        }

        // Snapshot the event before the transition mutates iteration and
        // cycle, so stage-ended handlers see the run they observed start
        let ended_event = IntegrationEvent::new(EventKind::StageEnded, mission, stage)
            .with_details(outcome.details.clone());

        self.apply_transition(mission, &outcome)?;

        self.registry.dispatch_stage_ended(&ended_event);

        if mission.is_complete() {
            self.registry.dispatch_mission_completed(
                &IntegrationEvent::new(EventKind::MissionCompleted, mission, Stage::Complete)
                    .with_details(json!({"halt_reason": mission.halt_reason})),
            );
            // File-based IPC for the dashboard's auto-advance watcher
            if let Err(e) = atomic::write_json(
                &self.paths.auto_advance_signal_path(),
                &json!({"mission_id": mission.mission_id, "completed_at": now_iso()}),
            ) {
                tracing::warn!(error = %e, "failed to write auto-advance signal");
            }
        }

        Ok(outcome)
    }

    /// Single-invocation stages: PLANNING, ANALYZING, CYCLE_END (and
    /// BUILDING/TESTING when the executor is disabled).
    fn run_single_stage(
        &mut self,
        mission: &MissionRecord,
        stage: Stage,
        prompt: &str,
        recovery: &StageRecovery,
    ) -> Result<StageOutcome> {
        let response = self.invoker.invoke(prompt, &self.options.worker_model, self.options.stage_timeout);

        match classify_response(&response.text) {
            ResponseKind::Timeout => {
                recovery
                    .save_progress(
                        json!({"status": "timed_out"}),
                        Vec::new(),
                        Vec::new(),
                        &format!("{} invocation hit its deadline; resume it", stage),
                        mission.iteration,
                        mission.current_cycle,
                    )
                    .map_err(Error::Component)?;
                tracing::warn!(stage = %stage, "stage invocation timed out");
                return Ok(StageOutcome {
                    stage,
                    next_stage: stage,
                    success: false,
                    summary: "stage invocation timed out".to_string(),
                    details: json!({"timeout": true}),
                });
            }
            ResponseKind::Failed => {
                tracing::warn!(stage = %stage, "stage invocation failed");
                return Ok(StageOutcome {
                    stage,
                    next_stage: stage,
                    success: false,
                    summary: response.text.chars().take(200).collect(),
                    details: json!({"failed": true}),
                });
            }
            ResponseKind::Completed => {}
        }

        let parsed = parse_response(&response.text);
        let summary = parsed
            .as_ref()
            .and_then(|p| p.get("summary"))
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string();

        let next_stage = match stage {
            Stage::Planning => Stage::Building,
            Stage::Building => Stage::Testing,
            Stage::Testing => {
                let passed = parsed
                    .as_ref()
                    .and_then(|p| p.get("tests_passed"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                if passed {
                    Stage::Analyzing
                } else {
                    Stage::Building
                }
            }
            Stage::Analyzing => Stage::CycleEnd,
            Stage::CycleEnd | Stage::Complete => Stage::Complete,
        };

        Ok(StageOutcome {
            stage,
            next_stage,
            success: true,
            summary,
            details: parsed.unwrap_or(Value::Null),
        })
    }

    /// BUILDING/TESTING via the hierarchical executor: split the mission
    /// into work units and fan them out across parallel workers.
    fn run_executor_stage(
        &mut self,
        mission: &MissionRecord,
        stage: Stage,
    ) -> Result<StageOutcome> {
        let splitter = MissionSplitter::new();
        let units = splitter.split(
            &mission.problem_statement,
            SplitStrategy::Auto,
            self.options.max_agents,
        );

        let mut config = ExecutorConfig::new(&mission.mission_id);
        config.description = format!("{} stage for {}", stage, mission.mission_id);
        config.total_timeout = self.options.stage_timeout;
        config.max_agents = self.options.max_agents;
        config.max_subagents_per_agent = self.options.max_subagents_per_agent;
        config.worker_model = self.options.worker_model.clone();
        config.subagent_model = self.options.subagent_model.clone();

        let executor = HierarchicalExecutor::new(
            config,
            &self.paths.checkpoints_dir(),
            Arc::clone(&self.invoker),
        )
        .map_err(Error::Component)?;

        let results = executor.run(units, None).map_err(Error::Component)?;
        let _ = results.save(&self.paths.executor_results_dir());
        let merged = &results.merged;

        let all_failed = merged.completed_agents == 0 && merged.total_agents > 0;
        let details = json!({
            "total_agents": merged.total_agents,
            "completed": merged.completed_agents,
            "failed": merged.failed_agents,
            "timeout": merged.timeout_agents,
            "conflicts": merged.conflicts.len(),
            "requires_human_review": merged.requires_human_review(),
            "all_units_failed": all_failed,
        });

        let next_stage = match stage {
            Stage::Building => {
                if all_failed {
                    // Unrecoverable build: let ANALYZING decide what next
                    Stage::Analyzing
                } else {
                    Stage::Testing
                }
            }
            Stage::Testing => {
                if merged.success {
                    Stage::Analyzing
                } else if all_failed {
                    Stage::Analyzing
                } else {
                    Stage::Building
                }
            }
            other => other,
        };

        Ok(StageOutcome {
            stage,
            next_stage,
            success: merged.success,
            summary: merged.combined_summary.clone(),
            details,
        })
    }

    fn apply_transition(
        &mut self,
        mission: &mut MissionRecord,
        outcome: &StageOutcome,
    ) -> Result<()> {
        let stage = outcome.stage;
        let mut next = outcome.next_stage;

        if next == stage {
            // Stage did not move; only the attempt is recorded
            mission.record_history(
                &format!("{} attempt did not complete", stage),
                outcome.details.clone(),
            );
            self.save_mission(mission)?;
            return Ok(());
        }

        if !stage.can_transition_to(next) {
            return Err(Error::InvalidOperation(format!(
                "illegal transition {} -> {}",
                stage, next
            )));
        }

        match stage {
            Stage::Analyzing => {
                let verdict = outcome
                    .details
                    .get("verdict")
                    .and_then(|v| v.as_str())
                    .unwrap_or("continue")
                    .to_string();

                if verdict == "halt" {
                    let halt_reason = outcome
                        .details
                        .get("halt_reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("analysis verdict: halt")
                        .to_string();
                    mission.halt_reason = Some(halt_reason.clone());
                    tracing::warn!(mission = %mission.mission_id, reason = %halt_reason,
                        "drift halt");
                } else if verdict == "regression" {
                    next = Stage::Building;
                }

                mission.record_history(
                    "analyzing verdict",
                    json!({"verdict": verdict, "summary": outcome.summary}),
                );
            }
            Stage::CycleEnd => {
                let details = &outcome.details;
                mission.cycles.push(CycleSummary {
                    cycle: mission.current_cycle,
                    summary: outcome.summary.clone(),
                    achievements: string_list(details.get("achievements")),
                    issues: string_list(details.get("issues")),
                    continuation_prompt: details
                        .get("continuation_prompt")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    files_created: string_list(details.get("files_created")),
                });

                let verdict_continue = self.last_analyzing_verdict(mission) == "continue";
                if mission.halt_reason.is_none()
                    && verdict_continue
                    && mission.cycles_remaining()
                {
                    next = Stage::Planning;
                    mission.current_cycle += 1;
                    mission.iteration = 0;
                } else {
                    next = Stage::Complete;
                    if mission.final_summary.is_none() && !outcome.summary.is_empty() {
                        mission.final_summary = Some(outcome.summary.clone());
                    }
                }
            }
            Stage::Testing if next == Stage::Building => {
                // A failed test round starts another build iteration
                mission.iteration += 1;
            }
            _ => {}
        }

        mission.record_history(
            &format!("stage transition {} -> {}", stage, next),
            json!({"success": outcome.success}),
        );
        mission.current_stage = next;
        mission.last_updated = now_iso();
        self.save_mission(mission)?;

        tracing::info!(mission = %mission.mission_id, from = %stage, to = %next,
            "stage transition");
        Ok(())
    }

    fn last_analyzing_verdict(&self, mission: &MissionRecord) -> String {
        mission
            .history
            .iter()
            .rev()
            .find(|entry| entry.entry == "analyzing verdict")
            .and_then(|entry| entry.details.get("verdict"))
            .and_then(|v| v.as_str())
            .unwrap_or("continue")
            .to_string()
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Background queue-advancement watcher: polls for idle state and, when
/// the queue has a ready item, advances it into a new mission under the
/// processing lock. Contends with any foreground engine for that lock.
pub fn spawn_queue_watcher(
    mut engine: StageEngine,
    scheduler: QueueScheduler,
    lock: ProcessingLock,
    poll_interval: Duration,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("queue-advance-watcher".to_string())
        .spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                match engine.advance_from_queue(&scheduler, &lock) {
                    Ok(Some(mission)) => {
                        tracing::info!(mission = %mission.mission_id,
                            "watcher advanced queue into mission");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "queue watcher advancement failed");
                    }
                }
                std::thread::sleep(poll_interval);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_exec::testing::CannedInvoker;
    use tempfile::TempDir;

    fn engine_with(dir: &TempDir, response: &str) -> StageEngine {
        let paths = InstallPaths::new(dir.path());
        let mut options = EngineOptions::default();
        options.stage_timeout = Duration::from_secs(5);
        options.use_executor = false;
        StageEngine::new(
            paths,
            options,
            Arc::new(CannedInvoker::new(response)),
            IntegrationRegistry::new(),
        )
        .unwrap()
    }

    const HAPPY: &str = r#"{"status": "completed", "tests_passed": true,
        "verdict": "continue", "summary": "all good",
        "achievements": ["built it"], "issues": [],
        "continuation_prompt": "polish the edges in the next cycle"}"#;

    #[test]
    fn test_begin_mission_creates_workspace() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, HAPPY);
        let mission = engine.begin_mission("build the thing", 3).unwrap();

        assert_eq!(mission.current_stage, Stage::Planning);
        assert_eq!(mission.current_cycle, 1);
        let workspace = Path::new(&mission.mission_workspace);
        assert!(workspace.join("artifacts").is_dir());
        assert!(workspace.join("reports/analysis").is_dir());
        assert!(engine.current_mission().is_some());
    }

    #[test]
    fn test_begin_refuses_while_in_flight() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, HAPPY);
        engine.begin_mission("first", 3).unwrap();
        assert!(engine.begin_mission("second", 3).is_err());
    }

    #[test]
    fn test_full_single_cycle_reaches_complete() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, HAPPY);
        engine.begin_mission("one cycle mission", 1).unwrap();

        let final_stage = engine.run_to_completion(20).unwrap();
        assert_eq!(final_stage, Stage::Complete);

        let mission = engine.current_mission().unwrap();
        assert!(mission.is_complete());
        assert_eq!(mission.cycles.len(), 1);
        assert_eq!(mission.cycles[0].achievements, vec!["built it"]);
        assert!(mission.final_summary.is_some());
    }

    #[test]
    fn test_multi_cycle_rolls_back_to_planning() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, HAPPY);
        engine.begin_mission("two cycle mission", 2).unwrap();

        // PLANNING..CYCLE_END of cycle 1
        for _ in 0..5 {
            engine.advance().unwrap();
        }
        let mission = engine.current_mission().unwrap();
        assert_eq!(mission.current_stage, Stage::Planning);
        assert_eq!(mission.current_cycle, 2);

        let final_stage = engine.run_to_completion(20).unwrap();
        assert_eq!(final_stage, Stage::Complete);
        assert_eq!(engine.current_mission().unwrap().cycles.len(), 2);
    }

    #[test]
    fn test_failed_tests_loop_to_building() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            &dir,
            r#"{"status": "completed", "tests_passed": false, "summary": "red tests"}"#,
        );
        engine.begin_mission("flaky mission", 2).unwrap();

        engine.advance().unwrap(); // PLANNING -> BUILDING
        engine.advance().unwrap(); // BUILDING -> TESTING
        let outcome = engine.advance().unwrap(); // TESTING -> BUILDING
        assert_eq!(outcome.next_stage, Stage::Building);

        let mission = engine.current_mission().unwrap();
        assert_eq!(mission.current_stage, Stage::Building);
        assert_eq!(mission.iteration, 1);
    }

    #[test]
    fn test_halt_verdict_sets_halt_reason_and_completes() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(
            &dir,
            r#"{"status": "completed", "tests_passed": true,
               "verdict": "halt", "halt_reason": "scope drift detected",
               "summary": "mission drifted"}"#,
        );
        engine.begin_mission("drifting mission", 5).unwrap();

        let final_stage = engine.run_to_completion(20).unwrap();
        assert_eq!(final_stage, Stage::Complete);

        let mission = engine.current_mission().unwrap();
        assert_eq!(mission.halt_reason.as_deref(), Some("scope drift detected"));
    }

    #[test]
    fn test_timeout_keeps_stage_and_persists_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, "ERROR: Timeout after 5s");
        engine.begin_mission("slow mission", 3).unwrap();

        let outcome = engine.advance().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.next_stage, Stage::Planning);

        let mission = engine.current_mission().unwrap();
        assert_eq!(mission.current_stage, Stage::Planning);

        // The persisted checkpoint feeds recovery context on re-drive
        let found = sortie_store::recovery::detect_incomplete_mission(
            &engine.paths().checkpoints_dir(),
            &engine.paths().mission_path(),
        );
        assert!(found.is_some());
    }

    #[test]
    fn test_executor_stage_runs_work_units() {
        let dir = TempDir::new().unwrap();
        let paths = InstallPaths::new(dir.path());
        let mut options = EngineOptions::default();
        options.stage_timeout = Duration::from_secs(10);
        options.use_executor = true;
        options.max_agents = 2;
        let mut engine = StageEngine::new(
            paths,
            options,
            Arc::new(CannedInvoker::new(HAPPY)),
            IntegrationRegistry::new(),
        )
        .unwrap();

        engine.begin_mission("parallel mission", 1).unwrap();
        engine.advance().unwrap(); // PLANNING
        let outcome = engine.advance().unwrap(); // BUILDING via executor
        assert_eq!(outcome.stage, Stage::Building);
        assert_eq!(outcome.next_stage, Stage::Testing);
        assert!(outcome.details.get("total_agents").is_some());
    }

    #[test]
    fn test_advance_without_mission_errors() {
        let dir = TempDir::new().unwrap();
        let mut engine = engine_with(&dir, HAPPY);
        assert!(engine.advance().is_err());
    }
}
