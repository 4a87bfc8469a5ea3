//! End-to-end lifecycle scenarios wiring the engine to the queue, the
//! analytics store, the knowledge base and the suggestion store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use sortie_analytics::AnalyticsStore;
use sortie_engine::config::InstallPaths;
use sortie_engine::engine::{EngineOptions, StageEngine};
use sortie_engine::integrations::{
    AnalyticsIntegration, KnowledgeIntegration, PlanBackupIntegration, ReportIntegration,
    SnapshotIntegration,
};
use sortie_engine::IntegrationRegistry;
use sortie_exec::testing::CannedInvoker;
use sortie_kb::{KnowledgeBase, SuggestionStore};
use sortie_queue::{ProcessingLock, QueueScheduler};
use sortie_store::SnapshotManager;
use sortie_types::{Priority, QueueItem, Stage, SuggestionSource};

const HAPPY_RESPONSE: &str = r#"{"status": "completed", "tests_passed": true,
    "verdict": "continue",
    "summary": "implemented the caching layer with sqlite-backed invalidation",
    "achievements": ["cache layer built"], "issues": [],
    "continuation_prompt": "extend cache invalidation to cover bulk writes next"}"#;

struct Harness {
    paths: InstallPaths,
    analytics: Arc<Mutex<AnalyticsStore>>,
    kb: Arc<KnowledgeBase>,
    suggestions: Arc<Mutex<SuggestionStore>>,
    engine: StageEngine,
}

fn harness(dir: &TempDir, response: &str) -> Harness {
    let paths = InstallPaths::new(dir.path());
    paths.ensure_directories().unwrap();

    let analytics =
        Arc::new(Mutex::new(AnalyticsStore::open(&paths.analytics_db()).unwrap()));
    let kb = Arc::new(KnowledgeBase::open(&paths.knowledge_db(), None).unwrap());
    let suggestions =
        Arc::new(Mutex::new(SuggestionStore::open(&paths.suggestions_db()).unwrap()));
    let snapshots =
        Arc::new(SnapshotManager::new(&paths.snapshots_dir(), &paths.mission_path()).unwrap());

    let mut registry = IntegrationRegistry::new();
    registry.register(Box::new(AnalyticsIntegration::new(Arc::clone(&analytics))));
    registry.register(Box::new(SnapshotIntegration::new(snapshots)));
    registry.register(Box::new(KnowledgeIntegration::new(Arc::clone(&kb))));
    registry.register(Box::new(PlanBackupIntegration::new(&paths.backups_dir())));
    registry.register(Box::new(ReportIntegration::new(
        &paths.mission_logs_dir(),
        Some(Arc::clone(&suggestions)),
        Some(Arc::clone(&kb)),
    )));

    let options = EngineOptions {
        stage_timeout: Duration::from_secs(10),
        use_executor: false,
        ..EngineOptions::default()
    };

    let engine = StageEngine::new(
        paths.clone(),
        options,
        Arc::new(CannedInvoker::new(response)),
        registry,
    )
    .unwrap();

    Harness { paths, analytics, kb, suggestions, engine }
}

fn scheduler(paths: &InstallPaths) -> QueueScheduler {
    QueueScheduler::new(&paths.queue_path(), &paths.mission_path(), &paths.mission_logs_dir())
}

#[test]
fn queue_advances_on_idle() {
    let dir = TempDir::new().unwrap();
    let mut h = harness(&dir, HAPPY_RESPONSE);
    let scheduler = scheduler(&h.paths);
    let lock = ProcessingLock::new(&h.paths.processing_lock_path());

    let mut item = QueueItem::new("Cache layer", "Build a cache layer", 2);
    item.priority = Priority::Normal;
    scheduler.add(item).unwrap();

    let mission = h.engine.advance_from_queue(&scheduler, &lock).unwrap().unwrap();
    assert!(!mission.mission_id.is_empty());
    assert_eq!(mission.current_stage, Stage::Planning);
    assert_eq!(mission.current_cycle, 1);

    // The item left the queue, and the lock was released by the guard
    assert!(scheduler.state().queue.is_empty());
    assert!(!lock.is_locked());

    // No suggestion row exists until the mission completes
    assert_eq!(h.suggestions.lock().unwrap().count().unwrap(), 0);

    // With a mission in flight, nothing further advances
    scheduler.add(QueueItem::new("Second", "desc", 1)).unwrap();
    assert!(h.engine.advance_from_queue(&scheduler, &lock).unwrap().is_none());
}

#[test]
fn dependency_gating_follows_mission_logs() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, HAPPY_RESPONSE);
    let scheduler = scheduler(&h.paths);

    let mut gated = QueueItem::new("B", "depends on earlier work", 3);
    gated.depends_on = Some("mission_m123".to_string());
    scheduler.add(gated).unwrap();

    // No log for M123 yet
    assert!(scheduler.next_ready().is_none());

    std::fs::write(
        h.paths.mission_logs_dir().join("mission_m123_report.json"),
        serde_json::to_vec(&serde_json::json!({"final_stage": "COMPLETE"})).unwrap(),
    )
    .unwrap();

    let ready = scheduler.next_ready().unwrap();
    assert_eq!(ready.mission_title, "B");
}

#[test]
fn completed_mission_feeds_report_suggestions_kb_and_analytics() {
    let dir = TempDir::new().unwrap();
    let mut h = harness(&dir, HAPPY_RESPONSE);

    h.engine
        .begin_mission("Build a sqlite cache layer with invalidation", 1)
        .unwrap();
    let final_stage = h.engine.run_to_completion(20).unwrap();
    assert_eq!(final_stage, Stage::Complete);

    let mission = h.engine.current_mission().unwrap();

    // Mission log written by the report integration
    let logs: Vec<_> = std::fs::read_dir(h.paths.mission_logs_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name().to_string_lossy().starts_with(&mission.mission_id)
        })
        .collect();
    assert_eq!(logs.len(), 1);

    // A successful-completion suggestion row was saved
    let suggestions = h.suggestions.lock().unwrap().get_all().unwrap();
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].source_type, SuggestionSource::SuccessfulCompletion);
    assert_eq!(
        suggestions[0].source_mission_id.as_deref(),
        Some(mission.mission_id.as_str())
    );

    // The knowledge base ingested the report
    let stats = h.kb.statistics().unwrap();
    assert!(stats.total_learnings > 0);
    assert_eq!(stats.total_missions, 1);

    // Analytics closed the mission with stage rows behind it
    let totals = h
        .analytics
        .lock()
        .unwrap()
        .mission_totals(&mission.mission_id)
        .unwrap()
        .unwrap();
    assert_eq!(totals.final_status, "complete");
    assert!(totals.stages_completed > 0);

    // And a later mission on the same topic gets planning context
    let context = h
        .kb
        .generate_planning_context("improve the sqlite cache invalidation")
        .unwrap();
    assert!(!context.is_empty());
}

#[test]
fn snapshots_accumulate_across_stages() {
    let dir = TempDir::new().unwrap();
    let mut h = harness(&dir, HAPPY_RESPONSE);

    h.engine.begin_mission("snapshot coverage", 1).unwrap();
    h.engine.advance().unwrap();
    h.engine.advance().unwrap();

    let manager =
        SnapshotManager::new(&h.paths.snapshots_dir(), &h.paths.mission_path()).unwrap();
    let snapshots = manager.list();
    assert!(snapshots.len() >= 2);
    // Every snapshot verifies
    for snapshot in &snapshots {
        assert!(manager.verify(&snapshot.snapshot_id).unwrap());
    }
}

#[test]
fn halted_mission_emits_drift_suggestion() {
    let dir = TempDir::new().unwrap();
    let mut h = harness(
        &dir,
        r#"{"status": "completed", "tests_passed": true,
           "verdict": "halt", "halt_reason": "mission drifted from its goal",
           "summary": "drift detected"}"#,
    );

    h.engine.begin_mission("drifty work", 5).unwrap();
    let final_stage = h.engine.run_to_completion(20).unwrap();
    assert_eq!(final_stage, Stage::Complete);

    let suggestions = h.suggestions.lock().unwrap().get_all().unwrap();
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].source_type, SuggestionSource::DriftHalt);
    assert!(suggestions[0].drift_context.is_some());

    let totals_status = h
        .analytics
        .lock()
        .unwrap()
        .mission_totals(&h.engine.current_mission().unwrap().mission_id)
        .unwrap()
        .unwrap()
        .final_status;
    assert_eq!(totals_status, "halted");
}
