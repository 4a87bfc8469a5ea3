//! Command handlers. Human-readable output goes to stdout; anything that
//! fails bubbles an error and the process exits 2.

use anyhow::{bail, Result};
use owo_colors::OwoColorize;

use sortie_kb::SuggestionFilter;
use sortie_types::{Priority, QueueItem};

use crate::args::{
    AnalyticsCommand, KbCommand, MissionCommand, QueueCommand, SnapshotCommand,
};
use crate::context::CliContext;

pub fn init(context: &CliContext) -> Result<()> {
    context.config.save(context.paths.root())?;
    println!(
        "Initialized sortie installation at {}",
        context.paths.root().display().green()
    );
    println!("  provider: {}", context.config.provider);
    println!("  dashboard port: {}", context.config.dashboard_port);
    Ok(())
}

pub fn mission(context: &CliContext, command: MissionCommand) -> Result<()> {
    match command {
        MissionCommand::New { title, description, cycles } => {
            let mut engine = context.engine()?;
            let statement = if description.is_empty() {
                title
            } else {
                format!("{}\n\n{}", title, description)
            };
            let mission = engine.begin_mission(&statement, cycles)?;
            println!("Created mission {}", mission.mission_id.green());
            println!("  workspace: {}", mission.mission_workspace);
            println!("  cycle budget: {}", mission.cycle_budget);
        }
        MissionCommand::Status => {
            let engine = context.engine()?;
            match engine.current_mission() {
                Some(mission) => {
                    println!("Mission {}", mission.mission_id.bold());
                    println!("  stage: {}", mission.current_stage.to_string().cyan());
                    println!(
                        "  cycle: {} of {} (iteration {})",
                        mission.current_cycle, mission.cycle_budget, mission.iteration
                    );
                    println!("  updated: {}", mission.last_updated);
                    if let Some(halt) = &mission.halt_reason {
                        println!("  halt reason: {}", halt.red());
                    }
                }
                None => println!("No mission in flight"),
            }
        }
        MissionCommand::Advance => {
            let mut engine = context.engine()?;
            let outcome = engine.advance()?;
            println!(
                "{} -> {} ({})",
                outcome.stage,
                outcome.next_stage.to_string().cyan(),
                if outcome.success { "ok".green().to_string() } else { "failed".red().to_string() }
            );
        }
        MissionCommand::Run { max_steps } => {
            let mut engine = context.engine()?;
            let final_stage = engine.run_to_completion(max_steps)?;
            println!("Mission stopped at {}", final_stage.to_string().cyan());
        }
    }
    Ok(())
}

pub fn queue(context: &CliContext, command: QueueCommand) -> Result<()> {
    let scheduler = context.scheduler();

    match command {
        QueueCommand::Add { title, description, cycles, priority, scheduled_start, depends_on } => {
            let mut item = QueueItem::new(&title, &description, cycles);
            item.priority = Priority::parse_lenient(&priority);
            item.scheduled_start = scheduled_start;
            item.depends_on = depends_on;
            let (stored, position) = scheduler.add(item)?;
            println!("Queued {} at position {}", stored.id.green(), position);
            if let Some(minutes) = stored.estimated_minutes {
                println!("  estimated: {} minutes", minutes);
            }
        }
        QueueCommand::List => {
            let state = scheduler.state();
            if state.queue.is_empty() {
                println!("Queue is empty");
            }
            for (i, item) in state.queue.iter().enumerate() {
                println!(
                    "{:>3}. [{}] {} ({} cycles){}",
                    i + 1,
                    format!("{:?}", item.priority).to_lowercase(),
                    item.mission_title,
                    item.cycle_budget,
                    item.depends_on
                        .as_deref()
                        .map(|d| format!("  depends on {}", d))
                        .unwrap_or_default(),
                );
            }
            if state.paused {
                println!(
                    "{} {}",
                    "paused:".yellow(),
                    state.pause_reason.as_deref().unwrap_or("")
                );
            }
        }
        QueueCommand::Next => match scheduler.next_ready() {
            Some(item) => println!("Next ready: {} ({})", item.mission_title, item.id),
            None => println!("Nothing ready"),
        },
        QueueCommand::Remove { id } => {
            if scheduler.remove(&id)? {
                println!("Removed {}", id);
            } else {
                bail!("no queue item with id {}", id);
            }
        }
        QueueCommand::Pause { reason } => {
            scheduler.pause(reason.as_deref())?;
            println!("Queue paused");
        }
        QueueCommand::Resume => {
            scheduler.resume()?;
            println!("Queue resumed");
        }
        QueueCommand::Advance => {
            let mut engine = context.engine()?;
            let lock = context.processing_lock();
            match engine.advance_from_queue(&scheduler, &lock)? {
                Some(mission) => println!("Started mission {}", mission.mission_id.green()),
                None => println!("Nothing advanced (busy, locked, or nothing ready)"),
            }
        }
        QueueCommand::Stats => {
            let stats = scheduler.statistics();
            println!("Queue: {} items (enabled: {})", stats.total_items, stats.enabled);
            println!(
                "  ready {}  waiting {}  blocked {}",
                stats.ready.to_string().green(),
                stats.waiting,
                stats.blocked.to_string().red()
            );
            println!(
                "  estimated: {} minutes ({} hours)",
                stats.total_estimated_minutes, stats.total_estimated_hours
            );
        }
        QueueCommand::Timeline => {
            for entry in scheduler.timeline() {
                println!(
                    "{}  {} .. {}  [{}]{}",
                    entry.mission_title,
                    entry.estimated_start,
                    entry.estimated_end,
                    if entry.is_ready { "ready".green().to_string() } else { "waiting".to_string() },
                    entry
                        .dependency_status
                        .map(|s| format!("  dep: {:?}", s))
                        .unwrap_or_default(),
                );
            }
        }
        QueueCommand::Suggest => {
            let suggestions = scheduler.suggest_dependencies();
            if suggestions.is_empty() {
                println!("No dependency suggestions");
            }
            for suggestion in suggestions {
                println!(
                    "{} -> {}  (confidence {:.2}, {})",
                    suggestion.mission_a_title,
                    suggestion.mission_b_title,
                    suggestion.confidence,
                    suggestion.reason
                );
            }
        }
    }
    Ok(())
}

pub fn snapshot(context: &CliContext, command: SnapshotCommand) -> Result<()> {
    let manager = context.snapshot_manager()?;

    match command {
        SnapshotCommand::Create => match manager.create(Some("manual"), serde_json::Value::Null)? {
            Some(metadata) => {
                println!("Created {}", metadata.snapshot_id.green());
                println!("  sha256: {}", metadata.sha256_hash);
            }
            None => bail!("no mission state to snapshot"),
        },
        SnapshotCommand::List => {
            let snapshots = manager.list();
            if snapshots.is_empty() {
                println!("No snapshots");
            }
            for snapshot in snapshots {
                println!(
                    "{}  {}  {}  {}",
                    snapshot.snapshot_id,
                    snapshot.timestamp,
                    snapshot.stage,
                    &snapshot.sha256_hash[..8]
                );
            }
        }
        SnapshotCommand::Verify { id } => {
            if manager.verify(&id)? {
                println!("{} {}", "VALID".green(), id);
            } else {
                bail!("snapshot {} failed integrity verification", id);
            }
        }
        SnapshotCommand::Restore { id } => {
            manager.restore(&id, true)?;
            println!("Restored mission state from {}", id.green());
        }
        SnapshotCommand::Status => {
            let snapshots = manager.list();
            println!("{} snapshots", snapshots.len());
            if let Some(latest) = snapshots.first() {
                println!("  latest: {} ({})", latest.snapshot_id, latest.timestamp);
            }
        }
    }
    Ok(())
}

pub fn kb(context: &CliContext, command: KbCommand) -> Result<()> {
    let kb = context.knowledge_base()?;

    match command {
        KbCommand::Ingest { report } => {
            let result = kb.ingest_completed_mission(std::path::Path::new(&report))?;
            println!(
                "Ingested {}: {} learnings",
                result.source_id.green(),
                result.learnings_extracted
            );
        }
        KbCommand::IngestInvestigation { dir } => {
            let result = kb.ingest_investigation(std::path::Path::new(&dir))?;
            println!(
                "Ingested investigation {}: {} learnings",
                result.source_id.green(),
                result.learnings_extracted
            );
        }
        KbCommand::Query { text, top_k } => {
            let results = kb.query_relevant_learnings(&text, top_k, None, None)?;
            if results.is_empty() {
                println!("No relevant learnings");
            }
            for scored in results {
                println!(
                    "{:.3}  [{}]  {}",
                    scored.confidence_score,
                    scored.learning.learning_type.as_str(),
                    scored.learning.title
                );
                println!("       {}", scored.learning.description);
            }
        }
        KbCommand::Context { text } => {
            let block = kb.generate_planning_context(&text)?;
            if block.is_empty() {
                println!("(no relevant context)");
            } else {
                println!("{}", block);
            }
        }
        KbCommand::Stats => {
            let stats = kb.statistics()?;
            println!(
                "{} learnings across {} missions ({} from investigations)",
                stats.total_learnings, stats.total_missions, stats.investigation_learnings
            );
            for (learning_type, count) in &stats.by_type {
                println!("  {}: {}", learning_type, count);
            }

            // Suggestion store lives next door; show its row count too
            let suggestions = context.suggestions()?;
            let pending = suggestions
                .lock()
                .unwrap()
                .get_filtered(&SuggestionFilter { limit: Some(5), ..Default::default() })?;
            println!("{} top suggestions:", pending.len());
            for suggestion in pending {
                println!(
                    "  {:>5.1}  {}",
                    suggestion.priority_score, suggestion.mission_title
                );
            }
        }
    }
    Ok(())
}

pub fn analytics(context: &CliContext, command: AnalyticsCommand) -> Result<()> {
    let store = context.analytics()?;
    let store = store.lock().unwrap();

    match command {
        AnalyticsCommand::Summary { mission_id: Some(mission_id) } => {
            match store.mission_totals(&mission_id)? {
                Some(totals) => {
                    println!("Mission {}", totals.mission_id.bold());
                    println!("  status: {}", totals.final_status);
                    println!(
                        "  tokens: {} in / {} out / {} cache-read / {} cache-write",
                        totals.total_input_tokens,
                        totals.total_output_tokens,
                        totals.total_cache_read_tokens,
                        totals.total_cache_write_tokens
                    );
                    println!("  cost: ${:.4}", totals.total_estimated_cost_usd);
                    println!("  duration: {:.0}s", totals.total_duration_seconds);
                    for row in store.stage_rows(&mission_id)? {
                        println!(
                            "    {:>10}  cycle {}  {:>8} tokens  ${:.4}",
                            row.stage, row.cycle, row.total_tokens, row.estimated_cost_usd
                        );
                    }
                }
                None => bail!("no analytics for mission {}", mission_id),
            }
        }
        AnalyticsCommand::Summary { mission_id: None } => {
            let recent = store.recent_missions(10)?;
            if recent.is_empty() {
                println!("No missions recorded");
            }
            for totals in recent {
                println!(
                    "{}  {:>10}  {:>10} tokens  ${:.4}",
                    totals.mission_id,
                    totals.final_status,
                    totals.total_tokens,
                    totals.total_estimated_cost_usd
                );
            }
        }
    }
    Ok(())
}
