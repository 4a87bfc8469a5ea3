// NOTE: Command Organization Rationale
//
// Namespaced subcommands (mission, queue, snapshot, kb, analytics) keep
// the surface discoverable as it grows; flat command lists get unwieldy
// past ~10 entries.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sortie")]
#[command(about = "Drive autonomous R&D missions through a staged workflow", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Installation root (default: $SORTIE_ROOT or the XDG data dir)
    #[arg(long, global = true)]
    pub root: Option<String>,

    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Initialize the installation root and default config")]
    Init,

    #[command(about = "Create and drive missions")]
    Mission {
        #[command(subcommand)]
        command: MissionCommand,
    },

    #[command(about = "Manage the mission queue")]
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    #[command(about = "Administer mission state snapshots")]
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    #[command(about = "Query and maintain the knowledge base")]
    Kb {
        #[command(subcommand)]
        command: KbCommand,
    },

    #[command(about = "Token and cost analytics")]
    Analytics {
        #[command(subcommand)]
        command: AnalyticsCommand,
    },
}

#[derive(Subcommand)]
pub enum MissionCommand {
    #[command(about = "Start a new mission")]
    New {
        title: String,
        #[arg(long, short, default_value = "")]
        description: String,
        #[arg(long, default_value = "3")]
        cycles: u32,
    },
    #[command(about = "Show the current mission state")]
    Status,
    #[command(about = "Run the current stage and transition")]
    Advance,
    #[command(about = "Drive the mission until COMPLETE or a stuck stage")]
    Run {
        #[arg(long, default_value = "50")]
        max_steps: usize,
    },
}

#[derive(Subcommand)]
pub enum QueueCommand {
    #[command(about = "Add a mission to the queue")]
    Add {
        title: String,
        #[arg(long, short, default_value = "")]
        description: String,
        #[arg(long, default_value = "3")]
        cycles: u32,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long, help = "ISO timestamp before which the item must not start")]
        scheduled_start: Option<String>,
        #[arg(long, help = "Mission id that must complete first")]
        depends_on: Option<String>,
    },
    #[command(about = "List queued items in order")]
    List,
    #[command(about = "Show the next ready item without removing it")]
    Next,
    #[command(about = "Remove a queue item")]
    Remove { id: String },
    #[command(about = "Pause queue advancement")]
    Pause {
        #[arg(long)]
        reason: Option<String>,
    },
    #[command(about = "Resume queue advancement")]
    Resume,
    #[command(about = "Advance the queue into a new mission if one is ready")]
    Advance,
    #[command(about = "Show queue statistics")]
    Stats,
    #[command(about = "Projected start/end timeline")]
    Timeline,
    #[command(about = "Suggest dependency orderings between queued items")]
    Suggest,
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    #[command(about = "Snapshot the current mission state")]
    Create,
    #[command(about = "List snapshots, newest first")]
    List,
    #[command(about = "Verify a snapshot's SHA-256 integrity")]
    Verify { id: String },
    #[command(about = "Restore mission state from a snapshot")]
    Restore { id: String },
    #[command(about = "Snapshot subsystem status")]
    Status,
}

#[derive(Subcommand)]
pub enum KbCommand {
    #[command(about = "Ingest a completed mission report")]
    Ingest { report: String },
    #[command(about = "Ingest an investigation workspace")]
    IngestInvestigation { dir: String },
    #[command(about = "Query relevant learnings")]
    Query {
        text: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
    },
    #[command(about = "Render the planning context block for a problem statement")]
    Context { text: String },
    #[command(about = "Knowledge base statistics")]
    Stats,
}

#[derive(Subcommand)]
pub enum AnalyticsCommand {
    #[command(about = "Totals for one mission or the most recent missions")]
    Summary {
        #[arg(help = "Mission id (omit for recent missions)")]
        mission_id: Option<String>,
    },
}
