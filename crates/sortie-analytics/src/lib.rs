pub mod pricing;
pub mod store;
pub mod watcher;

pub use store::{AnalyticsStore, MissionTotals, StageRow};
pub use watcher::{transcript_dir_for_workspace, TranscriptWatcher, WatcherStats};
