mod checkpoint;
mod learning;
mod mission;
mod queue;
mod snapshot;
mod suggestion;
mod tokens;
mod util;
mod work;

pub use checkpoint::{AgentCheckpoint, CheckpointStatus};
pub use learning::{Learning, LearningSourceType, LearningType, MissionDigest, Outcome};
pub use mission::{CycleSummary, HistoryEntry, MissionRecord, Stage};
pub use queue::{DependencyStatus, LockRecord, Priority, QueueItem, QueueState, StartCondition};
pub use snapshot::{SnapshotFile, SnapshotMetadata};
pub use suggestion::{HealthStatus, Suggestion, SuggestionSource};
pub use tokens::{TokenEvent, TokenUsage, TranscriptMessage, TranscriptRecord, TranscriptUsage};
pub use util::*;
pub use work::{SplitStrategy, WorkUnit};
