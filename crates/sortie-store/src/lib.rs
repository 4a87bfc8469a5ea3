pub mod atomic;
pub mod checkpoints;
pub mod recovery;
pub mod snapshots;

pub use checkpoints::CheckpointStore;
pub use recovery::{RecoveryRecord, StageRecovery};
pub use snapshots::{SnapshotManager, StaleBackupMonitor};
