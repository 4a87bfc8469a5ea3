pub mod deps;
pub mod estimate;
pub mod lock;
pub mod scheduler;

pub use deps::DependencySuggestion;
pub use lock::{LockGuard, ProcessingLock};
pub use scheduler::{QueueScheduler, QueueStatistics, TimelineEntry};
