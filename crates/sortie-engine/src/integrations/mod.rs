mod analytics;
mod knowledge;
mod plan_backup;
mod report;
mod snapshot;

pub use analytics::AnalyticsIntegration;
pub use knowledge::KnowledgeIntegration;
pub use plan_backup::PlanBackupIntegration;
pub use report::ReportIntegration;
pub use snapshot::SnapshotIntegration;
