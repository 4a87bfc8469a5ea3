//! Shared construction of runtime objects for the handlers.

use std::sync::{Arc, Mutex};

use anyhow::Result;

use sortie_analytics::AnalyticsStore;
use sortie_engine::config::{resolve_root, InstallPaths, RuntimeConfig};
use sortie_engine::engine::EngineOptions;
use sortie_engine::integrations::{
    AnalyticsIntegration, KnowledgeIntegration, PlanBackupIntegration, ReportIntegration,
    SnapshotIntegration,
};
use sortie_engine::{IntegrationRegistry, StageEngine};
use sortie_kb::{KnowledgeBase, SuggestionStore};
use sortie_queue::{ProcessingLock, QueueScheduler};
use sortie_store::SnapshotManager;

use crate::llm::SubprocessInvoker;

pub struct CliContext {
    pub paths: InstallPaths,
    pub config: RuntimeConfig,
}

impl CliContext {
    pub fn resolve(explicit_root: Option<&str>) -> Result<Self> {
        let root = resolve_root(explicit_root)?;
        let config = RuntimeConfig::load(&root)?;
        let paths = InstallPaths::new(&root);
        paths.ensure_directories()?;
        Ok(CliContext { paths, config })
    }

    pub fn scheduler(&self) -> QueueScheduler {
        QueueScheduler::new(
            &self.paths.queue_path(),
            &self.paths.mission_path(),
            &self.paths.mission_logs_dir(),
        )
    }

    pub fn processing_lock(&self) -> ProcessingLock {
        ProcessingLock::new(&self.paths.processing_lock_path())
    }

    pub fn snapshot_manager(&self) -> Result<SnapshotManager> {
        SnapshotManager::new(&self.paths.snapshots_dir(), &self.paths.mission_path())
    }

    pub fn analytics(&self) -> Result<Arc<Mutex<AnalyticsStore>>> {
        Ok(Arc::new(Mutex::new(AnalyticsStore::open(&self.paths.analytics_db())?)))
    }

    pub fn knowledge_base(&self) -> Result<Arc<KnowledgeBase>> {
        Ok(Arc::new(KnowledgeBase::open(&self.paths.knowledge_db(), None)?))
    }

    pub fn suggestions(&self) -> Result<Arc<Mutex<SuggestionStore>>> {
        Ok(Arc::new(Mutex::new(SuggestionStore::open(&self.paths.suggestions_db())?)))
    }

    /// Full engine with every built-in integration registered in
    /// dependency order.
    pub fn engine(&self) -> Result<StageEngine> {
        let analytics = self.analytics()?;
        let kb = self.knowledge_base()?;
        let suggestions = self.suggestions()?;
        let snapshots = Arc::new(self.snapshot_manager()?);

        let mut registry = IntegrationRegistry::new();
        registry.register(Box::new(AnalyticsIntegration::new(Arc::clone(&analytics))));
        registry.register(Box::new(SnapshotIntegration::new(Arc::clone(&snapshots))));
        registry.register(Box::new(KnowledgeIntegration::new(Arc::clone(&kb))));
        registry.register(Box::new(PlanBackupIntegration::new(&self.paths.backups_dir())));
        registry.register(Box::new(ReportIntegration::new(
            &self.paths.mission_logs_dir(),
            Some(suggestions),
            Some(kb),
        )));

        let options = EngineOptions {
            max_agents: self.config.max_agents,
            max_subagents_per_agent: self.config.max_subagents_per_agent,
            stage_timeout: std::time::Duration::from_secs(self.config.stage_timeout_seconds),
            ..EngineOptions::default()
        };

        let invoker = Arc::new(SubprocessInvoker::new(&self.config.provider));
        Ok(StageEngine::new(self.paths.clone(), options, invoker, registry)?)
    }
}
