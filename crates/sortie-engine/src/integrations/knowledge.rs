//! Injects knowledge-base context into PLANNING prompts.

use std::sync::Arc;

use sortie_kb::KnowledgeBase;
use sortie_types::Stage;

use crate::events::{IntegrationEvent, IntegrationHandler};

pub struct KnowledgeIntegration {
    kb: Arc<KnowledgeBase>,
}

impl KnowledgeIntegration {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        KnowledgeIntegration { kb }
    }
}

impl IntegrationHandler for KnowledgeIntegration {
    fn name(&self) -> &str {
        "knowledge_base"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn on_stage_started(&mut self, event: &IntegrationEvent) -> anyhow::Result<Option<String>> {
        if event.stage != Stage::Planning {
            return Ok(None);
        }
        let context = self.kb.generate_planning_context(&event.mission.problem_statement)?;
        Ok(if context.is_empty() { None } else { Some(context) })
    }
}
