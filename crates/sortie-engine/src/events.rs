//! Integration handler dispatch.
//!
//! Analytics, knowledge base, snapshots, plan backup and the final
//! report all plug into the engine through one handler trait. Handlers
//! register with a priority and run in order; a handler failure is
//! logged and never stops the other handlers or the engine.

use serde_json::Value;

use sortie_types::{MissionRecord, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StageStarted,
    PromptGenerated,
    StageEnded,
    MissionCompleted,
}

#[derive(Debug, Clone)]
pub struct IntegrationEvent {
    pub kind: EventKind,
    pub mission: MissionRecord,
    pub stage: Stage,
    pub prompt: Option<String>,
    pub details: Value,
}

impl IntegrationEvent {
    pub fn new(kind: EventKind, mission: &MissionRecord, stage: Stage) -> Self {
        IntegrationEvent {
            kind,
            mission: mission.clone(),
            stage,
            prompt: None,
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.to_string());
        self
    }
}

/// One integration plugged into the engine's stage lifecycle.
///
/// `on_stage_started` may return a context block to inject into the
/// stage prompt (the knowledge base uses this on PLANNING).
pub trait IntegrationHandler: Send {
    fn name(&self) -> &str;

    /// Lower runs earlier.
    fn priority(&self) -> i32 {
        100
    }

    fn on_stage_started(&mut self, _event: &IntegrationEvent) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn on_prompt_generated(&mut self, _event: &IntegrationEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stage_ended(&mut self, _event: &IntegrationEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_mission_completed(&mut self, _event: &IntegrationEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct IntegrationRegistry {
    handlers: Vec<Box<dyn IntegrationHandler>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        IntegrationRegistry { handlers: Vec::new() }
    }

    /// Register a handler; the list stays sorted by priority so
    /// dependency order holds during dispatch.
    pub fn register(&mut self, handler: Box<dyn IntegrationHandler>) {
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| h.priority());
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.name().to_string()).collect()
    }

    /// Dispatch STAGE_STARTED and collect the context blocks handlers
    /// want injected into the prompt, in priority order.
    pub fn dispatch_stage_started(&mut self, event: &IntegrationEvent) -> Vec<String> {
        let mut contexts = Vec::new();
        for handler in &mut self.handlers {
            match handler.on_stage_started(event) {
                Ok(Some(context)) if !context.is_empty() => contexts.push(context),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(handler = handler.name(), error = %e,
                        "stage-started handler failed");
                }
            }
        }
        contexts
    }

    pub fn dispatch_prompt_generated(&mut self, event: &IntegrationEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.on_prompt_generated(event) {
                tracing::warn!(handler = handler.name(), error = %e,
                    "prompt-generated handler failed");
            }
        }
    }

    pub fn dispatch_stage_ended(&mut self, event: &IntegrationEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.on_stage_ended(event) {
                tracing::warn!(handler = handler.name(), error = %e,
                    "stage-ended handler failed");
            }
        }
    }

    pub fn dispatch_mission_completed(&mut self, event: &IntegrationEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.on_mission_completed(event) {
                tracing::warn!(handler = handler.name(), error = %e,
                    "mission-completed handler failed");
            }
        }
    }
}
