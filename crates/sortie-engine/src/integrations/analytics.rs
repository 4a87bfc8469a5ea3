//! Feeds stage boundaries into the analytics store.

use std::sync::{Arc, Mutex};

use sortie_analytics::AnalyticsStore;

use crate::events::{IntegrationEvent, IntegrationHandler};

pub struct AnalyticsIntegration {
    store: Arc<Mutex<AnalyticsStore>>,
}

impl AnalyticsIntegration {
    pub fn new(store: Arc<Mutex<AnalyticsStore>>) -> Self {
        AnalyticsIntegration { store }
    }
}

impl IntegrationHandler for AnalyticsIntegration {
    fn name(&self) -> &str {
        "analytics"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn on_stage_started(&mut self, event: &IntegrationEvent) -> anyhow::Result<Option<String>> {
        let store = self.store.lock().unwrap();
        if store.mission_totals(&event.mission.mission_id)?.is_none() {
            store.start_mission(&event.mission.mission_id, &event.mission.problem_statement)?;
        }
        store.start_stage(
            &event.mission.mission_id,
            event.stage.as_str(),
            event.mission.iteration,
            event.mission.current_cycle,
        )?;
        Ok(None)
    }

    fn on_stage_ended(&mut self, event: &IntegrationEvent) -> anyhow::Result<()> {
        self.store.lock().unwrap().end_stage(
            &event.mission.mission_id,
            event.stage.as_str(),
            event.mission.iteration,
            event.mission.current_cycle,
        )?;
        Ok(())
    }

    fn on_mission_completed(&mut self, event: &IntegrationEvent) -> anyhow::Result<()> {
        let status = if event.mission.halt_reason.is_some() { "halted" } else { "complete" };
        self.store.lock().unwrap().end_mission(&event.mission.mission_id, status)?;
        Ok(())
    }
}
