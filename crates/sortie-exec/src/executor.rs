//! Two-level parallel agent execution.
//!
//! Work units fan out across up to `max_agents` worker threads. Each
//! worker invokes the LLM with its unit prompt plus a sub-agent spawning
//! protocol appendix; a worker's JSON result may request up to
//! `max_subagents_per_agent` sub-agent invocations, which run under a
//! child timeout budget in an isolated checkpoint namespace. Parent and
//! children synchronize only through checkpoint files.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sortie_store::CheckpointStore;
use sortie_types::{now_iso, CheckpointStatus, WorkUnit};

use crate::aggregator::{self, MergedResult};
use crate::budget::{TimeoutBudget, TimeoutPolicy};
use crate::invoker::{classify_response, parse_response, LlmInvoker, ResponseKind};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub mission_id: String,
    pub description: String,
    pub total_timeout: Duration,
    pub max_agents: usize,
    pub max_subagents_per_agent: usize,
    pub worker_model: String,
    pub subagent_model: String,
    pub reserve_ratio: f64,
    pub min_child_timeout: Duration,
    pub poll_interval: Duration,
}

impl ExecutorConfig {
    pub fn new(mission_id: &str) -> Self {
        ExecutorConfig {
            mission_id: mission_id.to_string(),
            description: String::new(),
            total_timeout: Duration::from_secs(3600),
            max_agents: 5,
            max_subagents_per_agent: 10,
            worker_model: "sonnet".to_string(),
            subagent_model: "haiku".to_string(),
            reserve_ratio: TimeoutBudget::DEFAULT_RESERVE_RATIO,
            min_child_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Worker,
    Subagent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
    Timeout,
}

impl From<ResponseKind> for AgentStatus {
    fn from(kind: ResponseKind) -> Self {
        match kind {
            ResponseKind::Completed => AgentStatus::Completed,
            ResponseKind::Failed => AgentStatus::Failed,
            ResponseKind::Timeout => AgentStatus::Timeout,
        }
    }
}

/// Outcome of one agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub response: String,
    #[serde(default)]
    pub parsed_result: Option<Value>,
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub subagent_results: Vec<AgentResult>,
}

/// Complete results of one executor run
#[derive(Debug, Clone, Serialize)]
pub struct HierarchicalResults {
    pub mission_id: String,
    pub work_units: Vec<WorkUnit>,
    pub agent_results: Vec<AgentResult>,
    pub merged: MergedResult,
    pub started_at: String,
    pub completed_at: String,
    pub total_elapsed_seconds: f64,
}

impl HierarchicalResults {
    /// Save the run report as JSON, named `<mission>_<ts>.json`.
    pub fn save(&self, results_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(results_dir)
            .with_context(|| format!("creating {}", results_dir.display()))?;
        let stamp = self.completed_at.replace([':', '.'], "-");
        let path = results_dir.join(format!("{}_{}.json", self.mission_id, stamp));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing results to {}", path.display()))?;
        Ok(path)
    }
}

/// One parsed sub-agent request from a worker's JSON result
#[derive(Debug, Clone, Deserialize)]
struct SubagentRequest {
    id: String,
    prompt: String,
    #[serde(default = "default_parallel")]
    parallel: bool,
}

fn default_parallel() -> bool {
    true
}

pub struct HierarchicalExecutor {
    config: ExecutorConfig,
    checkpoints: Arc<CheckpointStore>,
    budget: Arc<Mutex<TimeoutBudget>>,
    invoker: Arc<dyn LlmInvoker>,
}

impl HierarchicalExecutor {
    pub fn new(
        config: ExecutorConfig,
        checkpoints_root: &Path,
        invoker: Arc<dyn LlmInvoker>,
    ) -> Result<Self> {
        let checkpoints =
            Arc::new(CheckpointStore::new(checkpoints_root, &config.mission_id)?);
        // Workers run concurrently: each gets the full usable timeout
        let budget = TimeoutBudget::new(config.total_timeout, TimeoutPolicy::Parallel)
            .with_reserve_ratio(config.reserve_ratio)
            .with_min_child_timeout(config.min_child_timeout.as_secs_f64());
        Ok(HierarchicalExecutor {
            config,
            checkpoints,
            budget: Arc::new(Mutex::new(budget)),
            invoker,
        })
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run all work units to completion or the global deadline.
    pub fn run(
        &self,
        work_units: Vec<WorkUnit>,
        mut progress: Option<&mut dyn FnMut(&str)>,
    ) -> Result<HierarchicalResults> {
        let started_at = now_iso();
        let start = Instant::now();
        let deadline = start + self.config.total_timeout;

        if let Some(cb) = progress.as_deref_mut() {
            cb(&format!(
                "starting executor: {} units, timeout {}s",
                work_units.len(),
                self.config.total_timeout.as_secs()
            ));
        }

        let unit_ids: Vec<String> = work_units.iter().map(|wu| wu.id.clone()).collect();
        {
            let mut budget = self.budget.lock().unwrap();
            budget.allocate_children(&unit_ids, None, None);
        }
        for id in &unit_ids {
            self.checkpoints.create(id, CheckpointStatus::Pending)?;
        }

        let queue: Arc<Mutex<VecDeque<WorkUnit>>> =
            Arc::new(Mutex::new(work_units.iter().cloned().collect()));
        let (tx, rx) = mpsc::channel::<AgentResult>();

        let worker_count = self.config.max_agents.min(work_units.len()).max(1);
        for n in 0..worker_count {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let worker = WorkerContext {
                config: self.config.clone(),
                checkpoints: Arc::clone(&self.checkpoints),
                budget: Arc::clone(&self.budget),
                invoker: Arc::clone(&self.invoker),
            };
            std::thread::Builder::new()
                .name(format!("sortie-worker-{}", n))
                .spawn(move || loop {
                    let unit = { queue.lock().unwrap().pop_front() };
                    let Some(unit) = unit else { break };
                    let result = worker.run_worker(&unit);
                    // Receiver may be gone after the global deadline
                    if tx.send(result).is_err() {
                        break;
                    }
                })
                .context("spawning executor worker thread")?;
        }
        drop(tx);

        let mut results: Vec<AgentResult> = Vec::new();
        while results.len() < work_units.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(result) => {
                    if let Some(cb) = progress.as_deref_mut() {
                        cb(&format!(
                            "agent {} finished: {:?}",
                            result.agent_id, result.status
                        ));
                    }
                    results.push(result);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Global deadline: force TIMEOUT on anything non-terminal and
        // synthesize results for unreported units. Late in-flight results
        // are dropped with the receiver.
        if results.len() < work_units.len() {
            for unit in &work_units {
                if results.iter().any(|r| r.agent_id == unit.id) {
                    continue;
                }
                if !self.checkpoints.is_complete(&unit.id) {
                    let _ = self.checkpoints.mark_timeout(&unit.id);
                }
                results.push(AgentResult {
                    agent_id: unit.id.clone(),
                    role: AgentRole::Worker,
                    status: AgentStatus::Timeout,
                    response: String::new(),
                    parsed_result: None,
                    elapsed_seconds: start.elapsed().as_secs_f64(),
                    files_created: Vec::new(),
                    files_modified: Vec::new(),
                    error: Some("global timeout".to_string()),
                    subagent_results: Vec::new(),
                });
            }
        }

        let merged = aggregator::merge(&self.config.mission_id, &results);
        let completed_at = now_iso();
        let total_elapsed = start.elapsed().as_secs_f64();

        if let Some(cb) = progress.as_deref_mut() {
            cb(&format!("executor complete in {:.1}s", total_elapsed));
        }

        Ok(HierarchicalResults {
            mission_id: self.config.mission_id.clone(),
            work_units,
            agent_results: results,
            merged,
            started_at,
            completed_at,
            total_elapsed_seconds: total_elapsed,
        })
    }
}

/// Everything a worker thread needs, cloned per thread
struct WorkerContext {
    config: ExecutorConfig,
    checkpoints: Arc<CheckpointStore>,
    budget: Arc<Mutex<TimeoutBudget>>,
    invoker: Arc<dyn LlmInvoker>,
}

impl WorkerContext {
    fn run_worker(&self, unit: &WorkUnit) -> AgentResult {
        let agent_id = &unit.id;
        let start = Instant::now();

        let _ = self
            .checkpoints
            .update(agent_id, |cp| cp.status = CheckpointStatus::InProgress);

        let timeout = {
            let mut budget = self.budget.lock().unwrap();
            budget.start_agent(agent_id);
            budget.invocation_timeout(agent_id)
        };

        let prompt = format!("{}{}", unit.prompt, self.subagent_protocol());
        let response = self.invoker.invoke(&prompt, &self.config.worker_model, timeout);
        let elapsed = start.elapsed().as_secs_f64();

        {
            let mut budget = self.budget.lock().unwrap();
            budget.complete_agent(agent_id);
        }

        let status: AgentStatus = classify_response(&response.text).into();
        let parsed = parse_response(&response.text);

        let (files_created, files_modified) = extract_files(&parsed);

        let subagent_results = if status == AgentStatus::Completed {
            self.run_subagents(agent_id, &parsed)
        } else {
            Vec::new()
        };

        match status {
            AgentStatus::Completed => {
                let _ = self.checkpoints.mark_completed(
                    agent_id,
                    json!({
                        "status": "completed",
                        "summary": parsed
                            .as_ref()
                            .and_then(|p| p.get("summary"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        "files_created": files_created,
                        "files_modified": files_modified,
                        "response": truncate(&response.text, 500),
                        "elapsed": elapsed,
                    }),
                );
            }
            AgentStatus::Failed => {
                let _ = self.checkpoints.mark_failed(agent_id, &response.text);
            }
            AgentStatus::Timeout => {
                let _ = self.checkpoints.mark_timeout(agent_id);
            }
        }

        AgentResult {
            agent_id: agent_id.clone(),
            role: AgentRole::Worker,
            status,
            error: match status {
                AgentStatus::Completed => None,
                _ => Some(truncate(&response.text, 200)),
            },
            response: response.text,
            parsed_result: parsed,
            elapsed_seconds: elapsed,
            files_created,
            files_modified,
            subagent_results,
        }
    }

    /// Honor a worker's `subagent_requests`, capped at the configured
    /// maximum, under a child budget derived from the parent's remaining
    /// time. Requests run in parallel unless one opts into sequential.
    fn run_subagents(&self, parent_id: &str, parsed: &Option<Value>) -> Vec<AgentResult> {
        let requests: Vec<SubagentRequest> = parsed
            .as_ref()
            .and_then(|p| p.get("subagent_requests"))
            .and_then(|v| serde_json::from_value::<Vec<SubagentRequest>>(v.clone()).ok())
            .unwrap_or_default();

        if requests.is_empty() {
            return Vec::new();
        }

        let requests: Vec<SubagentRequest> = requests
            .into_iter()
            .take(self.config.max_subagents_per_agent)
            .collect();

        let Ok(sub_store) = self.checkpoints.subagent_namespace(parent_id) else {
            return Vec::new();
        };
        let sub_store = Arc::new(sub_store);

        let mut child_budget = match self.budget.lock().unwrap().create_child_budget(parent_id)
        {
            Ok(budget) => budget,
            Err(e) => {
                tracing::warn!(parent = parent_id, error = %e, "no child budget");
                return Vec::new();
            }
        };

        let sub_ids: Vec<String> =
            requests.iter().map(|r| format!("{}_{}", parent_id, r.id)).collect();
        child_budget.allocate_children(&sub_ids, None, None);
        let timeouts: Vec<Duration> =
            sub_ids.iter().map(|id| child_budget.invocation_timeout(id)).collect();

        let run_sequential = requests.iter().any(|r| !r.parallel);

        if run_sequential {
            let mut results = Vec::new();
            for (i, request) in requests.iter().enumerate() {
                results.push(self.run_one_subagent(
                    &sub_store,
                    &sub_ids[i],
                    &request.prompt,
                    timeouts[i],
                ));
            }
            results
        } else {
            let mut handles = Vec::new();
            for (i, request) in requests.iter().enumerate() {
                let store = Arc::clone(&sub_store);
                let invoker = Arc::clone(&self.invoker);
                let model = self.config.subagent_model.clone();
                let sub_id = sub_ids[i].clone();
                let prompt = request.prompt.clone();
                let timeout = timeouts[i];
                handles.push(std::thread::spawn(move || {
                    run_subagent_invocation(&store, &invoker, &model, &sub_id, &prompt, timeout)
                }));
            }
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .collect()
        }
    }

    fn run_one_subagent(
        &self,
        store: &Arc<CheckpointStore>,
        sub_id: &str,
        prompt: &str,
        timeout: Duration,
    ) -> AgentResult {
        run_subagent_invocation(
            store,
            &self.invoker,
            &self.config.subagent_model,
            sub_id,
            prompt,
            timeout,
        )
    }

    fn subagent_protocol(&self) -> String {
        format!(
            "\n\n# Sub-Agent Spawning Protocol\n\n\
             You may delegate independent sub-tasks to up to {max} sub-agents.\n\
             To do so, include a `subagent_requests` array in your JSON result:\n\n\
             ```json\n\
             {{\n  \"status\": \"completed\",\n  \"summary\": \"...\",\n  \"subagent_requests\": [\n    {{\"id\": \"sub_1\", \"prompt\": \"First sub-task...\"}},\n    {{\"id\": \"sub_2\", \"prompt\": \"Second sub-task...\", \"parallel\": false}}\n  ]\n}}\n\
             ```\n\n\
             Sub-agents run on the {model} model within your remaining time\n\
             budget, in parallel unless a request sets `parallel: false`.\n\n\
             Use sub-agents when the task splits into independent pieces.\n\
             Do NOT use them for sequential work or tasks sharing state.\n\n\
             # Checkpoint Signaling\n\n\
             Your final response must be valid JSON with at minimum:\n\
             - \"status\": \"completed\" or \"failed\"\n\
             - \"summary\": description of what was done\n",
            max = self.config.max_subagents_per_agent,
            model = self.config.subagent_model,
        )
    }
}

fn run_subagent_invocation(
    store: &CheckpointStore,
    invoker: &Arc<dyn LlmInvoker>,
    model: &str,
    sub_id: &str,
    prompt: &str,
    timeout: Duration,
) -> AgentResult {
    let start = Instant::now();
    let _ = store.create(sub_id, CheckpointStatus::InProgress);

    let response = invoker.invoke(prompt, model, timeout);
    let elapsed = start.elapsed().as_secs_f64();
    let status: AgentStatus = classify_response(&response.text).into();

    match status {
        AgentStatus::Completed => {
            let _ = store.mark_completed(
                sub_id,
                json!({"response": truncate(&response.text, 500), "elapsed": elapsed}),
            );
        }
        AgentStatus::Failed => {
            let _ = store.mark_failed(sub_id, &response.text);
        }
        AgentStatus::Timeout => {
            let _ = store.mark_timeout(sub_id);
        }
    }

    AgentResult {
        agent_id: sub_id.to_string(),
        role: AgentRole::Subagent,
        status,
        error: match status {
            AgentStatus::Completed => None,
            _ => Some(truncate(&response.text, 200)),
        },
        response: response.text,
        parsed_result: None,
        elapsed_seconds: elapsed,
        files_created: Vec::new(),
        files_modified: Vec::new(),
        subagent_results: Vec::new(),
    }
}

fn extract_files(parsed: &Option<Value>) -> (Vec<String>, Vec<String>) {
    let list = |key: &str| -> Vec<String> {
        parsed
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    (list("files_created"), list("files_modified"))
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CannedInvoker, NeverRespondsInvoker};
    use tempfile::TempDir;

    fn quick_config(mission_id: &str, timeout_ms: u64) -> ExecutorConfig {
        let mut config = ExecutorConfig::new(mission_id);
        config.total_timeout = Duration::from_millis(timeout_ms);
        config.min_child_timeout = Duration::from_millis(50);
        config.poll_interval = Duration::from_millis(10);
        config
    }

    fn units(n: usize) -> Vec<WorkUnit> {
        (0..n)
            .map(|i| WorkUnit::new(&format!("wu_{}", i), &format!("unit {}", i), "do it"))
            .collect()
    }

    #[test]
    fn test_all_workers_complete() {
        let dir = TempDir::new().unwrap();
        let invoker = Arc::new(CannedInvoker::new(
            r#"{"status": "completed", "summary": "done", "files_created": ["out.rs"]}"#,
        ));
        let executor =
            HierarchicalExecutor::new(quick_config("m_ok", 5000), dir.path(), invoker).unwrap();

        let results = executor.run(units(3), None).unwrap();
        assert_eq!(results.merged.completed_agents, 3);
        assert!(results.merged.success || results.merged.has_conflicts());
        for unit in &results.work_units {
            let cp = executor.checkpoints().read(&unit.id).unwrap();
            assert_eq!(cp.status, CheckpointStatus::Completed);
        }
    }

    #[test]
    fn test_shared_created_file_is_conflict() {
        let dir = TempDir::new().unwrap();
        // Every worker claims the same created file
        let invoker = Arc::new(CannedInvoker::new(
            r#"{"status": "completed", "summary": "done", "files_created": ["same.rs"]}"#,
        ));
        let executor =
            HierarchicalExecutor::new(quick_config("m_conflict", 5000), dir.path(), invoker)
                .unwrap();

        let results = executor.run(units(2), None).unwrap();
        assert!(!results.merged.success);
        assert!(results.merged.requires_human_review());
    }

    #[test]
    fn test_global_deadline_forces_timeout() {
        let dir = TempDir::new().unwrap();
        let invoker = Arc::new(NeverRespondsInvoker::new(Duration::from_secs(30)));
        let executor =
            HierarchicalExecutor::new(quick_config("m_slow", 300), dir.path(), invoker)
                .unwrap();

        let results = executor.run(units(3), None).unwrap();
        assert!(!results.merged.success);
        assert_eq!(results.merged.completed_agents, 0);
        assert_eq!(results.merged.failed_agents, 0);
        assert_eq!(results.merged.timeout_agents, 3);
        for unit in &results.work_units {
            let cp = executor.checkpoints().read(&unit.id).unwrap();
            assert_eq!(cp.status, CheckpointStatus::Timeout);
        }
    }

    #[test]
    fn test_failed_worker_does_not_abort_peers() {
        let dir = TempDir::new().unwrap();
        let invoker = Arc::new(crate::testing::SequenceInvoker::new(vec![
            "ERROR: worker exploded".to_string(),
            r#"{"status": "completed", "summary": "fine"}"#.to_string(),
        ]));
        let mut config = quick_config("m_mixed", 5000);
        config.max_agents = 1; // deterministic response ordering
        let executor = HierarchicalExecutor::new(config, dir.path(), invoker).unwrap();

        let results = executor.run(units(2), None).unwrap();
        assert_eq!(results.merged.completed_agents, 1);
        assert_eq!(results.merged.failed_agents, 1);
        assert!(!results.merged.success);
    }

    #[test]
    fn test_subagent_requests_are_honored() {
        let dir = TempDir::new().unwrap();
        let response = r#"{"status": "completed", "summary": "split up",
            "subagent_requests": [
                {"id": "s1", "prompt": "part one"},
                {"id": "s2", "prompt": "part two"}
            ]}"#;
        let invoker = Arc::new(CannedInvoker::new(response));
        let mut config = quick_config("m_subs", 5000);
        config.max_subagents_per_agent = 2;
        let executor = HierarchicalExecutor::new(config, dir.path(), invoker).unwrap();

        let results = executor.run(units(1), None).unwrap();
        let worker = &results.agent_results[0];
        assert_eq!(worker.subagent_results.len(), 2);
        assert!(worker
            .subagent_results
            .iter()
            .all(|s| s.role == AgentRole::Subagent && s.status == AgentStatus::Completed));

        // Sub-agent checkpoints live in the parent's namespace
        let sub_store = executor.checkpoints().subagent_namespace("wu_0").unwrap();
        assert_eq!(sub_store.list_agents().len(), 2);
    }

    #[test]
    fn test_subagent_cap_enforced() {
        let dir = TempDir::new().unwrap();
        let response = r#"{"status": "completed", "summary": "greedy",
            "subagent_requests": [
                {"id": "s1", "prompt": "a"},
                {"id": "s2", "prompt": "b"},
                {"id": "s3", "prompt": "c"}
            ]}"#;
        let invoker = Arc::new(CannedInvoker::new(response));
        let mut config = quick_config("m_cap", 5000);
        config.max_subagents_per_agent = 1;
        let executor = HierarchicalExecutor::new(config, dir.path(), invoker).unwrap();

        let results = executor.run(units(1), None).unwrap();
        assert_eq!(results.agent_results[0].subagent_results.len(), 1);
    }
}
