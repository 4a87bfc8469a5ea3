//! Hierarchical timeout allocation for multi-level agent spawning.
//!
//! A mission-level budget hands portions of its remaining time to worker
//! agents, each of which can derive a child budget for its own sub-agents.
//! A reserve fraction stays back for aggregation and cleanup.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

/// How a parent distributes time across its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Split equally (sequential execution)
    Equal,
    /// Split by provided weights
    Weighted,
    /// Each child gets the full remaining budget (sequential)
    FirstCome,
    /// Each child gets a fixed amount
    Fixed,
    /// Each child gets the full usable timeout (concurrent execution
    /// shares wall-clock, not time)
    Parallel,
}

/// Time allocation for a single agent
#[derive(Debug, Clone)]
pub struct TimeAllocation {
    pub agent_id: String,
    pub allocated_seconds: f64,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    pub used_seconds: f64,
}

impl TimeAllocation {
    fn new(agent_id: &str, allocated_seconds: f64) -> Self {
        TimeAllocation {
            agent_id: agent_id.to_string(),
            allocated_seconds,
            started_at: None,
            completed_at: None,
            used_seconds: 0.0,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn elapsed(&self) -> f64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            (Some(start), None) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        }
    }

    /// Seconds left in the allocation; never negative.
    pub fn remaining(&self) -> f64 {
        (self.allocated_seconds - self.elapsed()).max(0.0)
    }

    pub fn is_over_budget(&self) -> bool {
        self.elapsed() > self.allocated_seconds
    }
}

/// Summary counts for a budget
#[derive(Debug, Clone)]
pub struct BudgetSummary {
    pub total_seconds: f64,
    pub elapsed_seconds: f64,
    pub remaining_seconds: f64,
    pub usable_seconds: f64,
    pub reserve_seconds: f64,
    pub allocated_seconds: f64,
    pub agents_total: usize,
    pub agents_completed: usize,
    pub agents_active: usize,
    pub agents_pending: usize,
    pub agents_over_budget: usize,
    pub reclaimed_seconds: f64,
}

pub struct TimeoutBudget {
    total_seconds: f64,
    reserve_ratio: f64,
    min_child_timeout: f64,
    policy: TimeoutPolicy,
    allocations: HashMap<String, TimeAllocation>,
    created_at: Instant,
}

impl TimeoutBudget {
    pub const DEFAULT_RESERVE_RATIO: f64 = 0.10;
    pub const DEFAULT_MIN_CHILD_TIMEOUT: f64 = 60.0;

    pub fn new(total: Duration, policy: TimeoutPolicy) -> Self {
        TimeoutBudget {
            total_seconds: total.as_secs_f64(),
            reserve_ratio: Self::DEFAULT_RESERVE_RATIO,
            min_child_timeout: Self::DEFAULT_MIN_CHILD_TIMEOUT,
            policy,
            allocations: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    pub fn with_reserve_ratio(mut self, reserve_ratio: f64) -> Self {
        self.reserve_ratio = reserve_ratio.clamp(0.0, 0.5);
        self
    }

    pub fn with_min_child_timeout(mut self, seconds: f64) -> Self {
        self.min_child_timeout = seconds.max(0.0);
        self
    }

    // Presets for common scenarios

    /// 5 minutes, equal split
    pub fn quick_task() -> Self {
        Self::new(Duration::from_secs(300), TimeoutPolicy::Equal)
    }

    /// 30 minutes, equal split
    pub fn standard_task() -> Self {
        Self::new(Duration::from_secs(1800), TimeoutPolicy::Equal)
    }

    /// 60 minutes, equal split
    pub fn complex_task() -> Self {
        Self::new(Duration::from_secs(3600), TimeoutPolicy::Equal)
    }

    /// Parallel hierarchy: each agent gets `per_agent_minutes` since they
    /// run concurrently; 30% coordination overhead plus the reserve.
    pub fn hierarchical(per_agent_minutes: u64) -> Self {
        let total = (per_agent_minutes * 60) as f64 * 1.3 / 0.9;
        TimeoutBudget {
            total_seconds: total,
            reserve_ratio: Self::DEFAULT_RESERVE_RATIO,
            min_child_timeout: Self::DEFAULT_MIN_CHILD_TIMEOUT,
            policy: TimeoutPolicy::Parallel,
            allocations: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_seconds
    }

    /// Seconds available for work after the reserve.
    pub fn usable_seconds(&self) -> f64 {
        self.total_seconds * (1.0 - self.reserve_ratio)
    }

    pub fn reserve_seconds(&self) -> f64 {
        self.total_seconds * self.reserve_ratio
    }

    pub fn elapsed(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    /// Wall-clock budget left; never negative.
    pub fn remaining(&self) -> f64 {
        (self.total_seconds - self.elapsed()).max(0.0)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() <= 0.0
    }

    pub fn allocated_total(&self) -> f64 {
        self.allocations.values().map(|a| a.allocated_seconds).sum()
    }

    pub fn unallocated(&self) -> f64 {
        (self.usable_seconds() - self.allocated_total()).max(0.0)
    }

    /// Allocate timeouts to child agents according to the policy. Every
    /// allocation is clamped to at least `min_child_timeout`.
    pub fn allocate_children(
        &mut self,
        agent_ids: &[String],
        weights: Option<&HashMap<String, f64>>,
        fixed_seconds: Option<f64>,
    ) -> BTreeMap<String, f64> {
        let n = agent_ids.len();
        if n == 0 {
            return BTreeMap::new();
        }

        let available = self.unallocated();
        let mut allocations: BTreeMap<String, f64> = BTreeMap::new();

        match (self.policy, fixed_seconds, weights) {
            (TimeoutPolicy::Parallel, _, _) => {
                for id in agent_ids {
                    allocations.insert(id.clone(), self.usable_seconds());
                }
            }
            (TimeoutPolicy::Fixed, Some(fixed), _) => {
                let per_child = fixed.min(available / n as f64);
                for id in agent_ids {
                    allocations.insert(id.clone(), per_child);
                }
            }
            (TimeoutPolicy::Weighted, _, Some(weights)) => {
                let total_weight: f64 =
                    agent_ids.iter().map(|id| weights.get(id).copied().unwrap_or(1.0)).sum();
                for id in agent_ids {
                    let weight = weights.get(id).copied().unwrap_or(1.0);
                    allocations.insert(id.clone(), available * weight / total_weight);
                }
            }
            (TimeoutPolicy::FirstCome, _, _) => {
                for id in agent_ids {
                    allocations.insert(id.clone(), available);
                }
            }
            // EQUAL, or FIXED/WEIGHTED without their parameter
            _ => {
                let per_child = available / n as f64;
                for id in agent_ids {
                    allocations.insert(id.clone(), per_child);
                }
            }
        }

        for (id, seconds) in &mut allocations {
            *seconds = seconds.max(self.min_child_timeout);
            self.allocations.insert(id.clone(), TimeAllocation::new(id, *seconds));
            tracing::debug!(agent = %id, seconds = *seconds, "timeout allocated");
        }

        allocations
    }

    pub fn start_agent(&mut self, agent_id: &str) {
        if let Some(alloc) = self.allocations.get_mut(agent_id) {
            alloc.started_at = Some(Instant::now());
        }
    }

    pub fn complete_agent(&mut self, agent_id: &str) {
        if let Some(alloc) = self.allocations.get_mut(agent_id) {
            let now = Instant::now();
            alloc.completed_at = Some(now);
            if let Some(start) = alloc.started_at {
                alloc.used_seconds = now.duration_since(start).as_secs_f64();
            }
        }
    }

    pub fn remaining_for(&self, agent_id: &str) -> f64 {
        self.allocations.get(agent_id).map(|a| a.remaining()).unwrap_or(0.0)
    }

    pub fn allocation(&self, agent_id: &str) -> Option<&TimeAllocation> {
        self.allocations.get(agent_id)
    }

    /// Timeout to hand to an external invocation: remaining allocation if
    /// started, full allocation otherwise, minimum floor when unknown.
    pub fn invocation_timeout(&self, agent_id: &str) -> Duration {
        let seconds = match self.allocations.get(agent_id) {
            Some(alloc) if alloc.is_started() => alloc.remaining(),
            Some(alloc) => alloc.allocated_seconds,
            None => self.min_child_timeout,
        };
        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Unused seconds across completed agents.
    pub fn reclaim_unused(&self) -> f64 {
        self.allocations
            .values()
            .filter(|a| a.is_complete())
            .map(|a| (a.allocated_seconds - a.used_seconds).max(0.0))
            .sum()
    }

    /// New budget scoped to a child's remaining allocation. The child
    /// inherits policy, reserve and minimum unless overridden later.
    pub fn create_child_budget(&self, agent_id: &str) -> Result<TimeoutBudget> {
        let Some(alloc) = self.allocations.get(agent_id) else {
            bail!("no allocation for agent: {}", agent_id);
        };
        Ok(TimeoutBudget {
            total_seconds: alloc.remaining(),
            reserve_ratio: self.reserve_ratio,
            min_child_timeout: self.min_child_timeout,
            policy: self.policy,
            allocations: HashMap::new(),
            created_at: Instant::now(),
        })
    }

    pub fn summary(&self) -> BudgetSummary {
        let completed = self.allocations.values().filter(|a| a.is_complete()).count();
        let active = self
            .allocations
            .values()
            .filter(|a| a.is_started() && !a.is_complete())
            .count();
        let pending = self.allocations.values().filter(|a| !a.is_started()).count();
        let over = self.allocations.values().filter(|a| a.is_over_budget()).count();

        BudgetSummary {
            total_seconds: self.total_seconds,
            elapsed_seconds: self.elapsed(),
            remaining_seconds: self.remaining(),
            usable_seconds: self.usable_seconds(),
            reserve_seconds: self.reserve_seconds(),
            allocated_seconds: self.allocated_total(),
            agents_total: self.allocations.len(),
            agents_completed: completed,
            agents_active: active,
            agents_pending: pending,
            agents_over_budget: over,
            reclaimed_seconds: self.reclaim_unused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parallel_policy_gives_full_usable_to_each() {
        let mut budget = TimeoutBudget::new(Duration::from_secs(1000), TimeoutPolicy::Parallel);
        let allocs = budget.allocate_children(&ids(&["a", "b", "c"]), None, None);
        for seconds in allocs.values() {
            assert!((seconds - 900.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_equal_policy_splits_usable() {
        let mut budget = TimeoutBudget::new(Duration::from_secs(1000), TimeoutPolicy::Equal);
        let allocs = budget.allocate_children(&ids(&["a", "b", "c"]), None, None);
        for seconds in allocs.values() {
            assert!((seconds - 300.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_weighted_policy() {
        let mut budget =
            TimeoutBudget::new(Duration::from_secs(1000), TimeoutPolicy::Weighted);
        let mut weights = HashMap::new();
        weights.insert("a".to_string(), 3.0);
        weights.insert("b".to_string(), 1.0);
        let allocs = budget.allocate_children(&ids(&["a", "b"]), Some(&weights), None);
        assert!((allocs["a"] - 675.0).abs() < 1e-6);
        assert!((allocs["b"] - 225.0).abs() < 1e-6);
    }

    #[test]
    fn test_fixed_policy_caps_at_available_share() {
        let mut budget = TimeoutBudget::new(Duration::from_secs(1000), TimeoutPolicy::Fixed);
        let allocs = budget.allocate_children(&ids(&["a", "b"]), None, Some(10_000.0));
        // available/n = 450 wins over the oversized fixed request
        assert!((allocs["a"] - 450.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_come_gives_full_remaining() {
        let mut budget =
            TimeoutBudget::new(Duration::from_secs(1000), TimeoutPolicy::FirstCome);
        let allocs = budget.allocate_children(&ids(&["a", "b"]), None, None);
        assert!((allocs["a"] - 900.0).abs() < 1e-6);
        assert!((allocs["b"] - 900.0).abs() < 1e-6);
    }

    #[test]
    fn test_min_child_timeout_floor() {
        let mut budget = TimeoutBudget::new(Duration::from_secs(10), TimeoutPolicy::Equal);
        let allocs = budget.allocate_children(&ids(&["a", "b", "c", "d"]), None, None);
        for seconds in allocs.values() {
            assert!(*seconds >= TimeoutBudget::DEFAULT_MIN_CHILD_TIMEOUT);
        }
    }

    #[test]
    fn test_remaining_never_negative() {
        let budget = TimeoutBudget::new(Duration::from_secs(0), TimeoutPolicy::Equal);
        assert!(budget.remaining() >= 0.0);
        assert!(budget.is_expired());
    }

    #[test]
    fn test_child_budget_inherits_policy() {
        let mut budget =
            TimeoutBudget::new(Duration::from_secs(600), TimeoutPolicy::Parallel);
        budget.allocate_children(&ids(&["worker"]), None, None);
        let child = budget.create_child_budget("worker").unwrap();
        assert_eq!(child.policy(), TimeoutPolicy::Parallel);
        assert!(child.total_seconds() > 0.0);
        assert!(budget.create_child_budget("nobody").is_err());
    }

    #[test]
    fn test_complete_agent_records_usage() {
        let mut budget = TimeoutBudget::new(Duration::from_secs(600), TimeoutPolicy::Equal);
        budget.allocate_children(&ids(&["a"]), None, None);
        budget.start_agent("a");
        std::thread::sleep(Duration::from_millis(20));
        budget.complete_agent("a");

        let alloc = budget.allocation("a").unwrap();
        assert!(alloc.is_complete());
        assert!(alloc.used_seconds > 0.0);
        assert!(budget.reclaim_unused() > 0.0);

        let summary = budget.summary();
        assert_eq!(summary.agents_completed, 1);
        assert_eq!(summary.agents_total, 1);
    }
}
