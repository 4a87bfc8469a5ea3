//! Mission duration estimation from cycle budgets and history.

use std::path::Path;

use sortie_types::Stage;

/// Fallback when nothing better is known
pub const DEFAULT_CYCLE_TIME_MINUTES: u32 = 45;

/// Base minutes by cycle budget
const CYCLE_TIME_BY_CYCLES: &[(u32, u32)] = &[
    (1, 30),
    (2, 45),
    (3, 60),
    (4, 75),
    (5, 90),
    (6, 100),
    (7, 110),
    (8, 120),
    (9, 130),
    (10, 140),
];

/// How many recent completed logs feed the historical average
const HISTORY_WINDOW: usize = 30;
const MIN_ESTIMATE_MINUTES: u32 = 15;
const MAX_ESTIMATE_MINUTES: u32 = 300;

pub fn base_estimate(cycle_budget: u32) -> u32 {
    CYCLE_TIME_BY_CYCLES
        .iter()
        .find(|(cycles, _)| *cycles == cycle_budget)
        .map(|(_, minutes)| *minutes)
        .unwrap_or(DEFAULT_CYCLE_TIME_MINUTES)
}

/// Keyword adjustment on the description: quick work shrinks, heavy
/// rework grows.
pub fn keyword_multiplier(description: &str) -> f64 {
    let lower = description.to_lowercase();
    const QUICK: &[&str] = &["simple", "quick", "minor", "small", "typo"];
    const HEAVY: &[&str] = &["refactor", "overhaul", "redesign", "migrate"];
    const BROAD: &[&str] = &["complex", "comprehensive", "full", "extensive", "rewrite"];

    if HEAVY.iter().any(|kw| lower.contains(kw)) {
        1.5
    } else if BROAD.iter().any(|kw| lower.contains(kw)) {
        1.4
    } else if QUICK.iter().any(|kw| lower.contains(kw)) {
        0.7
    } else {
        1.0
    }
}

/// Static estimate: base-by-budget times the keyword multiplier.
pub fn estimate_minutes(description: &str, cycle_budget: u32) -> u32 {
    let minutes = base_estimate(cycle_budget) as f64 * keyword_multiplier(description);
    (minutes as u32).clamp(MIN_ESTIMATE_MINUTES, MAX_ESTIMATE_MINUTES)
}

/// Historical estimate: average minutes-per-cycle over the most recent
/// completed mission logs, blended with the static base, adjusted by
/// keywords and clamped to a sane band.
pub fn estimate_from_history(
    mission_logs_dir: &Path,
    description: &str,
    cycle_budget: u32,
) -> u32 {
    let mut base = base_estimate(cycle_budget) as f64;

    let per_cycle = historical_minutes_per_cycle(mission_logs_dir);
    if let Some(avg) = per_cycle {
        let historical = avg * cycle_budget as f64;
        base = (base + historical) / 2.0;
    }

    let minutes = base * keyword_multiplier(description);
    (minutes as u32).clamp(MIN_ESTIMATE_MINUTES, MAX_ESTIMATE_MINUTES)
}

fn historical_minutes_per_cycle(mission_logs_dir: &Path) -> Option<f64> {
    if !mission_logs_dir.exists() {
        return None;
    }

    let mut logs: Vec<std::path::PathBuf> = std::fs::read_dir(mission_logs_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    // Newest first by filename (log names embed their timestamp)
    logs.sort_by(|a, b| b.cmp(a));

    let mut per_cycle = Vec::new();
    for path in logs.into_iter().take(HISTORY_WINDOW) {
        let Ok(content) = std::fs::read_to_string(&path) else { continue };
        let Ok(log) = serde_json::from_str::<serde_json::Value>(&content) else { continue };

        let final_stage = log.get("final_stage").and_then(|v| v.as_str()).unwrap_or("");
        if final_stage != Stage::Complete.as_str() {
            continue;
        }
        let cycles = log.get("total_cycles").and_then(|v| v.as_u64()).unwrap_or(0);
        let duration = log
            .get("total_duration_seconds")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        if cycles > 0 && duration > 0.0 {
            per_cycle.push(duration / 60.0 / cycles as f64);
        }
    }

    if per_cycle.is_empty() {
        None
    } else {
        Some(per_cycle.iter().sum::<f64>() / per_cycle.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_base_estimate_by_budget() {
        assert_eq!(base_estimate(1), 30);
        assert_eq!(base_estimate(3), 60);
        assert_eq!(base_estimate(10), 140);
        assert_eq!(base_estimate(42), DEFAULT_CYCLE_TIME_MINUTES);
    }

    #[test]
    fn test_keyword_multipliers() {
        assert_eq!(keyword_multiplier("a quick fix"), 0.7);
        assert_eq!(keyword_multiplier("comprehensive rework of everything"), 1.4);
        assert_eq!(keyword_multiplier("refactor the storage layer"), 1.5);
        assert_eq!(keyword_multiplier("add a feature"), 1.0);
    }

    #[test]
    fn test_estimate_clamped() {
        // 30 * 0.7 = 21, above the floor
        assert_eq!(estimate_minutes("quick fix", 1), 21);
        // Heavy multiplier cannot exceed the cap
        assert!(estimate_minutes("total rewrite overhaul", 10) <= 300);
    }

    #[test]
    fn test_history_average_blended() {
        let dir = TempDir::new().unwrap();
        // Two completed logs averaging 20 minutes per cycle
        for (i, (cycles, secs)) in [(2u64, 2400.0f64), (1, 1200.0)].iter().enumerate() {
            let log = serde_json::json!({
                "final_stage": "COMPLETE",
                "total_cycles": cycles,
                "total_duration_seconds": secs,
            });
            std::fs::write(
                dir.path().join(format!("mission_log_{}.json", i)),
                serde_json::to_vec(&log).unwrap(),
            )
            .unwrap();
        }

        // base(3)=60, historical = 20*3 = 60, blend = 60
        assert_eq!(estimate_from_history(dir.path(), "normal work", 3), 60);
    }

    #[test]
    fn test_history_ignores_incomplete_logs() {
        let dir = TempDir::new().unwrap();
        let log = serde_json::json!({
            "final_stage": "FAILED",
            "total_cycles": 5,
            "total_duration_seconds": 100000.0,
        });
        std::fs::write(dir.path().join("m.json"), serde_json::to_vec(&log).unwrap())
            .unwrap();

        // Falls back to the static estimate
        assert_eq!(estimate_from_history(dir.path(), "normal", 3), 60);
    }
}
