//! Dependency status checks and pairwise dependency suggestions.
//!
//! A queue item can depend on another mission; readiness consults the
//! mission log directory and the live mission file. Suggestion scoring
//! looks for create-then-use verb pairs, shared identifiers, sequential
//! phrasing and explicit "depends on" markers between queue items.

use std::collections::BTreeSet;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use sortie_store::atomic;
use sortie_types::{DependencyStatus, MissionRecord, QueueItem, Stage};

/// Minimum total score before a suggestion is surfaced
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;

const CREATE_VERBS: &[&str] = &[
    "add", "create", "implement", "build", "write", "introduce", "setup", "initialize",
    "define", "establish",
];
const USE_VERBS: &[&str] = &[
    "use", "extend", "modify", "update", "integrate", "enhance", "improve", "refactor",
    "fix", "test", "validate",
];
const DEPEND_PHRASES: &[&str] = &[
    "depends on", "requires", "needs", "after", "following", "builds on", "extends",
    "based on",
];

static STOP_WORDS: &[&str] = &[
    "a", "an", "the", "to", "for", "and", "or", "new", "with", "in", "on", "at", "by",
    "of", "that", "this", "from", "into", "which", "their", "there", "should", "could",
    "would",
];

static CREATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| verb_patterns(CREATE_VERBS));
static USE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| verb_patterns(USE_VERBS));

static FILE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[\w/]+\.(?:rs|py|js|ts|tsx|jsx|css|html|json|md|toml)\b").unwrap()
});
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[A-Z][a-zA-Z]{3,}|[a-z]+_[a-z]+(?:_[a-z]+)*)\b").unwrap());
static NOUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Za-z]{5,})\b").unwrap());

fn verb_patterns(verbs: &[&str]) -> Vec<Regex> {
    verbs
        .iter()
        .map(|verb| {
            Regex::new(&format!(r"\b{}\s+(?:a\s+|an\s+|the\s+|new\s+)?(\w+)", verb))
                .unwrap()
        })
        .collect()
}

/// Check whether a dependency mission is satisfied.
///
/// READY when a log shows COMPLETE (or a log merely exists), BLOCKED on a
/// FAILED/ABORTED log, WAITING when it is the live in-progress mission,
/// NOT_FOUND otherwise.
pub fn check_dependency(
    mission_logs_dir: &Path,
    mission_path: &Path,
    mission_id: &str,
) -> DependencyStatus {
    if mission_logs_dir.exists() {
        if let Ok(entries) = std::fs::read_dir(mission_logs_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(mission_id) || !name.ends_with(".json") {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };
                let Ok(log) = serde_json::from_str::<serde_json::Value>(&content) else {
                    continue;
                };
                let final_stage =
                    log.get("final_stage").and_then(|v| v.as_str()).unwrap_or("");
                if final_stage == Stage::Complete.as_str() {
                    return DependencyStatus::Ready;
                }
                if final_stage == "FAILED" || final_stage == "ABORTED" {
                    return DependencyStatus::Blocked;
                }
                // A log exists at all: the mission finished
                return DependencyStatus::Ready;
            }
        }
    }

    let current: Option<MissionRecord> = atomic::read_json(mission_path, None);
    if let Some(current) = current {
        if current.mission_id == mission_id {
            return if current.is_complete() {
                DependencyStatus::Ready
            } else {
                DependencyStatus::Waiting
            };
        }
    }

    DependencyStatus::NotFound
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencySuggestion {
    pub mission_a: String,
    pub mission_a_title: String,
    pub mission_b: String,
    pub mission_b_title: String,
    pub reason: String,
    pub confidence: f64,
    pub confidence_label: &'static str,
    pub suggested_order: [String; 2],
}

/// Score every ordered pair of queue items and surface those above the
/// confidence threshold, strongest first.
pub fn suggest_dependencies(items: &[QueueItem]) -> Vec<DependencySuggestion> {
    let mut suggestions = Vec::new();
    if items.len() < 2 {
        return suggestions;
    }

    for (i, item_a) in items.iter().enumerate() {
        for item_b in items.iter().skip(i + 1) {
            let (confidence, reasons) =
                dependency_confidence(&item_a.mission_description, &item_b.mission_description);

            if confidence >= CONFIDENCE_THRESHOLD {
                suggestions.push(DependencySuggestion {
                    mission_a: item_a.id.clone(),
                    mission_a_title: item_a.mission_title.clone(),
                    mission_b: item_b.id.clone(),
                    mission_b_title: item_b.mission_title.clone(),
                    reason: if reasons.is_empty() {
                        "Detected dependency pattern".to_string()
                    } else {
                        reasons.join("; ")
                    },
                    confidence: (confidence * 100.0).round() / 100.0,
                    confidence_label: confidence_label(confidence),
                    suggested_order: [item_a.id.clone(), item_b.id.clone()],
                });
            }
        }
    }

    suggestions.sort_by(|a, b| {
        b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal)
    });
    suggestions
}

/// Confidence that A should run before B, with explaining reasons.
pub fn dependency_confidence(mission_a: &str, mission_b: &str) -> (f64, Vec<String>) {
    let a_lower = mission_a.to_lowercase();
    let b_lower = mission_b.to_lowercase();

    let mut score = 0.0;
    let mut reasons = Vec::new();

    let (create_use_score, shared_items) = create_use_relationship(&a_lower, &b_lower);
    if create_use_score > 0.0 {
        score += create_use_score;
        let sample: Vec<&str> = shared_items.iter().take(2).map(String::as_str).collect();
        reasons.push(format!("A creates what B uses: {}", sample.join(", ")));
    }

    let shared_refs = shared_references(&a_lower, &b_lower);
    if !shared_refs.is_empty() {
        score += (shared_refs.len() as f64 * 0.1).min(0.3);
        let sample: Vec<&str> = shared_refs.iter().take(3).map(String::as_str).collect();
        reasons.push(format!("Shared references: {}", sample.join(", ")));
    }

    if has_sequential_keywords(&a_lower, &b_lower) {
        score += 0.2;
        reasons.push("Sequential pattern detected (setup -> extend)".to_string());
    }

    if let Some(marker) = explicit_dependency_marker(&a_lower, &b_lower) {
        score += 0.4;
        reasons.push(format!("Explicit dependency: {}", marker));
    }

    (score.min(1.0), reasons)
}

fn extract_verb_objects(text: &str, patterns: &[Regex]) -> BTreeSet<String> {
    let mut objects = BTreeSet::new();
    for pattern in patterns {
        for captures in pattern.captures_iter(text) {
            let word = captures[1].to_lowercase();
            if word.len() > 2 && !STOP_WORDS.contains(&word.as_str()) {
                objects.insert(word);
            }
        }
    }
    objects
}

fn create_use_relationship(text_a: &str, text_b: &str) -> (f64, Vec<String>) {
    let a_creates = extract_verb_objects(text_a, &CREATE_PATTERNS);
    let b_uses = extract_verb_objects(text_b, &USE_PATTERNS);

    let common: Vec<String> = a_creates.intersection(&b_uses).cloned().collect();
    if !common.is_empty() {
        return (0.5, common);
    }

    // Weaker signal: significant noun overlap
    let nouns = |text: &str| -> BTreeSet<String> {
        NOUN.captures_iter(text)
            .map(|c| c[1].to_lowercase())
            .filter(|w| !STOP_WORDS.contains(&w.as_str()))
            .collect()
    };
    let overlap: Vec<String> = nouns(text_a)
        .intersection(&nouns(text_b))
        .filter(|w| w.len() >= 6)
        .cloned()
        .collect();

    if !overlap.is_empty() {
        (0.3, overlap)
    } else {
        (0.0, Vec::new())
    }
}

fn shared_references(text_a: &str, text_b: &str) -> Vec<String> {
    let refs = |text: &str| -> BTreeSet<String> {
        let mut set: BTreeSet<String> =
            FILE_REF.find_iter(text).map(|m| m.as_str().to_lowercase()).collect();
        set.extend(
            IDENTIFIER
                .find_iter(text)
                .map(|m| m.as_str().to_lowercase())
                .filter(|w| !STOP_WORDS.contains(&w.as_str())),
        );
        set
    };

    refs(text_a).intersection(&refs(text_b)).cloned().collect()
}

fn has_sequential_keywords(text_a: &str, text_b: &str) -> bool {
    const FOUNDATIONAL: &[&str] = &[
        "setup", "initial", "foundation", "base", "core", "create", "implement",
        "add new", "introduce", "establish",
    ];
    const DEPENDENT: &[&str] = &[
        "extend", "build on", "enhance", "improve", "after", "follow up",
        "continuation", "based on", "using the",
    ];

    FOUNDATIONAL.iter().any(|kw| text_a.contains(kw))
        && DEPENDENT.iter().any(|kw| text_b.contains(kw))
}

fn explicit_dependency_marker(text_a: &str, text_b: &str) -> Option<String> {
    for phrase in DEPEND_PHRASES {
        if !text_b.contains(phrase) {
            continue;
        }
        let pattern =
            Regex::new(&format!(r"{}\s+(?:the\s+)?(\w+(?:\s+\w+)?)", phrase)).ok()?;
        if let Some(captures) = pattern.captures(text_b) {
            let target = captures[1].to_lowercase();
            if text_a.contains(&target) {
                return Some(format!("'{}' in A, B {} it", target, phrase));
            }
        }
    }
    None
}

fn confidence_label(confidence: f64) -> &'static str {
    if confidence >= 0.8 {
        "high"
    } else if confidence >= 0.6 {
        "medium"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(id: &str, title: &str, description: &str) -> QueueItem {
        let mut item = QueueItem::new(title, description, 3);
        item.id = id.to_string();
        item
    }

    #[test]
    fn test_dependency_ready_from_completed_log() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("mission_logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(
            logs.join("mission_aa11_20260701.json"),
            serde_json::to_vec(&serde_json::json!({"final_stage": "COMPLETE"})).unwrap(),
        )
        .unwrap();

        let status =
            check_dependency(&logs, &dir.path().join("mission.json"), "mission_aa11");
        assert_eq!(status, DependencyStatus::Ready);
    }

    #[test]
    fn test_dependency_blocked_on_failed_log() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("mission_logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(
            logs.join("mission_bb22.json"),
            serde_json::to_vec(&serde_json::json!({"final_stage": "FAILED"})).unwrap(),
        )
        .unwrap();

        let status =
            check_dependency(&logs, &dir.path().join("mission.json"), "mission_bb22");
        assert_eq!(status, DependencyStatus::Blocked);
    }

    #[test]
    fn test_dependency_waiting_on_live_mission() {
        let dir = TempDir::new().unwrap();
        let mission_path = dir.path().join("mission.json");
        let mut mission = MissionRecord::new("live one", 3, "/tmp/ws");
        mission.mission_id = "mission_cc33".to_string();
        atomic::write_json(&mission_path, &mission).unwrap();

        let status =
            check_dependency(&dir.path().join("none"), &mission_path, "mission_cc33");
        assert_eq!(status, DependencyStatus::Waiting);
    }

    #[test]
    fn test_dependency_not_found() {
        let dir = TempDir::new().unwrap();
        let status = check_dependency(
            &dir.path().join("none"),
            &dir.path().join("mission.json"),
            "mission_dd44",
        );
        assert_eq!(status, DependencyStatus::NotFound);
    }

    #[test]
    fn test_create_use_suggestion_surfaces() {
        let items = vec![
            item("q1", "Auth", "Create authentication middleware and define session tokens"),
            item(
                "q2",
                "Profile",
                "Extend authentication middleware; this builds on authentication and depends on authentication",
            ),
        ];
        let suggestions = suggest_dependencies(&items);
        assert!(!suggestions.is_empty());
        let top = &suggestions[0];
        assert_eq!(top.mission_a, "q1");
        assert_eq!(top.mission_b, "q2");
        assert!(top.confidence >= CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn test_unrelated_items_produce_nothing() {
        let items = vec![
            item("q1", "One", "Paint bikeshed rainbow"),
            item("q2", "Two", "Audit zebra migrations"),
        ];
        assert!(suggest_dependencies(&items).is_empty());
    }

    #[test]
    fn test_confidence_is_capped_at_one() {
        let (score, _) = dependency_confidence(
            "create the widget module and setup foundation for widget handling",
            "extend the widget module, depends on widget, builds on widget foundation using the widget",
        );
        assert!(score <= 1.0);
    }
}
