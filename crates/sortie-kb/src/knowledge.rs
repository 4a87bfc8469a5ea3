//! Learning extraction and retrieval across missions.
//!
//! Completed-mission reports and investigation artifacts are mined into
//! typed learnings with deterministic ids, stored in SQLite and indexed
//! semantically. PLANNING pulls a context block of similar missions,
//! techniques, insights and gotchas back out.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use sortie_types::{
    days_old, now_iso, stable_id, Learning, LearningSourceType, LearningType, MissionDigest,
    Outcome,
};

use crate::domain::{extract_keywords, infer_domain};
use crate::index::{Embedder, ScoreBreakdown, SemanticIndex};
use crate::store::{KnowledgeStatistics, KnowledgeStore};

const DESCRIPTION_CAP: usize = 500;

const SUCCESS_KEYWORDS: &[&str] = &[
    "insight", "discovered", "learned", "found", "realized", "completed", "success",
    "achieved", "implemented", "fixed", "resolved", "working", "passed", "verified",
];
const FAILURE_KEYWORDS: &[&str] = &[
    "error", "failed", "mistake", "wrong", "bug", "issue", "problem", "broken", "crash",
    "exception", "timeout",
];

#[derive(Debug, Clone, Serialize)]
pub struct ScoredLearning {
    #[serde(flatten)]
    pub learning: Learning,
    pub confidence_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_breakdown: Option<ScoreBreakdown>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source_id: String,
    pub learnings_extracted: usize,
}

pub struct KnowledgeBase {
    store: KnowledgeStore,
    index: Mutex<SemanticIndex>,
}

impl KnowledgeBase {
    pub fn open(db_path: &Path, embedder: Option<std::sync::Arc<dyn Embedder>>) -> Result<Self> {
        let store = KnowledgeStore::open(db_path)?;
        let kb = KnowledgeBase { store, index: Mutex::new(SemanticIndex::new(embedder)) };
        kb.rebuild_index()?;
        Ok(kb)
    }

    pub fn open_in_memory(embedder: Option<std::sync::Arc<dyn Embedder>>) -> Result<Self> {
        let store = KnowledgeStore::open_in_memory()?;
        Ok(KnowledgeBase { store, index: Mutex::new(SemanticIndex::new(embedder)) })
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn rebuild_index(&self) -> Result<()> {
        let rows = self.store.index_rows()?;
        self.index.lock().unwrap().fit(rows);
        Ok(())
    }

    pub fn statistics(&self) -> Result<KnowledgeStatistics> {
        self.store.statistics()
    }

    fn store_learning(&self, learning: &Learning) -> Result<()> {
        self.store.upsert_learning(learning)?;
        self.index.lock().unwrap().add_incremental(
            &learning.learning_id,
            &learning.index_text(),
            &learning.timestamp,
        );
        Ok(())
    }

    // Mission ingestion

    /// Parse a completed-mission report and extract its learnings.
    /// Re-ingesting the same report yields the same learning ids.
    pub fn ingest_completed_mission(&self, report_path: &Path) -> Result<IngestReport> {
        let content = std::fs::read_to_string(report_path)
            .with_context(|| format!("reading mission report {}", report_path.display()))?;
        let report: Value = serde_json::from_str(&content)
            .with_context(|| format!("parsing mission report {}", report_path.display()))?;

        let mission_id =
            report.get("mission_id").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();

        let summary = self.extract_summary(&report);
        self.store.upsert_summary(&summary)?;

        let learnings = extract_learnings(&report);
        for learning in &learnings {
            self.store_learning(learning)?;
        }

        if learnings.is_empty() {
            tracing::warn!(mission = %mission_id, "zero learnings extracted");
        } else {
            tracing::info!(mission = %mission_id, count = learnings.len(),
                "mission ingested");
        }

        Ok(IngestReport { source_id: mission_id, learnings_extracted: learnings.len() })
    }

    /// Sweep a directory of mission logs.
    pub fn ingest_all_mission_logs(&self, logs_dir: &Path) -> Result<Vec<IngestReport>> {
        let mut reports = Vec::new();
        if !logs_dir.exists() {
            return Ok(reports);
        }
        for entry in std::fs::read_dir(logs_dir)?.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match self.ingest_completed_mission(&path) {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e,
                            "skipping unreadable mission log");
                    }
                }
            }
        }
        Ok(reports)
    }

    fn extract_summary(&self, report: &Value) -> MissionDigest {
        let final_stage =
            report.get("current_stage").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
        let status = report.get("status").and_then(|v| v.as_str()).unwrap_or("");
        let halted = report.get("halt_reason").map(|v| !v.is_null()).unwrap_or(false);
        let outcome = if halted {
            Outcome::Partial
        } else if final_stage == "COMPLETE" || status == "mission_complete" {
            Outcome::Success
        } else {
            Outcome::Partial
        };

        let duration_minutes = duration_minutes(report);
        let problem_statement = problem_statement(report);
        let problem_domain = infer_domain(&problem_statement);

        let mut key_learnings = Vec::new();
        let mut failures = Vec::new();
        for cycle in report.get("cycles").and_then(|v| v.as_array()).into_iter().flatten() {
            if let Some(summary) = cycle.get("summary").and_then(|v| v.as_str()) {
                if !summary.is_empty() {
                    key_learnings.push(cap(summary, 200));
                }
            }
            for achievement in string_items(cycle.get("achievements")) {
                key_learnings.push(cap(&achievement, 200));
            }
            for issue in string_items(cycle.get("issues")) {
                failures.push(cap(&issue, 200));
            }
        }

        if key_learnings.is_empty() {
            for entry in report.get("history").and_then(|v| v.as_array()).into_iter().flatten()
            {
                let text = entry.get("entry").and_then(|v| v.as_str()).unwrap_or("");
                let lower = text.to_lowercase();
                if lower.contains("success") || lower.contains("completed") {
                    key_learnings.push(cap(text, 200));
                } else if lower.contains("error") || lower.contains("failed") {
                    failures.push(cap(text, 200));
                }
            }
        }

        key_learnings.truncate(10);
        failures.truncate(10);

        MissionDigest {
            mission_id: report
                .get("mission_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            problem_statement,
            problem_domain,
            outcome,
            approach_taken: String::new(),
            key_learnings,
            failures_encountered: failures,
            files_created: string_items(report.get("all_files")),
            duration_minutes,
            cycles_used: report
                .get("total_cycles")
                .or_else(|| report.get("current_cycle"))
                .and_then(|v| v.as_u64())
                .unwrap_or(1) as u32,
            timestamp: now_iso(),
        }
    }

    // Investigation ingestion

    /// Parse `artifacts/findings.json` and `artifacts/investigation_report.md`
    /// from an investigation workspace.
    pub fn ingest_investigation(&self, investigation_dir: &Path) -> Result<IngestReport> {
        let artifacts = investigation_dir.join("artifacts");
        let findings_path = artifacts.join("findings.json");
        let report_path = artifacts.join("investigation_report.md");

        let findings_content = std::fs::read_to_string(&findings_path)
            .with_context(|| format!("reading {}", findings_path.display()))?;
        let findings: Value = serde_json::from_str(&findings_content)
            .with_context(|| format!("parsing {}", findings_path.display()))?;

        let investigation_id = findings
            .get("investigation_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let query =
            findings.get("query").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let problem_domain = infer_domain(&query);

        let mut learnings = Vec::new();

        for result in
            findings.get("subagent_results").and_then(|v| v.as_array()).into_iter().flatten()
        {
            if result.get("status").and_then(|v| v.as_str()) != Some("completed") {
                continue;
            }
            let focus_area =
                result.get("focus_area").and_then(|v| v.as_str()).unwrap_or("Unknown");
            let text = result.get("findings").and_then(|v| v.as_str()).unwrap_or("");
            if text.len() < 20 {
                continue;
            }
            learnings.extend(extract_subagent_findings(
                text,
                focus_area,
                &investigation_id,
                &query,
                &problem_domain,
            ));
        }

        if let Ok(report_content) = std::fs::read_to_string(&report_path) {
            learnings.extend(extract_report_learnings(
                &report_content,
                &investigation_id,
                &query,
                &problem_domain,
            ));
        }

        for learning in &learnings {
            self.store_learning(learning)?;
        }

        tracing::info!(investigation = %investigation_id, count = learnings.len(),
            "investigation ingested");
        Ok(IngestReport {
            source_id: investigation_id,
            learnings_extracted: learnings.len(),
        })
    }

    // Retrieval

    /// Confidence-scored retrieval: semantic candidates filtered by type
    /// and source, rescored as 0.7 tfidf + 0.1 domain + 0.05 success +
    /// up to 0.05 recency.
    pub fn query_relevant_learnings(
        &self,
        problem_statement: &str,
        top_k: usize,
        learning_types: Option<&[LearningType]>,
        source_type: Option<LearningSourceType>,
    ) -> Result<Vec<ScoredLearning>> {
        let target_domain = infer_domain(problem_statement);

        let candidates = {
            let mut index = self.index.lock().unwrap();
            if !index.is_fitted() && index.pending_count() == 0 {
                drop(index);
                self.rebuild_index()?;
                index = self.index.lock().unwrap();
            }
            index.query(problem_statement, top_k * 3)
        };

        let mut results = Vec::new();
        for (learning_id, _hybrid, breakdown) in candidates {
            let Some(learning) = self.store.learning(&learning_id)? else { continue };

            if let Some(source_type) = source_type {
                if learning.source_type != source_type {
                    continue;
                }
            }
            if let Some(types) = learning_types {
                if !types.contains(&learning.learning_type) {
                    continue;
                }
            }

            let confidence = compute_confidence(
                breakdown.tfidf,
                learning.problem_domain == target_domain,
                learning.outcome,
                &learning.timestamp,
            );

            results.push(ScoredLearning {
                learning,
                confidence_score: (confidence * 1000.0).round() / 1000.0,
                score_breakdown: Some(breakdown),
            });

            if results.len() >= top_k {
                break;
            }
        }

        results.sort_by(|a, b| {
            b.confidence_score
                .partial_cmp(&a.confidence_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    /// Keyword-scored similar past missions with a domain bonus.
    pub fn similar_missions(
        &self,
        problem_statement: &str,
        top_k: usize,
    ) -> Result<Vec<MissionDigest>> {
        let target_domain = infer_domain(problem_statement);
        let target_keywords: std::collections::HashSet<String> =
            extract_keywords(problem_statement).into_iter().collect();

        let mut scored: Vec<(usize, MissionDigest)> = self
            .store
            .summaries()?
            .into_iter()
            .map(|summary| {
                let keywords: std::collections::HashSet<String> =
                    extract_keywords(&summary.problem_statement).into_iter().collect();
                let overlap = target_keywords.intersection(&keywords).count();
                let domain_bonus =
                    if summary.problem_domain == target_domain { 3 } else { 0 };
                (overlap + domain_bonus, summary)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(top_k).map(|(_, summary)| summary).collect())
    }

    /// Markdown block injected into PLANNING prompts: similar missions,
    /// techniques, insights and gotchas to avoid. Empty when the base has
    /// nothing relevant.
    pub fn generate_planning_context(&self, problem_statement: &str) -> Result<String> {
        let learnings = self.query_relevant_learnings(problem_statement, 5, None, None)?;
        let missions = self.similar_missions(problem_statement, 2)?;

        if learnings.is_empty() && missions.is_empty() {
            return Ok(String::new());
        }

        let mut parts: Vec<String> = Vec::new();

        if !missions.is_empty() {
            parts.push("### Similar Past Missions".to_string());
            for mission in &missions {
                let marker = match mission.outcome {
                    Outcome::Success => "[ok]",
                    Outcome::Partial => "[~]",
                    Outcome::Failure => "[x]",
                };
                parts.push(format!(
                    "\n**{} {}** ({})\n- Problem: {}\n- Duration: {:.1} minutes, {} cycles\n",
                    marker,
                    mission.mission_id,
                    mission.outcome.as_str(),
                    cap(&mission.problem_statement, 200),
                    mission.duration_minutes,
                    mission.cycles_used,
                ));
            }
        }

        let techniques: Vec<&ScoredLearning> = learnings
            .iter()
            .filter(|l| l.learning.learning_type == LearningType::Technique)
            .collect();
        let insights: Vec<&ScoredLearning> = learnings
            .iter()
            .filter(|l| l.learning.learning_type == LearningType::Insight)
            .collect();
        let gotchas: Vec<&ScoredLearning> = learnings
            .iter()
            .filter(|l| l.learning.learning_type == LearningType::Gotcha)
            .collect();

        if !techniques.is_empty() {
            parts.push("\n### Relevant Techniques from Past Missions".to_string());
            for t in techniques.iter().take(3) {
                parts.push(format!(
                    "- **{}** (confidence: {:.2}): {}",
                    t.learning.title,
                    t.confidence_score,
                    cap(&t.learning.description, 150),
                ));
            }
        }

        if !insights.is_empty() {
            parts.push("\n### Relevant Insights".to_string());
            for i in insights.iter().take(3) {
                parts.push(format!(
                    "- (confidence: {:.2}) {}",
                    i.confidence_score,
                    cap(&i.learning.description, 200),
                ));
            }
        }

        if !gotchas.is_empty() {
            parts.push("\n### Gotchas to Avoid".to_string());
            for g in gotchas.iter().take(3) {
                parts.push(format!(
                    "- WARNING (confidence: {:.2}) {}",
                    g.confidence_score,
                    cap(&g.learning.description, 200),
                ));
            }
        }

        Ok(format!(
            "\n=== LEARNINGS FROM PAST MISSIONS ===\n\
             The knowledge base contains insights from similar past work.\n\n\
             {}\n\n\
             Use this context to inform your planning. Avoid repeating past failures.\n\
             === END LEARNINGS ===\n",
            parts.join("\n")
        ))
    }
}

fn compute_confidence(
    tfidf_score: f64,
    domain_match: bool,
    outcome: Outcome,
    timestamp: &str,
) -> f64 {
    let mut confidence = tfidf_score * 0.7;
    if domain_match {
        confidence += 0.1;
    }
    if outcome == Outcome::Success {
        confidence += 0.05;
    }
    if let Some(days) = days_old(timestamp) {
        if (0..90).contains(&days) {
            confidence += 0.05 * (1.0 - days as f64 / 90.0);
        }
    }
    confidence.min(1.0)
}

// Extraction helpers

fn problem_statement(report: &Value) -> String {
    report
        .get("original_mission")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| report.get("problem_statement").and_then(|v| v.as_str()))
        .unwrap_or("")
        .to_string()
}

fn duration_minutes(report: &Value) -> f64 {
    let span = |start_key: &str, end_key: &str| -> Option<f64> {
        let start = sortie_types::parse_iso(report.get(start_key)?.as_str()?)?;
        let end = sortie_types::parse_iso(report.get(end_key)?.as_str()?)?;
        Some((end - start).num_seconds() as f64 / 60.0)
    };
    span("started_at", "completed_at")
        .or_else(|| span("created_at", "last_updated"))
        .unwrap_or(0.0)
}

fn string_items(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect()
        })
        .unwrap_or_default()
}

fn cap(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn learning(
    mission_id: &str,
    coordinate: &str,
    learning_type: LearningType,
    title: String,
    description: &str,
    domain: &str,
    outcome: Outcome,
    lesson_source: &str,
) -> Learning {
    Learning {
        learning_id: stable_id(&format!("{}_{}", mission_id, coordinate)),
        mission_id: mission_id.to_string(),
        learning_type,
        title,
        description: cap(description, DESCRIPTION_CAP),
        problem_domain: domain.to_string(),
        outcome,
        relevance_keywords: extract_keywords(description),
        files_created: Vec::new(),
        timestamp: now_iso(),
        lesson_source: lesson_source.to_string(),
        source_type: LearningSourceType::Mission,
        source_investigation_id: None,
        investigation_query: None,
    }
}

/// The per-source extraction table: cycle summaries and achievements are
/// techniques, issues are gotchas, continuation prompts are insights,
/// final summary and deliverables are techniques, and history entries
/// classify by success/failure keywords.
pub fn extract_learnings(report: &Value) -> Vec<Learning> {
    let mission_id =
        report.get("mission_id").and_then(|v| v.as_str()).unwrap_or("unknown");
    let statement = problem_statement(report);
    let domain = infer_domain(&statement);
    let mut learnings = Vec::new();

    for cycle in report.get("cycles").and_then(|v| v.as_array()).into_iter().flatten() {
        let cycle_num = cycle.get("cycle").and_then(|v| v.as_u64()).unwrap_or(0);

        if let Some(summary) = cycle.get("summary").and_then(|v| v.as_str()) {
            if !summary.is_empty() {
                let mut l = learning(
                    mission_id,
                    &format!("cycle_{}_summary", cycle_num),
                    LearningType::Technique,
                    format!("Cycle {} Summary", cycle_num),
                    summary,
                    &domain,
                    Outcome::Success,
                    "cycle_summary",
                );
                l.files_created = string_items(cycle.get("files_created"));
                learnings.push(l);
            }
        }

        for (i, achievement) in string_items(cycle.get("achievements")).iter().enumerate() {
            learnings.push(learning(
                mission_id,
                &format!("cycle_{}_achievement_{}", cycle_num, i),
                LearningType::Technique,
                format!("Achievement: Cycle {}", cycle_num),
                achievement,
                &domain,
                Outcome::Success,
                "achievement",
            ));
        }

        for (i, issue) in string_items(cycle.get("issues")).iter().enumerate() {
            learnings.push(learning(
                mission_id,
                &format!("cycle_{}_issue_{}", cycle_num, i),
                LearningType::Gotcha,
                format!("Issue: Cycle {}", cycle_num),
                issue,
                &domain,
                Outcome::Partial,
                "issue",
            ));
        }

        if let Some(continuation) = cycle.get("continuation_prompt").and_then(|v| v.as_str())
        {
            if continuation.len() > 50 {
                learnings.push(learning(
                    mission_id,
                    &format!("cycle_{}_continuation", cycle_num),
                    LearningType::Insight,
                    format!("Next Steps: Cycle {}", cycle_num),
                    continuation,
                    &domain,
                    Outcome::Success,
                    "continuation",
                ));
            }
        }
    }

    if let Some(final_summary) = report.get("final_summary").and_then(|v| v.as_str()) {
        if final_summary.len() > 20 {
            learnings.push(learning(
                mission_id,
                "final_summary",
                LearningType::Technique,
                "Mission Final Summary".to_string(),
                final_summary,
                &domain,
                Outcome::Success,
                "final_summary",
            ));
        }
    }

    for (i, deliverable) in string_items(report.get("deliverables")).iter().enumerate() {
        if deliverable.len() > 30 {
            learnings.push(learning(
                mission_id,
                &format!("deliverable_{}", i),
                LearningType::Technique,
                format!("Deliverable: {}...", cap(deliverable, 50)),
                deliverable,
                &domain,
                Outcome::Success,
                "deliverable",
            ));
        }
    }

    for (i, entry) in
        report.get("history").and_then(|v| v.as_array()).into_iter().flatten().enumerate()
    {
        let text = entry.get("entry").and_then(|v| v.as_str()).unwrap_or("");
        if text.len() < 20 {
            continue;
        }
        let stage = entry.get("stage").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
        let lower = text.to_lowercase();
        // Entry index plus a text prefix keys the id, so identical
        // reports re-key identically
        let coordinate = format!("hist_{}_{}", i, cap(text, 50));

        if SUCCESS_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            learnings.push(learning(
                mission_id,
                &coordinate,
                LearningType::Insight,
                format!("Insight from {}", stage),
                text,
                &domain,
                Outcome::Success,
                "history",
            ));
        } else if FAILURE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            learnings.push(learning(
                mission_id,
                &coordinate,
                LearningType::Gotcha,
                format!("Issue in {}", stage),
                text,
                &domain,
                Outcome::Failure,
                "history",
            ));
        }
    }

    learnings
}

fn investigation_learning(
    investigation_id: &str,
    coordinate: &str,
    learning_type: LearningType,
    title: String,
    description: &str,
    domain: &str,
    query: &str,
    lesson_source: &str,
) -> Learning {
    Learning {
        learning_id: stable_id(&format!("{}_{}", investigation_id, coordinate)),
        mission_id: investigation_id.to_string(),
        learning_type,
        title,
        description: cap(description, DESCRIPTION_CAP),
        problem_domain: domain.to_string(),
        outcome: Outcome::Success,
        relevance_keywords: extract_keywords(description),
        files_created: Vec::new(),
        timestamp: now_iso(),
        lesson_source: lesson_source.to_string(),
        source_type: LearningSourceType::Investigation,
        source_investigation_id: Some(investigation_id.to_string()),
        investigation_query: Some(query.to_string()),
    }
}

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap());

fn extract_subagent_findings(
    text: &str,
    focus_area: &str,
    investigation_id: &str,
    query: &str,
    domain: &str,
) -> Vec<Learning> {
    let focus_short = cap(focus_area, 10);
    let mut learnings = Vec::new();

    if let Some(captures) = FENCED_JSON.captures(text) {
        if let Ok(data) = serde_json::from_str::<Value>(&captures[1]) {
            for (i, finding) in string_items(data.get("key_findings")).iter().enumerate() {
                if finding.len() > 20 {
                    learnings.push(investigation_learning(
                        investigation_id,
                        &format!("finding_{}_{}", focus_short, i),
                        LearningType::Technique,
                        format!("Finding: {}", focus_area),
                        finding,
                        domain,
                        query,
                        "investigation",
                    ));
                }
            }
            if let Some(insights) = data.get("insights").and_then(|v| v.as_str()) {
                if insights.len() > 30 {
                    learnings.push(investigation_learning(
                        investigation_id,
                        &format!("insight_{}", focus_short),
                        LearningType::Insight,
                        format!("Insight: {}", focus_area),
                        insights,
                        domain,
                        query,
                        "investigation",
                    ));
                }
            }
            for (i, question) in
                string_items(data.get("follow_up_questions")).iter().enumerate()
            {
                learnings.push(investigation_learning(
                    investigation_id,
                    &format!("followup_{}_{}", focus_short, i),
                    LearningType::Insight,
                    format!("Follow-up: {}", focus_area),
                    question,
                    domain,
                    query,
                    "investigation",
                ));
            }
            return learnings;
        }
    }

    // No structured block: keep the raw text as one insight
    if text.len() > 50 {
        learnings.push(investigation_learning(
            investigation_id,
            &format!("raw_{}", focus_short),
            LearningType::Insight,
            format!("Research: {}", focus_area),
            &cap(text, 1000),
            domain,
            query,
            "investigation",
        ));
    }

    learnings
}

fn section<'a>(report: &'a str, heading: &str) -> Option<&'a str> {
    let pattern = Regex::new(&format!(r"(?is)##\s*{}\s*\n(.*?)(?:\n##|\z)", heading)).ok()?;
    pattern.captures(report).map(|c| c.get(1).map(|m| m.as_str()).unwrap_or(""))
}

static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-*\d.]+\s+(.+)$").unwrap());

fn bullets(text: &str) -> Vec<String> {
    BULLET.captures_iter(text).map(|c| c[1].trim().to_string()).collect()
}

fn extract_report_learnings(
    report: &str,
    investigation_id: &str,
    query: &str,
    domain: &str,
) -> Vec<Learning> {
    let mut learnings = Vec::new();
    if report.len() < 100 {
        return learnings;
    }

    if let Some(summary) = section(report, "Executive Summary") {
        let summary = summary.trim();
        if summary.len() > 50 {
            learnings.push(investigation_learning(
                investigation_id,
                "exec_summary",
                LearningType::Technique,
                "Investigation Summary".to_string(),
                summary,
                domain,
                query,
                "investigation_report",
            ));
        }
    }

    if let Some(findings) = section(report, "Key Findings") {
        for (i, bullet) in bullets(findings).iter().take(5).enumerate() {
            if bullet.len() > 30 {
                learnings.push(investigation_learning(
                    investigation_id,
                    &format!("key_finding_{}", i),
                    LearningType::Technique,
                    format!("Key Finding: {}...", cap(bullet, 50)),
                    bullet,
                    domain,
                    query,
                    "investigation_report",
                ));
            }
        }
    }

    if let Some(recommendations) = section(report, "Recommendations?") {
        for (i, bullet) in bullets(recommendations).iter().take(5).enumerate() {
            if bullet.len() > 30 {
                learnings.push(investigation_learning(
                    investigation_id,
                    &format!("recommendation_{}", i),
                    LearningType::Template,
                    format!("Recommendation: {}...", cap(bullet, 50)),
                    bullet,
                    domain,
                    query,
                    "investigation_report",
                ));
            }
        }
    }

    if let Some(next_steps) = section(report, "Next Steps?") {
        for (i, bullet) in bullets(next_steps).iter().take(5).enumerate() {
            if bullet.len() > 30 {
                learnings.push(investigation_learning(
                    investigation_id,
                    &format!("next_step_{}", i),
                    LearningType::Insight,
                    format!("Next Step: {}...", cap(bullet, 50)),
                    bullet,
                    domain,
                    query,
                    "investigation_report",
                ));
            }
        }
    }

    learnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn gpu_report() -> Value {
        json!({
            "mission_id": "mission_gpu1",
            "original_mission": "Optimize CUDA training throughput for the vision model",
            "current_stage": "COMPLETE",
            "total_cycles": 2,
            "cycles": [
                {
                    "cycle": 1,
                    "summary": "Profiled CUDA kernels and fused the attention ops for higher GPU throughput",
                    "achievements": ["Reduced VRAM usage by batching gradient accumulation"],
                    "issues": ["Mixed precision caused NaN gradients at first"],
                    "continuation_prompt": "Next cycle should tune the dataloader prefetching to keep the GPU saturated during training epochs"
                }
            ],
            "final_summary": "Training throughput doubled by kernel fusion and precision tuning",
            "deliverables": ["Fused attention kernel with deterministic output parity checks"],
            "history": [
                {"stage": "TESTING", "entry": "All throughput regression tests passed after kernel fusion"}
            ]
        })
    }

    fn write_report(dir: &TempDir, report: &Value) -> std::path::PathBuf {
        let path = dir.path().join("mission_gpu1_report.json");
        std::fs::write(&path, serde_json::to_vec_pretty(report).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_extraction_table() {
        let report = gpu_report();
        let learnings = extract_learnings(&report);

        let sources: Vec<&str> =
            learnings.iter().map(|l| l.lesson_source.as_str()).collect();
        assert!(sources.contains(&"cycle_summary"));
        assert!(sources.contains(&"achievement"));
        assert!(sources.contains(&"issue"));
        assert!(sources.contains(&"continuation"));
        assert!(sources.contains(&"final_summary"));
        assert!(sources.contains(&"deliverable"));
        assert!(sources.contains(&"history"));

        let issue = learnings.iter().find(|l| l.lesson_source == "issue").unwrap();
        assert_eq!(issue.learning_type, LearningType::Gotcha);
        assert_eq!(learnings[0].problem_domain, "gpu_optimization");
    }

    #[test]
    fn test_learning_ids_stable_across_reingestion() {
        let report = gpu_report();
        let first: Vec<String> =
            extract_learnings(&report).into_iter().map(|l| l.learning_id).collect();
        let second: Vec<String> =
            extract_learnings(&report).into_iter().map(|l| l.learning_id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ingest_twice_keeps_row_count() {
        let dir = TempDir::new().unwrap();
        let path = write_report(&dir, &gpu_report());
        let kb = KnowledgeBase::open_in_memory(None).unwrap();

        let first = kb.ingest_completed_mission(&path).unwrap();
        let count_after_first = kb.store().all_learnings().unwrap().len();
        let second = kb.ingest_completed_mission(&path).unwrap();
        let count_after_second = kb.store().all_learnings().unwrap().len();

        assert_eq!(first.learnings_extracted, second.learnings_extracted);
        assert_eq!(count_after_first, count_after_second);
    }

    #[test]
    fn test_planning_context_references_ingested_mission() {
        let dir = TempDir::new().unwrap();
        let path = write_report(&dir, &gpu_report());
        let kb = KnowledgeBase::open_in_memory(None).unwrap();
        kb.ingest_completed_mission(&path).unwrap();

        let context =
            kb.generate_planning_context("optimize CUDA training throughput").unwrap();
        assert!(!context.is_empty());
        assert!(
            context.contains("Relevant Techniques")
                || context.contains("Similar Past Missions")
        );
        assert!(context.contains("mission_gpu1") || context.contains("GPU")
            || context.contains("kernel"));
    }

    #[test]
    fn test_empty_base_yields_empty_context() {
        let kb = KnowledgeBase::open_in_memory(None).unwrap();
        let context = kb.generate_planning_context("anything at all").unwrap();
        assert!(context.is_empty());
    }

    #[test]
    fn test_query_filters_by_type() {
        let dir = TempDir::new().unwrap();
        let path = write_report(&dir, &gpu_report());
        let kb = KnowledgeBase::open_in_memory(None).unwrap();
        kb.ingest_completed_mission(&path).unwrap();

        let gotchas = kb
            .query_relevant_learnings(
                "CUDA training precision",
                5,
                Some(&[LearningType::Gotcha]),
                None,
            )
            .unwrap();
        assert!(gotchas.iter().all(|s| s.learning.learning_type == LearningType::Gotcha));
    }

    #[test]
    fn test_confidence_prefers_domain_match() {
        let higher = compute_confidence(0.5, true, Outcome::Success, &now_iso());
        let lower = compute_confidence(0.5, false, Outcome::Partial, &now_iso());
        assert!(higher > lower);
        assert!(higher <= 1.0);
    }

    #[test]
    fn test_investigation_ingestion() {
        let dir = TempDir::new().unwrap();
        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();

        let findings = json!({
            "investigation_id": "inv_42",
            "query": "how should the sqlite schema evolve",
            "subagent_results": [
                {
                    "status": "completed",
                    "focus_area": "schema design",
                    "findings": "```json\n{\"key_findings\": [\"Partial indexes keep duplicate detection cheap at scale\"], \"insights\": \"Versioned user_version pragmas make migrations forward-only and safe\"}\n```"
                },
                {"status": "failed", "focus_area": "ignored", "findings": "irrelevant"}
            ]
        });
        std::fs::write(
            artifacts.join("findings.json"),
            serde_json::to_vec_pretty(&findings).unwrap(),
        )
        .unwrap();

        std::fs::write(
            artifacts.join("investigation_report.md"),
            "# Report\n\n## Executive Summary\nThe schema should version forward only, with partial unique indexes for dedup.\n\n## Key Findings\n- Partial unique indexes enforce event dedup without hurting insert throughput\n\n## Recommendations\n- Adopt WAL journaling for every store that sees concurrent readers\n\n## Next Steps\n- Benchmark the WAL checkpoint cadence under sustained ingest load\n",
        )
        .unwrap();

        let kb = KnowledgeBase::open_in_memory(None).unwrap();
        let report = kb.ingest_investigation(dir.path()).unwrap();
        assert_eq!(report.source_id, "inv_42");
        assert!(report.learnings_extracted >= 5);

        let learnings = kb.store().all_learnings().unwrap();
        assert!(learnings
            .iter()
            .all(|l| l.source_type == LearningSourceType::Investigation
                || l.source_type == LearningSourceType::Mission));
        assert!(learnings
            .iter()
            .any(|l| l.source_investigation_id.as_deref() == Some("inv_42")));
        assert!(learnings.iter().any(|l| l.learning_type == LearningType::Template));

        // Re-ingestion is id-stable
        let second = kb.ingest_investigation(dir.path()).unwrap();
        assert_eq!(second.learnings_extracted, report.learnings_extracted);
        assert_eq!(kb.store().all_learnings().unwrap().len(), learnings.len());
    }
}
