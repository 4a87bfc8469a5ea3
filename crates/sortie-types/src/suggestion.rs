use serde::{Deserialize, Serialize};

use crate::util::{now_iso, short_id};

/// Where a next-mission suggestion came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    DriftHalt,
    SuccessfulCompletion,
    Merged,
    Manual,
}

impl SuggestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionSource::DriftHalt => "drift_halt",
            SuggestionSource::SuccessfulCompletion => "successful_completion",
            SuggestionSource::Merged => "merged",
            SuggestionSource::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<SuggestionSource> {
        match value {
            "drift_halt" => Some(SuggestionSource::DriftHalt),
            "successful_completion" => Some(SuggestionSource::SuccessfulCompletion),
            "merged" => Some(SuggestionSource::Merged),
            "manual" => Some(SuggestionSource::Manual),
            _ => None,
        }
    }
}

/// Curation state of a suggestion row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Stale,
    Orphaned,
    NeedsReview,
    Hot,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Stale => "stale",
            HealthStatus::Orphaned => "orphaned",
            HealthStatus::NeedsReview => "needs_review",
            HealthStatus::Hot => "hot",
        }
    }

    pub fn parse(value: &str) -> Option<HealthStatus> {
        match value {
            "healthy" => Some(HealthStatus::Healthy),
            "stale" => Some(HealthStatus::Stale),
            "orphaned" => Some(HealthStatus::Orphaned),
            "needs_review" => Some(HealthStatus::NeedsReview),
            "hot" => Some(HealthStatus::Hot),
            _ => None,
        }
    }
}

/// Durable next-mission recommendation row (`rec_<hex8>` ids)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub mission_title: String,
    #[serde(default)]
    pub mission_description: String,
    /// 1-10, same bounds as a mission cycle budget
    pub suggested_cycles: u32,
    #[serde(default)]
    pub source_mission_id: Option<String>,
    /// Capped at 500 chars on write
    #[serde(default)]
    pub source_mission_summary: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    pub created_at: String,
    pub source_type: SuggestionSource,
    #[serde(default = "default_priority_score")]
    pub priority_score: f64,
    pub health_status: HealthStatus,
    #[serde(default)]
    pub last_analyzed_at: Option<String>,
    #[serde(default)]
    pub last_edited_at: Option<String>,
    #[serde(default)]
    pub auto_tags: Vec<String>,
    #[serde(default)]
    pub merged_from: Option<Vec<String>>,
    #[serde(default)]
    pub merged_source_descriptions: Option<Vec<String>>,
    #[serde(default)]
    pub drift_context: Option<serde_json::Value>,
    #[serde(default)]
    pub original_mission_title: Option<String>,
    #[serde(default)]
    pub original_mission_description: Option<String>,
    #[serde(default)]
    pub original_rationale: Option<String>,
    #[serde(default)]
    pub original_suggested_cycles: Option<u32>,
}

fn default_priority_score() -> f64 {
    50.0
}

impl Suggestion {
    pub fn new(title: &str, description: &str, source_type: SuggestionSource) -> Self {
        Suggestion {
            id: short_id("rec"),
            mission_title: title.to_string(),
            mission_description: description.to_string(),
            suggested_cycles: 3,
            source_mission_id: None,
            source_mission_summary: None,
            rationale: None,
            created_at: now_iso(),
            source_type,
            priority_score: 50.0,
            health_status: HealthStatus::Healthy,
            last_analyzed_at: None,
            last_edited_at: None,
            auto_tags: Vec::new(),
            merged_from: None,
            merged_source_descriptions: None,
            drift_context: None,
            original_mission_title: None,
            original_mission_description: None,
            original_rationale: None,
            original_suggested_cycles: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_id_shape() {
        let s = Suggestion::new("t", "d", SuggestionSource::Manual);
        assert!(s.id.starts_with("rec_"));
        assert_eq!(s.priority_score, 50.0);
        assert_eq!(s.health_status, HealthStatus::Healthy);
    }

    #[test]
    fn test_source_type_roundtrip() {
        for st in [
            SuggestionSource::DriftHalt,
            SuggestionSource::SuccessfulCompletion,
            SuggestionSource::Merged,
            SuggestionSource::Manual,
        ] {
            assert_eq!(SuggestionSource::parse(st.as_str()), Some(st));
        }
    }
}
