use serde::{Deserialize, Serialize};

use crate::util::now_iso;

/// Category of an extracted learning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningType {
    Technique,
    Insight,
    Gotcha,
    Template,
    Failure,
}

impl LearningType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningType::Technique => "technique",
            LearningType::Insight => "insight",
            LearningType::Gotcha => "gotcha",
            LearningType::Template => "template",
            LearningType::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<LearningType> {
        match value {
            "technique" => Some(LearningType::Technique),
            "insight" => Some(LearningType::Insight),
            "gotcha" => Some(LearningType::Gotcha),
            "template" => Some(LearningType::Template),
            "failure" => Some(LearningType::Failure),
            _ => None,
        }
    }
}

/// How the source work ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Outcome {
        match value {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            _ => Outcome::Partial,
        }
    }
}

/// Whether a learning came from a mission or an investigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningSourceType {
    Mission,
    Investigation,
}

impl LearningSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningSourceType::Mission => "mission",
            LearningSourceType::Investigation => "investigation",
        }
    }
}

/// A reusable finding extracted from a completed mission or investigation.
///
/// `learning_id` is a deterministic hash of the source coordinates, so
/// re-ingesting the same report produces the same id set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub learning_id: String,
    pub mission_id: String,
    pub learning_type: LearningType,
    pub title: String,
    pub description: String,
    pub problem_domain: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub relevance_keywords: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    pub timestamp: String,
    /// e.g. cycle_summary, achievement, issue, continuation, history
    pub lesson_source: String,
    #[serde(default = "default_source_type")]
    pub source_type: LearningSourceType,
    #[serde(default)]
    pub source_investigation_id: Option<String>,
    #[serde(default)]
    pub investigation_query: Option<String>,
}

fn default_source_type() -> LearningSourceType {
    LearningSourceType::Mission
}

impl Learning {
    /// Text used for indexing: title + description + domain.
    pub fn index_text(&self) -> String {
        format!("{} {} {}", self.title, self.description, self.problem_domain)
            .trim()
            .to_string()
    }
}

/// Per-mission summary row kept alongside the learnings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionDigest {
    pub mission_id: String,
    pub problem_statement: String,
    pub problem_domain: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub approach_taken: String,
    #[serde(default)]
    pub key_learnings: Vec<String>,
    #[serde(default)]
    pub failures_encountered: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub duration_minutes: f64,
    #[serde(default)]
    pub cycles_used: u32,
    #[serde(default = "now_iso")]
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learning_type_roundtrip() {
        for lt in [
            LearningType::Technique,
            LearningType::Insight,
            LearningType::Gotcha,
            LearningType::Template,
            LearningType::Failure,
        ] {
            assert_eq!(LearningType::parse(lt.as_str()), Some(lt));
        }
        assert_eq!(LearningType::parse("bogus"), None);
    }

    #[test]
    fn test_outcome_parse_defaults_partial() {
        assert_eq!(Outcome::parse("success"), Outcome::Success);
        assert_eq!(Outcome::parse("weird"), Outcome::Partial);
    }
}
