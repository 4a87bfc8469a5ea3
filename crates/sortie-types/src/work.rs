use serde::{Deserialize, Serialize};

/// How a mission was decomposed into work units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    TaskBased,
    FileBased,
    ApproachBased,
    SectionBased,
    PhaseBased,
    Auto,
}

impl Default for SplitStrategy {
    fn default() -> Self {
        SplitStrategy::Auto
    }
}

/// An independent sub-task suitable for a single LLM worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 1-10 scale; affects timeout weighting
    #[serde(default = "default_complexity")]
    pub estimated_complexity: u8,
    /// Expected output files
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub strategy: SplitStrategy,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_complexity() -> u8 {
    5
}

impl WorkUnit {
    pub fn new(id: &str, description: &str, prompt: &str) -> Self {
        WorkUnit {
            id: id.to_string(),
            description: description.to_string(),
            prompt: prompt.to_string(),
            dependencies: Vec::new(),
            estimated_complexity: 5,
            files: Vec::new(),
            strategy: SplitStrategy::Auto,
            metadata: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_unit_defaults() {
        let wu: WorkUnit =
            serde_json::from_str(r#"{"id":"wu_1","description":"d","prompt":"p"}"#).unwrap();
        assert_eq!(wu.estimated_complexity, 5);
        assert_eq!(wu.strategy, SplitStrategy::Auto);
        assert!(wu.dependencies.is_empty());
    }
}
