//! Decomposes a mission statement into parallelizable work units.
//!
//! Strategy AUTO picks by cues in the text: explicit task lists, heavy
//! file references, section keywords, compare/versus language, or a
//! phase pipeline for long prose.

use once_cell::sync::Lazy;
use regex::Regex;

use sortie_types::{stable_id, SplitStrategy, WorkUnit};

static TASK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)^\d+\.\s*(.+)$").unwrap(),
        Regex::new(r"(?i)^[-*]\s*(.+)$").unwrap(),
        Regex::new(r"(?i)^\s*Task\s*\d*:\s*(.+)$").unwrap(),
        Regex::new(r"(?i)^(?:First|Second|Third|Then|Next|Finally)[,:]?\s+(.+)$").unwrap(),
    ]
});

static FILE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"`([^`]+\.(?:rs|py|js|ts|tsx|jsx|md|json|yaml|yml|toml))`").unwrap(),
        Regex::new(r"\b([\w/]+\.(?:rs|py|js|ts|tsx|jsx))\b").unwrap(),
    ]
});

const SECTION_KEYWORDS: &[(&str, &[&str])] = &[
    ("frontend", &["frontend", "ui", "component", "react", "vue", "css", "html"]),
    ("backend", &["backend", "api", "server", "database", "endpoint", "rest"]),
    ("tests", &["test", "spec", "testing", "unit test", "integration"]),
    ("docs", &["documentation", "readme", "doc", "docs"]),
    ("infra", &["deploy", "ci", "cd", "docker", "kubernetes", "infrastructure"]),
];

const APPROACH_WORDS: &[&str] =
    &["compare", "alternative", "approach", "option", "versus", " vs "];

struct ApproachSpec {
    name: &'static str,
    description: &'static str,
    instructions: &'static str,
}

const APPROACHES: &[ApproachSpec] = &[
    ApproachSpec {
        name: "conservative",
        description: "Minimal changes, safest approach",
        instructions: "Use the most straightforward, minimal-change approach. Prioritize safety and backward compatibility.",
    },
    ApproachSpec {
        name: "optimized",
        description: "Performance-focused approach",
        instructions: "Focus on performance and efficiency. Use optimized algorithms and data structures.",
    },
    ApproachSpec {
        name: "modern",
        description: "Use latest patterns and practices",
        instructions: "Use modern patterns, latest best practices, and up-to-date libraries.",
    },
];

const PHASES: &[(&str, &str, &[&str])] = &[
    ("research", "Research and understand requirements", &[]),
    ("design", "Design the solution architecture", &["research"]),
    ("implement", "Implement the solution", &["design"]),
];

#[derive(Default)]
pub struct MissionSplitter;

impl MissionSplitter {
    pub fn new() -> Self {
        MissionSplitter
    }

    /// Split a mission into at most `max_units` work units.
    pub fn split(
        &self,
        mission: &str,
        strategy: SplitStrategy,
        max_units: usize,
    ) -> Vec<WorkUnit> {
        let max_units = max_units.max(1);
        let strategy = match strategy {
            SplitStrategy::Auto => self.detect_strategy(mission),
            explicit => explicit,
        };

        match strategy {
            SplitStrategy::TaskBased => self.split_by_tasks(mission, max_units),
            SplitStrategy::FileBased => self.split_by_files(mission, max_units),
            SplitStrategy::ApproachBased => self.split_by_approaches(mission, max_units),
            SplitStrategy::SectionBased => self.split_by_sections(mission, max_units),
            SplitStrategy::PhaseBased => self.split_by_phases(mission, max_units),
            SplitStrategy::Auto => vec![self.single_unit(mission)],
        }
    }

    fn detect_strategy(&self, mission: &str) -> SplitStrategy {
        if self.extract_tasks(mission).len() >= 2 {
            return SplitStrategy::TaskBased;
        }
        if self.extract_files(mission).len() >= 3 {
            return SplitStrategy::FileBased;
        }
        if self.detect_sections(mission).len() >= 2 {
            return SplitStrategy::SectionBased;
        }
        let lower = mission.to_lowercase();
        if APPROACH_WORDS.iter().any(|w| lower.contains(w)) {
            return SplitStrategy::ApproachBased;
        }
        if mission.split_whitespace().count() > 100 {
            return SplitStrategy::PhaseBased;
        }
        SplitStrategy::Auto
    }

    fn extract_tasks(&self, mission: &str) -> Vec<String> {
        let mut tasks = Vec::new();
        for line in mission.lines() {
            let line = line.trim();
            for pattern in TASK_PATTERNS.iter() {
                if let Some(captures) = pattern.captures(line) {
                    tasks.push(captures[1].trim().to_string());
                    break;
                }
            }
        }
        tasks
    }

    fn extract_files(&self, mission: &str) -> Vec<String> {
        let mut files = Vec::new();
        for pattern in FILE_PATTERNS.iter() {
            for captures in pattern.captures_iter(mission) {
                let file = captures[1].to_string();
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
        files
    }

    fn detect_sections(&self, mission: &str) -> Vec<&'static str> {
        let lower = mission.to_lowercase();
        SECTION_KEYWORDS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
            .map(|(section, _)| *section)
            .collect()
    }

    fn unit_id(seed: &str) -> String {
        format!("wu_{}", &stable_id(seed)[..8])
    }

    /// Round-robin items into at most `n` buckets.
    fn group_items(items: Vec<String>, n: usize) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = vec![Vec::new(); n.min(items.len()).max(1)];
        let len = groups.len();
        for (i, item) in items.into_iter().enumerate() {
            groups[i % len].push(item);
        }
        groups.retain(|g| !g.is_empty());
        groups
    }

    /// Monotone step function of word count, 1-10 scale.
    fn estimate_complexity(text: &str) -> u8 {
        match text.split_whitespace().count() {
            0..=19 => 2,
            20..=49 => 4,
            50..=99 => 6,
            100..=199 => 8,
            _ => 10,
        }
    }

    fn split_by_tasks(&self, mission: &str, max_units: usize) -> Vec<WorkUnit> {
        let tasks = self.extract_tasks(mission);
        if tasks.is_empty() {
            return vec![self.single_unit(mission)];
        }

        let groups = Self::group_items(tasks, max_units);
        let total = groups.len();
        groups
            .into_iter()
            .enumerate()
            .map(|(i, group)| {
                let description = group.join("; ");
                let mut unit = WorkUnit::new(
                    &Self::unit_id(&format!("task_{}_{}", i, description)),
                    &truncate(&description, 100),
                    &task_prompt(mission, &description, i, total),
                );
                unit.estimated_complexity = Self::estimate_complexity(&description);
                unit.strategy = SplitStrategy::TaskBased;
                unit.metadata = serde_json::json!({"task_index": i, "tasks": group});
                unit
            })
            .collect()
    }

    fn split_by_files(&self, mission: &str, max_units: usize) -> Vec<WorkUnit> {
        let files = self.extract_files(mission);
        if files.is_empty() {
            return vec![self.single_unit(mission)];
        }

        let groups = Self::group_items(files, max_units);
        let total = groups.len();
        groups
            .into_iter()
            .enumerate()
            .map(|(i, group)| {
                let files_str = group.join(", ");
                let mut unit = WorkUnit::new(
                    &Self::unit_id(&format!("files_{}_{}", i, files_str)),
                    &truncate(&format!("Modify: {}", files_str), 100),
                    &file_prompt(mission, &group, i, total),
                );
                unit.files = group.clone();
                unit.estimated_complexity = (group.len() as u8 * 2).min(10);
                unit.strategy = SplitStrategy::FileBased;
                unit.metadata = serde_json::json!({"file_index": i, "files": group});
                unit
            })
            .collect()
    }

    fn split_by_approaches(&self, mission: &str, max_units: usize) -> Vec<WorkUnit> {
        let approaches = &APPROACHES[..APPROACHES.len().min(max_units)];
        let total = approaches.len();
        approaches
            .iter()
            .enumerate()
            .map(|(i, approach)| {
                let mut unit = WorkUnit::new(
                    &Self::unit_id(&format!("approach_{}", approach.name)),
                    &format!("Approach: {} - {}", approach.name, approach.description),
                    &approach_prompt(mission, approach, i, total),
                );
                unit.estimated_complexity = 7;
                unit.strategy = SplitStrategy::ApproachBased;
                unit.metadata = serde_json::json!({"approach": approach.name});
                unit
            })
            .collect()
    }

    fn split_by_sections(&self, mission: &str, max_units: usize) -> Vec<WorkUnit> {
        let sections = self.detect_sections(mission);
        if sections.len() < 2 {
            return vec![self.single_unit(mission)];
        }

        let sections = &sections[..sections.len().min(max_units)];
        let total = sections.len();
        sections
            .iter()
            .enumerate()
            .map(|(i, section)| {
                let mut unit = WorkUnit::new(
                    &Self::unit_id(&format!("section_{}", section)),
                    &format!("{} implementation", capitalize(section)),
                    &section_prompt(mission, section, i, total),
                );
                unit.estimated_complexity = 6;
                unit.strategy = SplitStrategy::SectionBased;
                unit.metadata = serde_json::json!({"section": section});
                unit
            })
            .collect()
    }

    fn split_by_phases(&self, mission: &str, max_units: usize) -> Vec<WorkUnit> {
        let phases = &PHASES[..PHASES.len().min(max_units)];
        let total = phases.len();

        let mut phase_ids: Vec<(&str, String)> = Vec::new();
        let mut units = Vec::new();

        for (i, (name, description, dependencies)) in phases.iter().enumerate() {
            let id = Self::unit_id(&format!("phase_{}", name));
            phase_ids.push((name, id.clone()));

            let deps: Vec<String> = dependencies
                .iter()
                .filter_map(|dep| {
                    phase_ids.iter().find(|(n, _)| n == dep).map(|(_, id)| id.clone())
                })
                .collect();

            let mut unit = WorkUnit::new(
                &id,
                &format!("Phase: {}", description),
                &phase_prompt(mission, name, description, i, total),
            );
            unit.dependencies = deps;
            unit.estimated_complexity = 5;
            unit.strategy = SplitStrategy::PhaseBased;
            unit.metadata = serde_json::json!({"phase": name});
            units.push(unit);
        }

        units
    }

    fn single_unit(&self, mission: &str) -> WorkUnit {
        let mut unit = WorkUnit::new(
            &Self::unit_id(&truncate(mission, 100)),
            "Complete mission",
            &full_prompt(mission),
        );
        unit.estimated_complexity = Self::estimate_complexity(mission);
        unit.metadata = serde_json::json!({"full_mission": true});
        unit
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn task_prompt(mission: &str, task: &str, index: usize, total: usize) -> String {
    format!(
        "# Mission Context\n{mission}\n\n\
         # Your Specific Task\n\
         You are responsible for task {num} of {total}:\n**{task}**\n\n\
         Focus ONLY on this specific task. Do not implement other tasks.\n\n\
         # Instructions\n\
         1. Complete the task described above\n\
         2. Document what you did\n\
         3. Return results in the expected format\n\n\
         # Response Format\n\
         Return JSON with:\n\
         {{\n    \"status\": \"completed\" | \"failed\",\n    \"files_modified\": [],\n    \"files_created\": [],\n    \"summary\": \"What was accomplished\",\n    \"issues\": []\n}}\n",
        mission = mission,
        num = index + 1,
        total = total,
        task = task,
    )
}

fn file_prompt(mission: &str, files: &[String], index: usize, total: usize) -> String {
    let files_list: String = files.iter().map(|f| format!("- {}\n", f)).collect();
    format!(
        "# Mission Context\n{mission}\n\n\
         # Your Specific Files\n\
         You are responsible for file group {num} of {total}:\n{files_list}\n\
         Focus ONLY on these files. Do not modify other files.\n\n\
         # Instructions\n\
         1. Implement the required changes for your assigned files\n\
         2. Ensure changes are complete and tested\n\
         3. Document what you did\n\n\
         # Response Format\n\
         Return JSON with:\n\
         {{\n    \"status\": \"completed\" | \"failed\",\n    \"files_modified\": [],\n    \"files_created\": [],\n    \"summary\": \"What was accomplished\",\n    \"issues\": []\n}}\n",
        mission = mission,
        num = index + 1,
        total = total,
        files_list = files_list,
    )
}

fn approach_prompt(mission: &str, approach: &ApproachSpec, index: usize, total: usize) -> String {
    format!(
        "# Mission Context\n{mission}\n\n\
         # Your Approach: {name_upper}\n\
         You are testing approach {num} of {total}: **{description}**\n\n\
         {instructions}\n\n\
         # Instructions\n\
         1. Implement the solution using this approach\n\
         2. Document trade-offs and decisions\n\
         3. Note any concerns or limitations\n\n\
         # Response Format\n\
         Return JSON with:\n\
         {{\n    \"status\": \"completed\" | \"failed\",\n    \"approach\": \"{name}\",\n    \"files_modified\": [],\n    \"files_created\": [],\n    \"pros\": [],\n    \"cons\": [],\n    \"summary\": \"Description of the implementation\",\n    \"recommendation\": \"Should this approach be used? Why?\"\n}}\n",
        mission = mission,
        name_upper = approach.name.to_uppercase(),
        num = index + 1,
        total = total,
        description = approach.description,
        instructions = approach.instructions,
        name = approach.name,
    )
}

fn section_prompt(mission: &str, section: &str, index: usize, total: usize) -> String {
    format!(
        "# Mission Context\n{mission}\n\n\
         # Your Section: {section_upper}\n\
         You are responsible for the {section} portion of this mission (section {num} of {total}).\n\n\
         Focus ONLY on {section} concerns. Other sections will be handled by other agents.\n\n\
         # Instructions\n\
         1. Implement the {section} portion of the feature\n\
         2. Define clear interfaces for other sections to integrate with\n\
         3. Document your API/interface decisions\n\n\
         # Response Format\n\
         Return JSON with:\n\
         {{\n    \"status\": \"completed\" | \"failed\",\n    \"section\": \"{section}\",\n    \"files_modified\": [],\n    \"files_created\": [],\n    \"interfaces\": [],\n    \"dependencies\": [],\n    \"summary\": \"What was implemented\"\n}}\n",
        mission = mission,
        section_upper = section.to_uppercase(),
        section = section,
        num = index + 1,
        total = total,
    )
}

fn phase_prompt(
    mission: &str,
    name: &str,
    description: &str,
    index: usize,
    total: usize,
) -> String {
    format!(
        "# Mission Context\n{mission}\n\n\
         # Your Phase: {name_upper}\n\
         You are responsible for the {name} phase (phase {num} of {total}).\n\
         {description}\n\n\
         # Instructions\n\
         1. Complete the {name} phase\n\
         2. Produce artifacts for the next phase\n\
         3. Document decisions and rationale\n\n\
         # Response Format\n\
         Return JSON with:\n\
         {{\n    \"status\": \"completed\" | \"failed\",\n    \"phase\": \"{name}\",\n    \"artifacts\": [],\n    \"findings\": [],\n    \"next_steps\": [],\n    \"summary\": \"What was accomplished\"\n}}\n",
        mission = mission,
        name_upper = name.to_uppercase(),
        name = name,
        num = index + 1,
        total = total,
        description = description,
    )
}

fn full_prompt(mission: &str) -> String {
    format!(
        "# Mission\n{mission}\n\n\
         # Instructions\n\
         Complete the entire mission as described above.\n\n\
         # Response Format\n\
         Return JSON with:\n\
         {{\n    \"status\": \"completed\" | \"failed\",\n    \"files_modified\": [],\n    \"files_created\": [],\n    \"summary\": \"What was accomplished\",\n    \"issues\": []\n}}\n",
        mission = mission,
    )
}
