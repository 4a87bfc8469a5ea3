//! Problem-domain classification by weighted keyword scoring.
//!
//! Each domain carries a keyword list with weights (longer, more specific
//! keywords score higher). The highest-scoring domain wins; ties go to
//! the first listed, and no match at all yields "general".

use std::collections::HashMap;

type DomainLexicon = &'static [(&'static str, &'static [(&'static str, u32)])];

const DOMAINS: DomainLexicon = &[
    ("gpu_optimization", &[
        ("pytorch", 4), ("cuda", 4), ("tensorflow", 4), ("tensor", 3), ("gpu", 3),
        ("vram", 3), ("neural", 2), ("training", 2), ("model", 1), ("deep learning", 4),
        ("machine learning", 3), ("nvidia", 3), ("batch", 1), ("epoch", 2),
        ("gradient", 2), ("backprop", 3), ("inference", 2), ("acceleration", 2),
    ]),
    ("api_integration", &[
        ("api", 3), ("endpoint", 4), ("rest", 3), ("graphql", 4), ("http", 2),
        ("fetch", 2), ("request", 2), ("response", 2), ("webhook", 3), ("oauth", 3),
        ("jwt", 3), ("authentication", 2), ("authorization", 2), ("cors", 3),
        ("json", 1), ("xml", 2), ("websocket", 3), ("grpc", 4), ("openapi", 3),
        ("swagger", 3),
    ]),
    ("file_processing", &[
        ("csv", 3), ("json", 2), ("xml", 2), ("yaml", 3), ("parse", 2), ("io", 2),
        ("file", 1), ("read", 1), ("write", 1), ("stream", 2), ("buffer", 2),
        ("encoding", 2), ("utf-8", 2), ("binary", 2), ("serialization", 3),
        ("deserialization", 3), ("path", 1), ("directory", 1), ("filesystem", 3),
    ]),
    ("database", &[
        ("sqlite", 4), ("database", 3), ("sql", 3), ("query", 2), ("table", 2),
        ("record", 1), ("postgres", 4), ("mysql", 4), ("mongodb", 4), ("redis", 4),
        ("orm", 3), ("migration", 3), ("schema", 2), ("index", 2), ("transaction", 3),
        ("acid", 3), ("nosql", 3), ("crud", 2), ("join", 2), ("foreign key", 3),
    ]),
    ("ui_development", &[
        ("frontend", 4), ("dashboard", 3), ("ui", 2), ("interface", 2), ("display", 1),
        ("widget", 3), ("react", 4), ("vue", 4), ("angular", 4), ("html", 2),
        ("css", 2), ("javascript", 2), ("dom", 3), ("component", 2), ("render", 2),
        ("layout", 2), ("responsive", 2), ("canvas", 3), ("svg", 3), ("animation", 2),
        ("chart", 2), ("graph", 2), ("visualization", 3),
    ]),
    ("testing", &[
        ("unittest", 4), ("pytest", 4), ("test", 2), ("validation", 2), ("verify", 2),
        ("assert", 2), ("mock", 3), ("stub", 3), ("fixture", 3), ("coverage", 3),
        ("integration test", 4), ("e2e", 4), ("end-to-end", 4), ("selenium", 3),
        ("playwright", 4), ("ci/cd", 3), ("tdd", 4), ("bdd", 4), ("regression", 3),
        ("snapshot", 2), ("jest", 3), ("mocha", 3),
    ]),
    ("refactoring", &[
        ("refactor", 4), ("restructure", 3), ("clean", 2), ("improve", 1),
        ("optimize", 2), ("performance", 2), ("bottleneck", 3), ("profil", 3),
        ("memory", 2), ("cpu", 2), ("latency", 3), ("throughput", 3), ("cache", 2),
        ("efficient", 2), ("technical debt", 4), ("code smell", 4), ("solid", 3),
        ("dry", 3), ("kiss", 3), ("yagni", 3),
    ]),
    ("documentation", &[
        ("readme", 4), ("document", 2), ("docs", 2), ("comment", 1), ("explain", 1),
        ("markdown", 3), ("sphinx", 4), ("docstring", 3), ("api doc", 4),
        ("specification", 2), ("tutorial", 2), ("guide", 2), ("reference", 2),
        ("changelog", 3),
    ]),
    ("research", &[
        ("research", 4), ("investigate", 3), ("analyze", 2), ("study", 2),
        ("explore", 2), ("experiment", 3), ("hypothesis", 3), ("prototype", 3),
        ("poc", 3), ("proof of concept", 4), ("benchmark", 3), ("comparison", 2),
        ("evaluation", 2), ("spike", 3), ("discovery", 2),
    ]),
    ("orchestrator_improvement", &[
        ("orchestrator", 5), ("autonomous", 4), ("mission", 3), ("engine", 2),
        ("dashboard", 2), ("knowledge base", 4), ("learning", 2), ("extraction", 2),
        ("workflow", 2), ("stage", 2), ("cycle", 2), ("planning", 2), ("building", 2),
        ("testing", 1), ("continuity", 3), ("healing", 3),
    ]),
    ("devops", &[
        ("docker", 4), ("kubernetes", 4), ("k8s", 4), ("container", 3),
        ("deployment", 3), ("pipeline", 3), ("ci/cd", 3), ("jenkins", 3),
        ("github actions", 4), ("terraform", 4), ("ansible", 4), ("infrastructure", 3),
        ("monitoring", 2), ("logging", 2), ("metrics", 2), ("observability", 3),
        ("helm", 3),
    ]),
    ("security", &[
        ("security", 3), ("vulnerability", 4), ("exploit", 4), ("authentication", 3),
        ("authorization", 3), ("encryption", 3), ("hash", 2), ("ssl", 3), ("tls", 3),
        ("certificate", 3), ("xss", 4), ("csrf", 4), ("injection", 3), ("sanitize", 3),
        ("firewall", 3), ("penetration", 4), ("audit", 2),
    ]),
    ("cli_tools", &[
        ("cli", 4), ("command line", 4), ("terminal", 3), ("shell", 3), ("bash", 3),
        ("argparse", 3), ("subprocess", 2), ("stdin", 2), ("stdout", 2), ("pipe", 2),
    ]),
    ("async_concurrent", &[
        ("async", 4), ("await", 3), ("concurrent", 3), ("parallel", 3), ("thread", 3),
        ("multiprocess", 4), ("coroutine", 4), ("future", 3), ("promise", 3),
        ("race", 2), ("lock", 2), ("semaphore", 3), ("deadlock", 4),
    ]),
    ("data_science", &[
        ("pandas", 4), ("numpy", 4), ("scipy", 4), ("matplotlib", 4), ("seaborn", 3),
        ("jupyter", 3), ("notebook", 2), ("dataframe", 3), ("analysis", 2),
        ("statistics", 3), ("visualization", 2), ("plot", 2), ("chart", 2),
        ("regression", 3), ("correlation", 3),
    ]),
];

/// Highest-scoring domain for a problem statement, or "general".
pub fn infer_domain(problem_statement: &str) -> String {
    let lower = problem_statement.to_lowercase();

    let mut best: Option<(&str, u32)> = None;
    for (domain, keywords) in DOMAINS {
        let score: u32 = keywords
            .iter()
            .filter(|(keyword, _)| lower.contains(keyword))
            .map(|(_, weight)| weight)
            .sum();
        if score > 0 {
            // Strict comparison keeps ties on the first-listed domain
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((domain, score));
            }
        }
    }

    best.map(|(domain, _)| domain.to_string()).unwrap_or_else(|| "general".to_string())
}

const KEYWORD_STOP_WORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "have", "been", "will", "are",
    "was", "were",
];

/// Top-20 significant words of a text, most frequent first.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 3)
        .filter(|w| !KEYWORD_STOP_WORDS.contains(w))
    {
        *counts.entry(word.to_string()).or_default() += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(20).map(|(word, _)| word).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_domain() {
        assert_eq!(infer_domain("optimize CUDA training throughput"), "gpu_optimization");
    }

    #[test]
    fn test_database_domain() {
        assert_eq!(
            infer_domain("add a sqlite migration for the new schema"),
            "database"
        );
    }

    #[test]
    fn test_general_when_nothing_matches() {
        assert_eq!(infer_domain("zzz qqq"), "general");
    }

    #[test]
    fn test_classification_is_weight_based_not_order_based() {
        // "api" (3) alone loses to sqlite(4)+database(3)+schema(2)
        let domain = infer_domain("api to query the sqlite database schema");
        assert_eq!(domain, "database");
    }

    #[test]
    fn test_extract_keywords_ranked() {
        let keywords =
            extract_keywords("cache cache cache layer layer invalidation a the with");
        assert_eq!(keywords[0], "cache");
        assert_eq!(keywords[1], "layer");
        assert!(keywords.contains(&"invalidation".to_string()));
        assert!(!keywords.contains(&"with".to_string()));
    }
}
