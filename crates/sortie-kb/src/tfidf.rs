//! TF-IDF vectorization over learning text.
//!
//! Unigrams + bigrams, English stopwords, sublinear TF, smoothed IDF and
//! L2 normalization so cosine similarity reduces to a sparse dot product.
//! Document-frequency bounds and a vocabulary cap keep the index small.

use std::collections::HashMap;

pub const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between",
    "both", "but", "by", "can", "did", "do", "does", "doing", "down", "during", "each",
    "few", "for", "from", "further", "had", "has", "have", "having", "he", "her", "here",
    "hers", "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself",
    "just", "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off",
    "on", "once", "only", "or", "other", "our", "ours", "out", "over", "own", "same",
    "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs",
    "them", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "you", "your", "yours",
];

/// Sparse vector: (term index, weight) pairs sorted by index
pub type SparseVector = Vec<(usize, f64)>;

#[derive(Debug, Clone)]
pub struct TfIdfConfig {
    pub min_df: usize,
    pub max_df_ratio: f64,
    pub max_features: usize,
    pub sublinear_tf: bool,
    pub ngram_max: usize,
}

impl Default for TfIdfConfig {
    fn default() -> Self {
        TfIdfConfig {
            min_df: 1,
            max_df_ratio: 0.95,
            max_features: 5000,
            sublinear_tf: true,
            ngram_max: 2,
        }
    }
}

/// Lowercase word tokens of length >= 2, stopwords removed
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|token| token.len() >= 2)
        .filter(|token| !ENGLISH_STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Unigrams plus joined n-grams up to `ngram_max`
fn terms_of(text: &str, ngram_max: usize) -> Vec<String> {
    let tokens = tokenize(text);
    let mut terms = tokens.clone();
    for n in 2..=ngram_max {
        for window in tokens.windows(n) {
            terms.push(window.join(" "));
        }
    }
    terms
}

#[derive(Debug, Clone)]
pub struct TfIdfVectorizer {
    config: TfIdfConfig,
    vocabulary: HashMap<String, usize>,
    feature_names: Vec<String>,
    idf: Vec<f64>,
}

impl TfIdfVectorizer {
    /// Learn vocabulary and IDF weights from the corpus.
    pub fn fit(documents: &[String], config: TfIdfConfig) -> Self {
        let n_docs = documents.len();
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        let mut corpus_frequency: HashMap<String, usize> = HashMap::new();

        for document in documents {
            let terms = terms_of(document, config.ngram_max);
            let mut seen = std::collections::HashSet::new();
            for term in terms {
                *corpus_frequency.entry(term.clone()).or_default() += 1;
                if seen.insert(term.clone()) {
                    *document_frequency.entry(term).or_default() += 1;
                }
            }
        }

        let max_df = ((n_docs as f64) * config.max_df_ratio).floor() as usize;
        let mut candidates: Vec<(String, usize)> = document_frequency
            .iter()
            .filter(|(_, &df)| df >= config.min_df && (n_docs <= 1 || df <= max_df.max(1)))
            .map(|(term, _)| (term.clone(), corpus_frequency[term]))
            .collect();

        // Vocabulary cap: keep the most frequent terms, ties by term for
        // a deterministic vocabulary
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        candidates.truncate(config.max_features);
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut vocabulary = HashMap::with_capacity(candidates.len());
        let mut feature_names = Vec::with_capacity(candidates.len());
        let mut idf = Vec::with_capacity(candidates.len());

        for (i, (term, _)) in candidates.into_iter().enumerate() {
            let df = document_frequency[&term] as f64;
            // Smoothed IDF, never zero
            idf.push(((1.0 + n_docs as f64) / (1.0 + df)).ln() + 1.0);
            feature_names.push(term.clone());
            vocabulary.insert(term, i);
        }

        TfIdfVectorizer { config, vocabulary, feature_names, idf }
    }

    /// Transform a text with the fitted vocabulary; unknown terms drop out.
    pub fn transform(&self, text: &str) -> SparseVector {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for term in terms_of(text, self.config.ngram_max) {
            if let Some(&index) = self.vocabulary.get(&term) {
                *counts.entry(index).or_default() += 1.0;
            }
        }

        let mut vector: SparseVector = counts
            .into_iter()
            .map(|(index, tf)| {
                let tf = if self.config.sublinear_tf { 1.0 + tf.ln() } else { tf };
                (index, tf * self.idf[index])
            })
            .collect();
        vector.sort_by_key(|(index, _)| *index);

        l2_normalize(&mut vector);
        vector
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn feature_name(&self, index: usize) -> Option<&str> {
        self.feature_names.get(index).map(String::as_str)
    }
}

fn l2_normalize(vector: &mut SparseVector) {
    let norm: f64 = vector.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for (_, weight) in vector.iter_mut() {
            *weight /= norm;
        }
    }
}

/// Cosine similarity of two L2-normalized sparse vectors (their dot
/// product, merged over sorted indices).
pub fn cosine(a: &SparseVector, b: &SparseVector) -> f64 {
    let mut dot = 0.0;
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    dot.clamp(-1.0, 1.0)
}

/// Cosine similarity over dense embedding vectors.
pub fn dense_cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}
