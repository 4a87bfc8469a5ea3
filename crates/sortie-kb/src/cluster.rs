//! Agglomerative clustering with average linkage over cosine distance.
//!
//! No fixed cluster count: merging continues while the closest pair of
//! clusters is within the distance threshold. Corpora here are small
//! (hundreds of learnings), so the quadratic pairwise matrix is fine.

use crate::tfidf::{cosine, SparseVector};

/// Cluster label per input vector. Labels are dense 0..k.
pub fn agglomerative_cluster(vectors: &[SparseVector], distance_threshold: f64) -> Vec<usize> {
    let n = vectors.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![0];
    }

    // Pairwise cosine distance matrix
    let mut distance = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = 1.0 - cosine(&vectors[i], &vectors[j]);
            distance[i][j] = d;
            distance[j][i] = d;
        }
    }

    // Each item starts as its own cluster
    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for a in 0..clusters.len() {
            for b in (a + 1)..clusters.len() {
                let d = average_linkage(&clusters[a], &clusters[b], &distance);
                if best.map(|(_, _, bd)| d < bd).unwrap_or(true) {
                    best = Some((a, b, d));
                }
            }
        }

        match best {
            Some((a, b, d)) if d <= distance_threshold => {
                let merged = clusters.remove(b);
                clusters[a].extend(merged);
            }
            _ => break,
        }
    }

    let mut labels = vec![0usize; n];
    for (label, members) in clusters.iter().enumerate() {
        for &member in members {
            labels[member] = label;
        }
    }
    labels
}

fn average_linkage(a: &[usize], b: &[usize], distance: &[Vec<f64>]) -> f64 {
    let mut total = 0.0;
    for &i in a {
        for &j in b {
            total += distance[i][j];
        }
    }
    total / (a.len() * b.len()) as f64
}

/// Mean pairwise cosine similarity of a subset; single items are
/// perfectly coherent.
pub fn coherence(vectors: &[&SparseVector]) -> f64 {
    let n = vectors.len();
    if n < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            total += cosine(vectors[i], vectors[j]);
            count += 1;
        }
    }
    total / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tfidf::{TfIdfConfig, TfIdfVectorizer};

    fn vectors(texts: &[&str]) -> Vec<SparseVector> {
        let corpus: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
        let vectorizer = TfIdfVectorizer::fit(&corpus, TfIdfConfig::default());
        corpus.iter().map(|t| vectorizer.transform(t)).collect()
    }

    #[test]
    fn test_similar_texts_cluster_together() {
        let vs = vectors(&[
            "gpu kernel training optimization",
            "gpu training kernel throughput optimization",
            "csv parsing with streaming readers",
        ]);
        let labels = agglomerative_cluster(&vs, 0.7);
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn test_zero_threshold_keeps_everything_apart() {
        let vs = vectors(&["alpha one", "beta two", "gamma three"]);
        let labels = agglomerative_cluster(&vs, 0.0);
        let distinct: std::collections::HashSet<usize> = labels.iter().copied().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_huge_threshold_merges_everything() {
        let vs = vectors(&["alpha one", "beta two", "gamma three"]);
        let labels = agglomerative_cluster(&vs, 2.0);
        assert!(labels.iter().all(|&l| l == labels[0]));
    }

    #[test]
    fn test_coherence_bounds() {
        let vs = vectors(&["gpu kernel optimization", "gpu kernel optimization"]);
        let refs: Vec<&SparseVector> = vs.iter().collect();
        let c = coherence(&refs);
        assert!(c > 0.99);

        let single: Vec<&SparseVector> = vs.iter().take(1).collect();
        assert_eq!(coherence(&single), 1.0);
    }

    #[test]
    fn test_empty_input() {
        assert!(agglomerative_cluster(&[], 0.5).is_empty());
    }
}
