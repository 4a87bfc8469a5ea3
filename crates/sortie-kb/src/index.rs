//! Hybrid semantic index over learning text.
//!
//! Two representations per row: a TF-IDF sparse vector and an optional
//! dense embedding from an externally supplied function. Queries score
//! 0.7 sparse + 0.2 dense + 0.1 recency. New rows queue as pending
//! additions transformed with the current vocabulary; once pending grows
//! past 20% of the indexed corpus the whole index refits.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use sortie_types::days_old;

use crate::cluster;
use crate::tfidf::{cosine, dense_cosine, SparseVector, TfIdfConfig, TfIdfVectorizer};

/// Opaque embedding capability supplied by the host.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Hybrid score weights
const TFIDF_WEIGHT: f64 = 0.7;
const EMBEDDING_WEIGHT: f64 = 0.2;
const RECENCY_WEIGHT: f64 = 0.1;
/// Recency bonus decays linearly to zero over this many days
const RECENCY_HORIZON_DAYS: f64 = 90.0;
/// Pending/indexed ratio that triggers a full rebuild
const REBUILD_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScoreBreakdown {
    pub tfidf: f64,
    pub embedding: f64,
    pub recency: f64,
}

/// One row fed to the index
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub id: String,
    pub text: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub learning_ids: Vec<String>,
    pub similarity: f64,
    pub representative: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubCluster {
    pub sub_cluster_id: usize,
    pub theme: String,
    pub coherence: f64,
    pub learning_ids: Vec<String>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterNode {
    pub cluster_id: usize,
    pub theme: String,
    pub coherence: f64,
    pub size: usize,
    pub sub_clusters: Vec<SubCluster>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchicalClusters {
    pub clusters: Vec<ClusterNode>,
    pub total_learnings: usize,
}

pub struct SemanticIndex {
    vectorizer: Option<TfIdfVectorizer>,
    ids: Vec<String>,
    texts: Vec<String>,
    timestamps: Vec<String>,
    vectors: Vec<SparseVector>,
    dense: Vec<Option<Vec<f32>>>,
    embedder: Option<Arc<dyn Embedder>>,
    pending: Vec<IndexRow>,
    cluster_cache: Option<(u64, Vec<usize>)>,
    hierarchical_cache: BTreeMap<String, HierarchicalClusters>,
}

impl SemanticIndex {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        SemanticIndex {
            vectorizer: None,
            ids: Vec::new(),
            texts: Vec::new(),
            timestamps: Vec::new(),
            vectors: Vec::new(),
            dense: Vec::new(),
            embedder,
            pending: Vec::new(),
            cluster_cache: None,
            hierarchical_cache: BTreeMap::new(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.vectorizer.is_some()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id) || self.pending.iter().any(|row| row.id == id)
    }

    /// Full rebuild over a fresh row set; pending additions are dropped
    /// since callers pass the complete corpus.
    pub fn fit(&mut self, rows: Vec<IndexRow>) {
        self.pending.clear();
        self.invalidate_caches();

        if rows.is_empty() {
            self.vectorizer = None;
            self.ids.clear();
            self.texts.clear();
            self.timestamps.clear();
            self.vectors.clear();
            self.dense.clear();
            return;
        }

        self.ids = rows.iter().map(|r| r.id.clone()).collect();
        self.texts = rows.iter().map(|r| r.text.clone()).collect();
        self.timestamps = rows.iter().map(|r| r.timestamp.clone()).collect();

        let vectorizer = TfIdfVectorizer::fit(&self.texts, TfIdfConfig::default());
        self.vectors = self.texts.iter().map(|t| vectorizer.transform(t)).collect();
        self.dense = self
            .texts
            .iter()
            .map(|t| self.embedder.as_ref().map(|e| e.embed(t)))
            .collect();
        self.vectorizer = Some(vectorizer);

        tracing::info!(rows = self.ids.len(),
            vocabulary = self.vectorizer.as_ref().map(|v| v.vocabulary_len()).unwrap_or(0),
            "semantic index fitted");
    }

    /// Queue a new row. If fitted, it is transformed with the current
    /// vocabulary on the next query; too many pending rows force a full
    /// refit over everything seen so far.
    pub fn add_incremental(&mut self, id: &str, text: &str, timestamp: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        self.pending.push(IndexRow {
            id: id.to_string(),
            text: text.to_string(),
            timestamp: timestamp.to_string(),
        });
        self.invalidate_caches();

        if self.is_fitted()
            && !self.ids.is_empty()
            && self.pending.len() as f64 / self.ids.len() as f64 > REBUILD_THRESHOLD
        {
            tracing::info!(pending = self.pending.len(), "rebuild threshold crossed");
            self.rebuild_with_pending();
        }
        true
    }

    fn rebuild_with_pending(&mut self) {
        let mut rows: Vec<IndexRow> = self
            .ids
            .iter()
            .zip(self.texts.iter())
            .zip(self.timestamps.iter())
            .map(|((id, text), timestamp)| IndexRow {
                id: id.clone(),
                text: text.clone(),
                timestamp: timestamp.clone(),
            })
            .collect();
        rows.append(&mut self.pending);
        self.fit(rows);
    }

    /// Apply pending additions with the existing vocabulary (no refit).
    fn apply_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if !self.is_fitted() {
            self.rebuild_with_pending();
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        // Fit state was checked above; clone keeps the borrow checker happy
        // while rows are appended
        let vectorizer = self.vectorizer.clone();
        if let Some(vectorizer) = vectorizer {
            for row in pending {
                self.vectors.push(vectorizer.transform(&row.text));
                self.dense.push(self.embedder.as_ref().map(|e| e.embed(&row.text)));
                self.ids.push(row.id);
                self.texts.push(row.text);
                self.timestamps.push(row.timestamp);
            }
        }
    }

    fn ensure_up_to_date(&mut self) {
        self.apply_pending();
    }

    fn invalidate_caches(&mut self) {
        self.cluster_cache = None;
        self.hierarchical_cache.clear();
    }

    fn recency_bonus(timestamp: &str) -> f64 {
        match days_old(timestamp) {
            Some(days) if days >= 0 => {
                (1.0 - days as f64 / RECENCY_HORIZON_DAYS).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    /// Top-k rows by hybrid score with per-component breakdown. Rows with
    /// no term or embedding overlap at all are omitted.
    pub fn query(&mut self, text: &str, top_k: usize) -> Vec<(String, f64, ScoreBreakdown)> {
        self.ensure_up_to_date();
        let Some(vectorizer) = &self.vectorizer else { return Vec::new() };
        if self.ids.is_empty() {
            return Vec::new();
        }

        let query_sparse = vectorizer.transform(text);
        let query_dense = self.embedder.as_ref().map(|e| e.embed(text));

        let mut scored: Vec<(String, f64, ScoreBreakdown)> = Vec::new();
        for i in 0..self.ids.len() {
            let tfidf = cosine(&query_sparse, &self.vectors[i]);
            let embedding = match (&query_dense, &self.dense[i]) {
                (Some(q), Some(d)) => dense_cosine(q, d),
                _ => 0.0,
            };
            if tfidf <= 0.0 && embedding <= 0.0 {
                continue;
            }
            let recency = Self::recency_bonus(&self.timestamps[i]);
            let hybrid = TFIDF_WEIGHT * tfidf
                + EMBEDDING_WEIGHT * embedding
                + RECENCY_WEIGHT * recency;
            scored.push((
                self.ids[i].clone(),
                hybrid,
                ScoreBreakdown { tfidf, embedding, recency },
            ));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    /// Groups of near-duplicates: connected components over pairwise
    /// TF-IDF similarity >= threshold. The representative is the member
    /// with the longest text.
    pub fn find_duplicates(&mut self, threshold: f64) -> Vec<DuplicateGroup> {
        self.ensure_up_to_date();
        let n = self.ids.len();
        if n < 2 {
            return Vec::new();
        }

        // Union-find over similar pairs
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            let up = parent[i];
            if up == i {
                return i;
            }
            let root = find(parent, up);
            parent[i] = root;
            root
        }

        let mut similarity = vec![vec![0.0f64; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = cosine(&self.vectors[i], &self.vectors[j]);
                similarity[i][j] = s;
                similarity[j][i] = s;
                if s >= threshold {
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    if ri != rj {
                        parent[ri] = rj;
                    }
                }
            }
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            components.entry(root).or_default().push(i);
        }

        let mut groups = Vec::new();
        for members in components.into_values().filter(|m| m.len() > 1) {
            let mut total = 0.0;
            let mut count = 0usize;
            for (a, &i) in members.iter().enumerate() {
                for &j in members.iter().skip(a + 1) {
                    total += similarity[i][j];
                    count += 1;
                }
            }
            let representative = members
                .iter()
                .copied()
                .max_by_key(|&i| self.texts[i].len())
                .unwrap_or(members[0]);

            groups.push(DuplicateGroup {
                learning_ids: members.iter().map(|&i| self.ids[i].clone()).collect(),
                similarity: if count > 0 {
                    (total / count as f64 * 1000.0).round() / 1000.0
                } else {
                    threshold
                },
                representative: self.ids[representative].clone(),
                count: members.len(),
            });
        }

        groups.sort_by(|a, b| b.count.cmp(&a.count));
        groups
    }

    /// Flat clustering at a distance threshold; cached until the index
    /// changes.
    pub fn get_clusters(&mut self, distance_threshold: f64) -> BTreeMap<usize, Vec<String>> {
        self.ensure_up_to_date();
        if self.ids.len() < 2 {
            let mut single = BTreeMap::new();
            if self.ids.len() == 1 {
                single.insert(0, vec![self.ids[0].clone()]);
            }
            return single;
        }

        let cache_key = (distance_threshold * 1000.0) as u64;
        if let Some((key, labels)) = &self.cluster_cache {
            if *key == cache_key {
                return Self::labels_to_map(&self.ids, labels);
            }
        }

        let labels = cluster::agglomerative_cluster(&self.vectors, distance_threshold);
        let map = Self::labels_to_map(&self.ids, &labels);
        self.cluster_cache = Some((cache_key, labels));
        map
    }

    fn labels_to_map(ids: &[String], labels: &[usize]) -> BTreeMap<usize, Vec<String>> {
        let mut map: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (id, &label) in ids.iter().zip(labels.iter()) {
            map.entry(label).or_default().push(id.clone());
        }
        map
    }

    /// Mean pairwise similarity of a subset of rows.
    pub fn coherence(&mut self, learning_ids: &[String]) -> f64 {
        self.ensure_up_to_date();
        let vectors: Vec<&SparseVector> = learning_ids
            .iter()
            .filter_map(|id| self.index_of(id))
            .map(|i| &self.vectors[i])
            .collect();
        cluster::coherence(&vectors)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|i| i == id)
    }

    /// Top TF-IDF terms across a subset, used for cluster theme labels.
    pub fn top_terms(&mut self, learning_ids: &[String], top_n: usize) -> Vec<String> {
        self.ensure_up_to_date();
        let Some(vectorizer) = &self.vectorizer else { return Vec::new() };

        let indices: Vec<usize> =
            learning_ids.iter().filter_map(|id| self.index_of(id)).collect();
        if indices.is_empty() {
            return Vec::new();
        }

        let mut weights: BTreeMap<usize, f64> = BTreeMap::new();
        for &i in &indices {
            for &(term, weight) in &self.vectors[i] {
                *weights.entry(term).or_default() += weight;
            }
        }

        let mut ranked: Vec<(usize, f64)> = weights.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .take(top_n)
            .filter_map(|(term, _)| vectorizer.feature_name(term).map(str::to_string))
            .collect()
    }

    /// Rows similar to a given row, for learning chains.
    pub fn related(
        &mut self,
        learning_id: &str,
        threshold: f64,
        max_results: usize,
    ) -> Vec<(String, f64)> {
        self.ensure_up_to_date();
        let Some(index) = self.index_of(learning_id) else { return Vec::new() };

        let mut related: Vec<(String, f64)> = (0..self.ids.len())
            .filter(|&i| i != index)
            .map(|i| (self.ids[i].clone(), cosine(&self.vectors[index], &self.vectors[i])))
            .filter(|(_, similarity)| *similarity >= threshold)
            .collect();

        related.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        related.truncate(max_results);
        related
    }

    /// Two-level clustering: broad themes at `top_threshold`, sub-themes
    /// at `sub_threshold` for clusters of at least four rows.
    pub fn hierarchical_clusters(
        &mut self,
        top_threshold: f64,
        sub_threshold: f64,
    ) -> HierarchicalClusters {
        self.ensure_up_to_date();
        let cache_key = format!("{:.3}_{:.3}", top_threshold, sub_threshold);
        if let Some(cached) = self.hierarchical_cache.get(&cache_key) {
            return cached.clone();
        }

        if self.ids.len() < 2 {
            let result =
                HierarchicalClusters { clusters: Vec::new(), total_learnings: self.ids.len() };
            self.hierarchical_cache.insert(cache_key, result.clone());
            return result;
        }

        let top_labels = cluster::agglomerative_cluster(&self.vectors, top_threshold);
        let top_map = Self::labels_to_map(&self.ids, &top_labels);

        let mut nodes = Vec::new();
        for (cluster_id, member_ids) in top_map {
            let theme = self.theme_label(&member_ids, 3, "General");
            let coherence = self.coherence(&member_ids);

            let sub_clusters = if member_ids.len() >= 4 {
                let member_indices: Vec<usize> =
                    member_ids.iter().filter_map(|id| self.index_of(id)).collect();
                let subset: Vec<SparseVector> =
                    member_indices.iter().map(|&i| self.vectors[i].clone()).collect();
                let sub_labels = cluster::agglomerative_cluster(&subset, sub_threshold);

                let mut sub_map: BTreeMap<usize, Vec<String>> = BTreeMap::new();
                for (local, &label) in sub_labels.iter().enumerate() {
                    sub_map.entry(label).or_default().push(member_ids[local].clone());
                }

                let mut subs: Vec<SubCluster> = sub_map
                    .into_iter()
                    .map(|(sub_id, ids)| SubCluster {
                        sub_cluster_id: sub_id,
                        theme: self.theme_label(&ids, 2, "Misc"),
                        coherence: round3(self.coherence(&ids)),
                        size: ids.len(),
                        learning_ids: ids,
                    })
                    .collect();
                subs.sort_by(|a, b| b.size.cmp(&a.size));
                subs
            } else {
                vec![SubCluster {
                    sub_cluster_id: 0,
                    theme: theme.clone(),
                    coherence: round3(coherence),
                    size: member_ids.len(),
                    learning_ids: member_ids.clone(),
                }]
            };

            nodes.push(ClusterNode {
                cluster_id,
                theme,
                coherence: round3(coherence),
                size: member_ids.len(),
                sub_clusters,
            });
        }

        nodes.sort_by(|a, b| b.size.cmp(&a.size));
        let result =
            HierarchicalClusters { clusters: nodes, total_learnings: self.ids.len() };
        self.hierarchical_cache.insert(cache_key, result.clone());
        result
    }

    fn theme_label(&mut self, ids: &[String], top_n: usize, fallback: &str) -> String {
        let terms = self.top_terms(ids, top_n);
        if terms.is_empty() {
            fallback.to_string()
        } else {
            terms
                .iter()
                .map(|t| title_case(&t.replace('_', " ")))
                .collect::<Vec<_>>()
                .join(", ")
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_types::now_iso;

    fn row(id: &str, text: &str) -> IndexRow {
        IndexRow { id: id.to_string(), text: text.to_string(), timestamp: now_iso() }
    }

    fn fitted() -> SemanticIndex {
        let mut index = SemanticIndex::new(None);
        index.fit(vec![
            row("l1", "gpu kernel training optimization throughput"),
            row("l2", "database sqlite schema migration"),
            row("l3", "csv streaming parser for file processing"),
        ]);
        index
    }

    #[test]
    fn test_query_ranks_by_similarity() {
        let mut index = fitted();
        let results = index.query("optimize gpu training kernels", 3);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "l1");
        assert!(results[0].2.tfidf > 0.0);
    }

    #[test]
    fn test_incremental_add_is_queryable() {
        let mut index = fitted();
        assert!(index.add_incremental("l4", "database connection pooling", &now_iso()));
        // Re-adding the same id is a no-op
        assert!(!index.add_incremental("l4", "whatever", &now_iso()));

        let results = index.query("database pooling", 5);
        assert!(results.iter().any(|(id, _, _)| id == "l4"));
    }

    #[test]
    fn test_rebuild_threshold_triggers_refit() {
        let mut index = SemanticIndex::new(None);
        index.fit(vec![row("a", "alpha one"), row("b", "beta two")]);

        // One pending over two indexed crosses the 20% ratio immediately
        index.add_incremental("c", "gamma three", &now_iso());
        assert_eq!(index.pending_count(), 0);
        assert_eq!(index.len(), 3);
        // After the refit, brand-new vocabulary is searchable
        assert!(index.query("gamma", 1).iter().any(|(id, _, _)| id == "c"));
    }

    #[test]
    fn test_duplicates_grouped_with_longest_representative() {
        let mut index = SemanticIndex::new(None);
        index.fit(vec![
            row("short", "retry transient sqlite lock errors"),
            row("long", "retry transient sqlite lock errors with backoff"),
            row("other", "render dashboard charts"),
        ]);

        let groups = index.find_duplicates(0.6);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].representative, "long");
    }

    #[test]
    fn test_clusters_cached_until_invalidated() {
        let mut index = fitted();
        let first = index.get_clusters(0.8);
        let second = index.get_clusters(0.8);
        assert_eq!(first, second);

        index.add_incremental("l9", "totally new content about webhooks", &now_iso());
        let third = index.get_clusters(0.8);
        assert!(third.values().flatten().any(|id| id == "l9"));
    }

    #[test]
    fn test_coherence_of_identical_rows() {
        let mut index = SemanticIndex::new(None);
        index.fit(vec![row("a", "same exact text"), row("b", "same exact text")]);
        let c = index.coherence(&["a".to_string(), "b".to_string()]);
        assert!(c > 0.99);
    }

    #[test]
    fn test_hierarchical_small_clusters_not_subclustered() {
        let mut index = fitted();
        let hier = index.hierarchical_clusters(0.9, 0.6);
        assert_eq!(hier.total_learnings, 3);
        for node in &hier.clusters {
            if node.size < 4 {
                assert_eq!(node.sub_clusters.len(), 1);
            }
        }
    }

    struct FakeEmbedder;
    impl Embedder for FakeEmbedder {
        fn embed(&self, text: &str) -> Vec<f32> {
            // Two dimensions: gpu-ness and db-ness
            let lower = text.to_lowercase();
            vec![
                if lower.contains("gpu") { 1.0 } else { 0.0 },
                if lower.contains("database") { 1.0 } else { 0.0 },
            ]
        }
    }

    #[test]
    fn test_embedding_component_in_breakdown() {
        let mut index = SemanticIndex::new(Some(Arc::new(FakeEmbedder)));
        index.fit(vec![
            row("gpu", "gpu work"),
            row("db", "database work"),
        ]);

        let results = index.query("gpu", 2);
        let top = &results[0];
        assert_eq!(top.0, "gpu");
        assert!(top.2.embedding > 0.9);
    }

    #[test]
    fn test_freshness_after_incremental_add() {
        // A term shared with the query must surface the new row
        let mut index = fitted();
        index.add_incremental("fresh", "kubernetes helm deployment", &now_iso());
        let results = index.query("kubernetes rollout", 10);
        assert!(results.iter().any(|(id, _, _)| id == "fresh"));
    }
}
