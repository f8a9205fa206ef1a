use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationMetrics {
    pub hit_rate_at_k: f64,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub ndcg_at_k: f64,
    pub coverage: f64,
    pub users_evaluated: usize,
}

#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn calculate_hit_rate_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        let hit = recommended.iter().take(self.k).any(|item| relevant.contains(item));
        if hit {
            1.0
        } else {
            0.0
        }
    }

    pub fn calculate_precision_at_k(
        &self,
        recommended: &[usize],
        relevant: &HashSet<usize>,
    ) -> f64 {
        if recommended.is_empty() {
            return 0.0;
        }

        let relevant_recommended = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(item))
            .count();

        relevant_recommended as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn calculate_recall_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let relevant_recommended = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(item))
            .count();

        relevant_recommended as f64 / relevant.len() as f64
    }

    /// Binary-relevance NDCG.
    pub fn calculate_ndcg_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .filter(|(_, item)| relevant.contains(item))
            .map(|(i, _)| 1.0 / ((i + 2) as f64).log2())
            .sum();

        let ideal_hits = relevant.len().min(self.k);
        let idcg: f64 = (0..ideal_hits).map(|i| 1.0 / ((i + 2) as f64).log2()).sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    /// Share of the catalog that appears in at least one list.
    pub fn calculate_coverage(&self, all_recommended: &[Vec<usize>], catalog_size: usize) -> f64 {
        if catalog_size == 0 {
            return 0.0;
        }

        let covered: HashSet<usize> = all_recommended
            .iter()
            .flat_map(|list| list.iter().take(self.k).copied())
            .collect();

        covered.len() as f64 / catalog_size as f64
    }

    /// Averages per-user metrics over `(recommended, relevant)` pairs.
    pub fn calculate_all_metrics(
        &self,
        lists: &[(Vec<usize>, HashSet<usize>)],
        catalog_size: usize,
    ) -> RecommendationMetrics {
        if lists.is_empty() {
            return RecommendationMetrics::default();
        }

        let n = lists.len() as f64;
        let mean = |f: &dyn Fn(&[usize], &HashSet<usize>) -> f64| {
            lists.iter().map(|(rec, rel)| f(rec, rel)).sum::<f64>() / n
        };

        let recommended: Vec<Vec<usize>> = lists.iter().map(|(rec, _)| rec.clone()).collect();

        RecommendationMetrics {
            hit_rate_at_k: mean(&|rec, rel| self.calculate_hit_rate_at_k(rec, rel)),
            precision_at_k: mean(&|rec, rel| self.calculate_precision_at_k(rec, rel)),
            recall_at_k: mean(&|rec, rel| self.calculate_recall_at_k(rec, rel)),
            ndcg_at_k: mean(&|rec, rel| self.calculate_ndcg_at_k(rec, rel)),
            coverage: self.calculate_coverage(&recommended, catalog_size),
            users_evaluated: lists.len(),
        }
    }
}
