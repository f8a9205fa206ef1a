use crate::algorithms::TwoTowerModel;
use crate::error::{RecError, RecResult};
use crate::models::Recommendation;
use ndarray::Axis;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

pub const DEFAULT_SCORING_BATCH: usize = 512;

/// Full-catalog scorer. The user embedding is computed once and item
/// embeddings are produced in fixed-size chunks so only one chunk is alive at a time.
#[derive(Debug, Clone)]
pub struct TopKRetriever {
    batch_size: usize,
}

impl TopKRetriever {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Cosine score of `user` against every item, in item-index order.
    pub fn score_catalog(&self, model: &TwoTowerModel, user: usize) -> RecResult<Vec<f32>> {
        let user_embedding = model.user_embeddings(&[user])?;
        let user_row = user_embedding.index_axis(Axis(0), 0);
        let num_items = model.num_items();
        let mut scores = Vec::with_capacity(num_items);

        let all_items: Vec<usize> = (0..num_items).collect();
        for chunk in all_items.chunks(self.batch_size) {
            let item_embeddings = model.item_embeddings(chunk)?;
            let chunk_scores = item_embeddings.dot(&user_row);
            scores.extend(chunk_scores.iter().map(|s| s.clamp(-1.0, 1.0)));
        }

        if scores.len() != num_items {
            return Err(RecError::ShapeMismatch {
                expected: num_items.to_string(),
                actual: scores.len().to_string(),
            });
        }
        Ok(scores)
    }

    /// Top `k` items for `user` by descending score, skipping `exclude`.
    /// Equal scores keep ascending item order.
    pub fn recommend(
        &self,
        model: &TwoTowerModel,
        user: usize,
        exclude: &HashSet<usize>,
        k: usize,
    ) -> RecResult<Vec<Recommendation>> {
        let scores = self.score_catalog(model, user)?;

        let mut candidates: Vec<Recommendation> = scores
            .into_iter()
            .enumerate()
            .filter(|(item, _)| !exclude.contains(item))
            .map(|(item, score)| Recommendation { item, score })
            .collect();

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        candidates.truncate(k);

        debug!(user, k, returned = candidates.len(), "scored catalog");
        Ok(candidates)
    }
}

impl Default for TopKRetriever {
    fn default() -> Self {
        Self::new(DEFAULT_SCORING_BATCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::models::GenreFeatures;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(num_items: usize) -> TwoTowerModel {
        TwoTowerModel::new(
            &ModelConfig::default(),
            2,
            num_items,
            GenreFeatures::empty(0),
            &mut StdRng::seed_from_u64(21),
        )
        .unwrap()
    }

    #[test]
    fn test_chunked_scores_match_single_pass() {
        let model = model(37);
        let chunked = TopKRetriever::new(5).score_catalog(&model, 1).unwrap();
        let whole = TopKRetriever::new(1000).score_catalog(&model, 1).unwrap();
        assert_eq!(chunked.len(), 37);
        for (a, b) in chunked.iter().zip(&whole) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_three_item_catalog_excludes_rated_item() {
        let model = model(3);
        let exclude: HashSet<usize> = [2].into_iter().collect();
        let recs = TopKRetriever::new(2).recommend(&model, 0, &exclude, 10).unwrap();
        assert!(recs.len() <= 2);
        assert!(recs.iter().all(|r| r.item != 2));
    }

    #[test]
    fn test_sorted_and_bounded() {
        let model = model(50);
        let exclude: HashSet<usize> = (0..45).collect();
        let recs = TopKRetriever::default().recommend(&model, 1, &exclude, 10).unwrap();
        assert_eq!(recs.len(), 5);
        assert!(recs.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_unknown_user_is_invalid_index() {
        let model = model(3);
        let err = TopKRetriever::default().recommend(&model, 5, &HashSet::new(), 3).unwrap_err();
        assert!(matches!(err, RecError::InvalidIndex { .. }));
    }
}
