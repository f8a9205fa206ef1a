//! User and item towers.
//!
//! A tower maps entity indices to unit-norm embeddings read from the
//! [`EmbeddingStore`]. Each forward pass returns the activations its backward
//! pass needs, so gradients can be computed without an autodiff runtime.

use crate::algorithms::embedding::{EmbeddingStore, Gradients, Mlp, Side, ITEM_GENRE_PROJECTION};
use crate::error::{RecError, RecResult};
use crate::models::GenreFeatures;
use crate::utils::{l2_normalize_rows, l2_normalize_rows_backward, relu};
use ndarray::{concatenate, s, Array2, Axis};
use std::fmt;
use std::sync::Arc;

pub trait Tower: Send + Sync + fmt::Debug {
    fn side(&self) -> Side;

    fn kind(&self) -> &'static str;

    /// Embeds `indices`, returning rows with unit L2 norm (zero rows stay zero).
    fn forward(&self, store: &EmbeddingStore, indices: &[usize]) -> RecResult<TowerOutput>;

    /// Accumulates parameter gradients given `d loss / d embeddings`.
    fn backward(
        &self,
        store: &EmbeddingStore,
        output: &TowerOutput,
        grad_embeddings: &Array2<f32>,
        grads: &mut Gradients,
    ) -> RecResult<()>;
}

#[derive(Debug, Clone)]
pub struct TowerOutput {
    pub indices: Vec<usize>,
    pub embeddings: Array2<f32>,
    cache: TowerCache,
}

#[derive(Debug, Clone)]
enum TowerCache {
    Lookup {
        raw: Array2<f32>,
    },
    Mlp {
        input: Array2<f32>,
        genres: Option<Array2<f32>>,
        hidden_pre: Array2<f32>,
        hidden: Array2<f32>,
        output_pre: Array2<f32>,
    },
}

fn check_grad_shape(output: &TowerOutput, grad: &Array2<f32>) -> RecResult<()> {
    if grad.dim() != output.embeddings.dim() {
        return Err(RecError::ShapeMismatch {
            expected: format!("{:?}", output.embeddings.dim()),
            actual: format!("{:?}", grad.dim()),
        });
    }
    Ok(())
}

/// Plain row lookup followed by normalization.
#[derive(Debug, Clone)]
pub struct LookupTower {
    side: Side,
}

impl LookupTower {
    pub fn new(side: Side) -> Self {
        Self { side }
    }
}

impl Tower for LookupTower {
    fn side(&self) -> Side {
        self.side
    }

    fn kind(&self) -> &'static str {
        "lookup"
    }

    fn forward(&self, store: &EmbeddingStore, indices: &[usize]) -> RecResult<TowerOutput> {
        let raw = store.gather(self.side, indices)?;
        let embeddings = l2_normalize_rows(&raw);
        Ok(TowerOutput {
            indices: indices.to_vec(),
            embeddings,
            cache: TowerCache::Lookup { raw },
        })
    }

    fn backward(
        &self,
        store: &EmbeddingStore,
        output: &TowerOutput,
        grad_embeddings: &Array2<f32>,
        grads: &mut Gradients,
    ) -> RecResult<()> {
        check_grad_shape(output, grad_embeddings)?;
        let TowerCache::Lookup { raw } = &output.cache else {
            return Err(RecError::ShapeMismatch {
                expected: "lookup activations".into(),
                actual: "mlp activations".into(),
            });
        };
        let grad_raw = l2_normalize_rows_backward(raw, &output.embeddings, grad_embeddings);
        grads.scatter_rows(
            self.side.embedding_name(),
            store.table(self.side).dim(),
            &output.indices,
            &grad_raw,
        );
        Ok(())
    }
}

/// Identity embedding, optionally fused with projected genre features,
/// passed through `ReLU(x·W1 + b1)·W2 + b2` and normalized.
///
/// The item side concatenates `[identity, genres·P]` into a `2D`-wide input;
/// the user side feeds the `D`-wide identity embedding directly.
#[derive(Debug, Clone)]
pub struct MlpTower {
    side: Side,
    genres: Option<Arc<GenreFeatures>>,
}

impl MlpTower {
    pub fn user() -> Self {
        Self {
            side: Side::User,
            genres: None,
        }
    }

    pub fn item(genres: Arc<GenreFeatures>) -> Self {
        Self {
            side: Side::Item,
            genres: Some(genres),
        }
    }

    fn mlp<'a>(&self, store: &'a EmbeddingStore) -> RecResult<&'a Mlp> {
        store
            .mlp(self.side)
            .ok_or_else(|| RecError::InvalidConfig("deep tower needs MLP parameters".into()))
    }

    fn genre_batch(&self, store: &EmbeddingStore, indices: &[usize]) -> Array2<f32> {
        match &self.genres {
            Some(features) if features.dim() == store.genre_dim() => features.batch(indices),
            _ => Array2::zeros((indices.len(), store.genre_dim())),
        }
    }
}

impl Tower for MlpTower {
    fn side(&self) -> Side {
        self.side
    }

    fn kind(&self) -> &'static str {
        "mlp"
    }

    fn forward(&self, store: &EmbeddingStore, indices: &[usize]) -> RecResult<TowerOutput> {
        let mlp = self.mlp(store)?;
        let identity = store.gather(self.side, indices)?;

        let (input, genres) = match self.side {
            Side::User => (identity, None),
            Side::Item => {
                let projection = store.genre_projection().ok_or_else(|| {
                    RecError::InvalidConfig("item tower needs a genre projection".into())
                })?;
                let genres = self.genre_batch(store, indices);
                let projected = genres.dot(projection);
                let input = concatenate(Axis(1), &[identity.view(), projected.view()]).map_err(|e| {
                    RecError::ShapeMismatch {
                        expected: "matching batch rows".into(),
                        actual: e.to_string(),
                    }
                })?;
                (input, Some(genres))
            }
        };

        let hidden_pre = mlp.hidden.forward(&input);
        let hidden = hidden_pre.mapv(relu);
        let output_pre = mlp.output.forward(&hidden);
        let embeddings = l2_normalize_rows(&output_pre);

        Ok(TowerOutput {
            indices: indices.to_vec(),
            embeddings,
            cache: TowerCache::Mlp {
                input,
                genres,
                hidden_pre,
                hidden,
                output_pre,
            },
        })
    }

    fn backward(
        &self,
        store: &EmbeddingStore,
        output: &TowerOutput,
        grad_embeddings: &Array2<f32>,
        grads: &mut Gradients,
    ) -> RecResult<()> {
        check_grad_shape(output, grad_embeddings)?;
        let TowerCache::Mlp {
            input,
            genres,
            hidden_pre,
            hidden,
            output_pre,
        } = &output.cache
        else {
            return Err(RecError::ShapeMismatch {
                expected: "mlp activations".into(),
                actual: "lookup activations".into(),
            });
        };
        let mlp = self.mlp(store)?;
        let names = self.side.mlp_names();

        let grad_output_pre =
            l2_normalize_rows_backward(output_pre, &output.embeddings, grad_embeddings);
        grads.accumulate(names.output.weight, hidden.t().dot(&grad_output_pre));
        grads.accumulate(names.output.bias, grad_output_pre.sum_axis(Axis(0)).insert_axis(Axis(0)));

        let grad_hidden = grad_output_pre.dot(&mlp.output.weight.t());
        let relu_mask = hidden_pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let grad_hidden_pre = grad_hidden * &relu_mask;
        grads.accumulate(names.hidden.weight, input.t().dot(&grad_hidden_pre));
        grads.accumulate(names.hidden.bias, grad_hidden_pre.sum_axis(Axis(0)).insert_axis(Axis(0)));

        let grad_input = grad_hidden_pre.dot(&mlp.hidden.weight.t());
        let d = store.embedding_dim();
        let grad_identity = grad_input.slice(s![.., ..d]).to_owned();

        if let Some(genres) = genres {
            let grad_projected = grad_input.slice(s![.., d..]);
            grads.accumulate(ITEM_GENRE_PROJECTION, genres.t().dot(&grad_projected));
        }

        grads.scatter_rows(
            self.side.embedding_name(),
            store.table(self.side).dim(),
            &output.indices,
            &grad_identity,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn deep_store() -> EmbeddingStore {
        let config = ModelConfig {
            embedding_dim: 4,
            hidden_dim: 8,
            use_deep_tower: true,
            ..ModelConfig::default()
        };
        EmbeddingStore::new(3, 5, 3, &config, &mut StdRng::seed_from_u64(11)).unwrap()
    }

    #[test]
    fn test_lookup_outputs_are_unit_norm() {
        let mut rng = StdRng::seed_from_u64(1);
        let store = EmbeddingStore::new(3, 5, 0, &ModelConfig::default(), &mut rng).unwrap();
        let out = LookupTower::new(Side::Item).forward(&store, &[0, 4, 4]).unwrap();
        assert_eq!(out.embeddings.dim(), (3, 32));
        for row in out.embeddings.rows() {
            assert!((row.dot(&row).sqrt() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_item_without_genres_is_finite() {
        let store = deep_store();
        let features = Arc::new(GenreFeatures::new(3, vec![Some(vec![1.0, 0.0, 1.0]), None]));
        let tower = MlpTower::item(features);
        // Item 1 has no genre row and items 2..5 are past the feature table.
        let out = tower.forward(&store, &[0, 1, 4]).unwrap();
        assert!(out.embeddings.iter().all(|v| v.is_finite()));
        assert_eq!(out.embeddings.dim(), (3, 4));
    }

    #[test]
    fn test_mlp_backward_produces_every_gradient() {
        let store = deep_store();
        let features = Arc::new(GenreFeatures::new(3, vec![Some(vec![0.0, 1.0, 1.0]); 5]));
        let item_tower = MlpTower::item(features);
        let user_tower = MlpTower::user();

        let mut grads = Gradients::new();
        let items = item_tower.forward(&store, &[1, 2]).unwrap();
        let users = user_tower.forward(&store, &[0, 2]).unwrap();
        let ones = Array2::ones((2, 4));
        item_tower.backward(&store, &items, &ones, &mut grads).unwrap();
        user_tower.backward(&store, &users, &ones, &mut grads).unwrap();

        for name in store.parameter_names() {
            let grad = grads.get(name).unwrap_or_else(|| panic!("missing {name}"));
            assert_eq!(grad.dim(), store.parameter(name).unwrap().dim(), "{name}");
        }
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let store = deep_store();
        let err = MlpTower::user().forward(&store, &[3]).unwrap_err();
        assert!(matches!(err, RecError::InvalidIndex { index: 3, len: 3, .. }));
    }
}
