//! Learnable parameters of a two-tower model.
//!
//! Every tensor is addressable by a stable name so the optimizer can keep
//! per-parameter state and the trainer can apply a whole batch of updates at once.

use crate::algorithms::initializer::{zeros, InitializationMethod};
use crate::config::ModelConfig;
use crate::error::{RecError, RecResult};
use ndarray::{Array2, Axis};
use rand::Rng;
use std::collections::BTreeMap;

pub const USER_EMBEDDING: &str = "user_embedding";
pub const ITEM_EMBEDDING: &str = "item_embedding";
pub const ITEM_GENRE_PROJECTION: &str = "item_genre_projection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    User,
    Item,
}

#[derive(Debug, Clone, Copy)]
pub struct DenseNames {
    pub weight: &'static str,
    pub bias: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct MlpNames {
    pub hidden: DenseNames,
    pub output: DenseNames,
}

impl Side {
    pub fn embedding_name(self) -> &'static str {
        match self {
            Side::User => USER_EMBEDDING,
            Side::Item => ITEM_EMBEDDING,
        }
    }

    pub fn mlp_names(self) -> MlpNames {
        match self {
            Side::User => MlpNames {
                hidden: DenseNames {
                    weight: "user_mlp.hidden.weight",
                    bias: "user_mlp.hidden.bias",
                },
                output: DenseNames {
                    weight: "user_mlp.output.weight",
                    bias: "user_mlp.output.bias",
                },
            },
            Side::Item => MlpNames {
                hidden: DenseNames {
                    weight: "item_mlp.hidden.weight",
                    bias: "item_mlp.hidden.bias",
                },
                output: DenseNames {
                    weight: "item_mlp.output.weight",
                    bias: "item_mlp.output.bias",
                },
            },
        }
    }
}

/// Affine layer `x · W + b` with `b` stored as a `[1, out]` row.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub weight: Array2<f32>,
    pub bias: Array2<f32>,
}

impl DenseLayer {
    pub fn new<R: Rng>(
        inputs: usize,
        outputs: usize,
        init: &InitializationMethod,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: init.initialize(inputs, outputs, rng),
            bias: zeros(1, outputs),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }
}

/// One ReLU hidden layer followed by a linear projection back to the embedding width.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub hidden: DenseLayer,
    pub output: DenseLayer,
}

impl Mlp {
    pub fn new<R: Rng>(
        inputs: usize,
        hidden: usize,
        outputs: usize,
        init: &InitializationMethod,
        rng: &mut R,
    ) -> Self {
        Self {
            hidden: DenseLayer::new(inputs, hidden, init, rng),
            output: DenseLayer::new(hidden, outputs, init, rng),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeepParameters {
    pub user_mlp: Mlp,
    pub item_mlp: Mlp,
    /// `[G, D]`, maps a genre multi-hot into embedding space.
    pub genre_projection: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    embedding_dim: usize,
    user_embedding: Array2<f32>,
    item_embedding: Array2<f32>,
    deep: Option<DeepParameters>,
}

impl EmbeddingStore {
    pub fn new<R: Rng>(
        num_users: usize,
        num_items: usize,
        genre_dim: usize,
        config: &ModelConfig,
        rng: &mut R,
    ) -> RecResult<Self> {
        config.validate()?;
        let d = config.embedding_dim;
        let user_embedding = config.init.initialize(num_users, d, rng);
        let item_embedding = config.init.initialize(num_items, d, rng);

        let deep = if config.use_deep_tower {
            let h = config.hidden_dim;
            Some(DeepParameters {
                user_mlp: Mlp::new(d, h, d, &config.init, rng),
                item_mlp: Mlp::new(2 * d, h, d, &config.init, rng),
                genre_projection: config.init.initialize(genre_dim, d, rng),
            })
        } else {
            None
        };

        Ok(Self {
            embedding_dim: d,
            user_embedding,
            item_embedding,
            deep,
        })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn num_users(&self) -> usize {
        self.user_embedding.nrows()
    }

    pub fn num_items(&self) -> usize {
        self.item_embedding.nrows()
    }

    pub fn is_deep(&self) -> bool {
        self.deep.is_some()
    }

    pub fn genre_dim(&self) -> usize {
        self.deep.as_ref().map_or(0, |d| d.genre_projection.nrows())
    }

    pub fn table(&self, side: Side) -> &Array2<f32> {
        match side {
            Side::User => &self.user_embedding,
            Side::Item => &self.item_embedding,
        }
    }

    pub fn check_index(&self, side: Side, index: usize) -> RecResult<()> {
        let len = self.table(side).nrows();
        if index >= len {
            return Err(RecError::InvalidIndex {
                table: side.embedding_name(),
                index,
                len,
            });
        }
        Ok(())
    }

    /// Copies the requested rows into a `[indices.len(), D]` matrix.
    pub fn gather(&self, side: Side, indices: &[usize]) -> RecResult<Array2<f32>> {
        for &index in indices {
            self.check_index(side, index)?;
        }
        Ok(self.table(side).select(Axis(0), indices))
    }

    pub fn mlp(&self, side: Side) -> Option<&Mlp> {
        self.deep.as_ref().map(|d| match side {
            Side::User => &d.user_mlp,
            Side::Item => &d.item_mlp,
        })
    }

    pub fn genre_projection(&self) -> Option<&Array2<f32>> {
        self.deep.as_ref().map(|d| &d.genre_projection)
    }

    pub fn parameter_names(&self) -> Vec<&'static str> {
        let mut names = vec![USER_EMBEDDING, ITEM_EMBEDDING];
        if self.deep.is_some() {
            for side in [Side::User, Side::Item] {
                let mlp = side.mlp_names();
                names.extend([
                    mlp.hidden.weight,
                    mlp.hidden.bias,
                    mlp.output.weight,
                    mlp.output.bias,
                ]);
            }
            names.push(ITEM_GENRE_PROJECTION);
        }
        names
    }

    pub fn parameter(&self, name: &str) -> Option<&Array2<f32>> {
        match name {
            USER_EMBEDDING => Some(&self.user_embedding),
            ITEM_EMBEDDING => Some(&self.item_embedding),
            _ => {
                let deep = self.deep.as_ref()?;
                if name == ITEM_GENRE_PROJECTION {
                    return Some(&deep.genre_projection);
                }
                let (mlp, names) = if name.starts_with("user_mlp.") {
                    (&deep.user_mlp, Side::User.mlp_names())
                } else {
                    (&deep.item_mlp, Side::Item.mlp_names())
                };
                match name {
                    n if n == names.hidden.weight => Some(&mlp.hidden.weight),
                    n if n == names.hidden.bias => Some(&mlp.hidden.bias),
                    n if n == names.output.weight => Some(&mlp.output.weight),
                    n if n == names.output.bias => Some(&mlp.output.bias),
                    _ => None,
                }
            }
        }
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Array2<f32>> {
        match name {
            USER_EMBEDDING => Some(&mut self.user_embedding),
            ITEM_EMBEDDING => Some(&mut self.item_embedding),
            _ => {
                let deep = self.deep.as_mut()?;
                if name == ITEM_GENRE_PROJECTION {
                    return Some(&mut deep.genre_projection);
                }
                let (mlp, names) = if name.starts_with("user_mlp.") {
                    (&mut deep.user_mlp, Side::User.mlp_names())
                } else {
                    (&mut deep.item_mlp, Side::Item.mlp_names())
                };
                match name {
                    n if n == names.hidden.weight => Some(&mut mlp.hidden.weight),
                    n if n == names.hidden.bias => Some(&mut mlp.hidden.bias),
                    n if n == names.output.weight => Some(&mut mlp.output.weight),
                    n if n == names.output.bias => Some(&mut mlp.output.bias),
                    _ => None,
                }
            }
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_names()
            .into_iter()
            .filter_map(|name| self.parameter(name))
            .map(|p| p.len())
            .sum()
    }
}

/// Gradients for one batch, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: BTreeMap<&'static str, Array2<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, name: &'static str, grad: Array2<f32>) {
        match self.grads.get_mut(name) {
            Some(existing) => *existing += &grad,
            None => {
                self.grads.insert(name, grad);
            }
        }
    }

    /// Adds `rows[k]` into row `indices[k]` of a dense `[shape.0, shape.1]` gradient.
    /// Repeated indices accumulate.
    pub fn scatter_rows(
        &mut self,
        name: &'static str,
        shape: (usize, usize),
        indices: &[usize],
        rows: &Array2<f32>,
    ) {
        let grad = self.grads.entry(name).or_insert_with(|| Array2::zeros(shape));
        for (k, &index) in indices.iter().enumerate() {
            let mut target = grad.row_mut(index);
            target += &rows.row(k);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Array2<f32>> {
        self.grads.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Array2<f32>)> {
        self.grads.iter().map(|(name, grad)| (*name, grad))
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn first_non_finite(&self) -> Option<&'static str> {
        self.grads
            .iter()
            .find(|(_, grad)| !crate::utils::all_finite(grad))
            .map(|(name, _)| *name)
    }
}
