pub mod embedding;
pub mod initializer;
pub mod loss;
pub mod optimizer;
pub mod retriever;
pub mod sampler;
pub mod scoring;
pub mod tower;

use crate::config::ModelConfig;
use crate::error::RecResult;
use crate::models::{Dataset, GenreFeatures};
use embedding::{EmbeddingStore, Side};
use ndarray::{Array1, Array2};
use rand::Rng;
use std::sync::Arc;
use tower::{LookupTower, MlpTower, Tower, TowerOutput};

/// Parameters plus the pair of towers that read them.
///
/// The tower implementations are chosen once from [`ModelConfig::use_deep_tower`]
/// and used through the [`Tower`] trait from then on.
#[derive(Debug)]
pub struct TwoTowerModel {
    store: EmbeddingStore,
    user_tower: Box<dyn Tower>,
    item_tower: Box<dyn Tower>,
}

impl TwoTowerModel {
    pub fn new<R: Rng>(
        config: &ModelConfig,
        num_users: usize,
        num_items: usize,
        genres: GenreFeatures,
        rng: &mut R,
    ) -> RecResult<Self> {
        let store = EmbeddingStore::new(num_users, num_items, genres.dim(), config, rng)?;
        let (user_tower, item_tower): (Box<dyn Tower>, Box<dyn Tower>) = if config.use_deep_tower {
            (Box::new(MlpTower::user()), Box::new(MlpTower::item(Arc::new(genres))))
        } else {
            (Box::new(LookupTower::new(Side::User)), Box::new(LookupTower::new(Side::Item)))
        };

        Ok(Self {
            store,
            user_tower,
            item_tower,
        })
    }

    pub fn from_dataset<R: Rng>(
        config: &ModelConfig,
        dataset: &Dataset,
        rng: &mut R,
    ) -> RecResult<Self> {
        Self::new(
            config,
            dataset.num_users(),
            dataset.num_items(),
            dataset.genre_features(),
            rng,
        )
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EmbeddingStore {
        &mut self.store
    }

    pub fn user_tower(&self) -> &dyn Tower {
        self.user_tower.as_ref()
    }

    pub fn item_tower(&self) -> &dyn Tower {
        self.item_tower.as_ref()
    }

    pub fn num_users(&self) -> usize {
        self.store.num_users()
    }

    pub fn num_items(&self) -> usize {
        self.store.num_items()
    }

    pub fn forward_users(&self, users: &[usize]) -> RecResult<TowerOutput> {
        self.user_tower.forward(&self.store, users)
    }

    pub fn forward_items(&self, items: &[usize]) -> RecResult<TowerOutput> {
        self.item_tower.forward(&self.store, items)
    }

    pub fn user_embeddings(&self, users: &[usize]) -> RecResult<Array2<f32>> {
        Ok(self.forward_users(users)?.embeddings)
    }

    pub fn item_embeddings(&self, items: &[usize]) -> RecResult<Array2<f32>> {
        Ok(self.forward_items(items)?.embeddings)
    }

    /// Cosine scores of one user against `items`.
    pub fn score(&self, user: usize, items: &[usize]) -> RecResult<Array1<f32>> {
        let user_embedding = self.user_embeddings(&[user])?;
        let item_embeddings = self.item_embeddings(items)?;
        Ok(scoring::score_matrix(&user_embedding, &item_embeddings).row(0).to_owned())
    }
}
