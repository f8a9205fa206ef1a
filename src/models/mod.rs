use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub index: usize,
    pub title: String,
    pub year: Option<i32>,
    /// Multi-hot over the genre vocabulary; `None` when the loader had no row for it.
    pub genres: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user: usize,
    pub item: usize,
    pub rating: f32,
    pub timestamp: i64,
}

/// Loader output handed to the core: contiguous user and item index spaces,
/// the interaction log and per-item genre vectors of width `genre_dim`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Dataset {
    pub users: Vec<User>,
    pub items: Vec<Item>,
    pub interactions: Vec<Interaction>,
    pub genre_names: Vec<String>,
    pub genre_dim: usize,
    #[serde(skip)]
    user_lookup: HashMap<String, usize>,
    #[serde(skip)]
    item_lookup: HashMap<String, usize>,
}

impl Dataset {
    pub fn new(
        users: Vec<User>,
        items: Vec<Item>,
        interactions: Vec<Interaction>,
        genre_names: Vec<String>,
        genre_dim: usize,
    ) -> Self {
        let user_lookup = users.iter().map(|u| (u.id.clone(), u.index)).collect();
        let item_lookup = items.iter().map(|i| (i.id.clone(), i.index)).collect();
        Self {
            users,
            items,
            interactions,
            genre_names,
            genre_dim,
            user_lookup,
            item_lookup,
        }
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn user_index(&self, id: &str) -> Option<usize> {
        self.user_lookup.get(id).copied()
    }

    pub fn item_index(&self, id: &str) -> Option<usize> {
        self.item_lookup.get(id).copied()
    }

    /// Items each user has interacted with, indexed by user.
    pub fn rated_items(&self) -> Vec<HashSet<usize>> {
        let mut rated = vec![HashSet::new(); self.users.len()];
        for interaction in &self.interactions {
            if let Some(set) = rated.get_mut(interaction.user) {
                set.insert(interaction.item);
            }
        }
        rated
    }

    pub fn genre_features(&self) -> GenreFeatures {
        GenreFeatures::new(
            self.genre_dim,
            self.items.iter().map(|item| item.genres.clone()).collect(),
        )
    }

    pub fn validate(&self) -> crate::error::RecResult<()> {
        crate::utils::validation::validate_dataset(self)
    }

    /// Same users and items with a different interaction log.
    pub fn with_interactions(&self, interactions: Vec<Interaction>) -> Self {
        Self::new(
            self.users.clone(),
            self.items.clone(),
            interactions,
            self.genre_names.clone(),
            self.genre_dim,
        )
    }
}

/// Per-item side features. Items without a row read as zeros.
#[derive(Debug, Clone, Default)]
pub struct GenreFeatures {
    dim: usize,
    rows: Vec<Option<Vec<f32>>>,
}

impl GenreFeatures {
    pub fn new(dim: usize, rows: Vec<Option<Vec<f32>>>) -> Self {
        Self { dim, rows }
    }

    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            rows: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, item: usize) -> Option<&[f32]> {
        self.rows
            .get(item)
            .and_then(|row| row.as_deref())
            .filter(|row| row.len() == self.dim)
    }

    pub fn batch(&self, items: &[usize]) -> Array2<f32> {
        let mut out = Array2::zeros((items.len(), self.dim));
        for (mut row, &item) in out.rows_mut().into_iter().zip(items) {
            if let Some(features) = self.get(item) {
                for (dst, &src) in row.iter_mut().zip(features) {
                    *dst = src;
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub item: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub epoch: usize,
    pub batch: usize,
    pub size: usize,
    pub loss: f32,
    pub skipped_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub mean_loss: f64,
    pub batches: usize,
    pub examples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub epochs: Vec<EpochReport>,
    pub cancelled: bool,
    pub skipped_samples: usize,
}

impl TrainingReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            epochs: Vec::new(),
            cancelled: false,
            skipped_samples: 0,
        }
    }

    pub fn loss_history(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.mean_loss).collect()
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.mean_loss)
    }
}

impl Default for TrainingReport {
    fn default() -> Self {
        Self::new()
    }
}
