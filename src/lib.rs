pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::retriever::TopKRetriever;
pub use algorithms::TwoTowerModel;
pub use crate::config::{Config, LossType, ModelConfig, OptimizerKind, TrainingConfig};
pub use error::{RecError, RecResult};
pub use models::*;
pub use services::recommendation::RecommendationService;
pub use services::training::{CancellationToken, Step, Trainer, TrainerState, TrainingObserver};

/// Installs a fmt subscriber filtered by `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
