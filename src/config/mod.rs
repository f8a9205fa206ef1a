use crate::algorithms::initializer::InitializationMethod;
use crate::error::{RecError, RecResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub retrieval: RetrievalConfig,
    pub data: DataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub use_deep_tower: bool,
    pub init: InitializationMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    Softmax,
    Bpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub loss: LossType,
    /// Divides cosine logits in the in-batch softmax. `1.0` trains on the
    /// plain cosine logits; smaller values sharpen the batch distribution.
    pub temperature: f32,
    pub optimizer: OptimizerKind,
    pub max_negative_attempts: usize,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub scoring_batch_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub movielens_dir: Option<PathBuf>,
    pub holdout_last: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 32,
            hidden_dim: 64,
            use_deep_tower: false,
            init: InitializationMethod::Normal {
                mean: 0.0,
                std_dev: 0.05,
            },
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            epochs: 10,
            learning_rate: 0.01,
            loss: LossType::Softmax,
            temperature: 0.1,
            optimizer: OptimizerKind::Adam,
            max_negative_attempts: 100,
            seed: None,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            scoring_batch_size: 512,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("TOWERREC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RecResult<()> {
        crate::utils::validation::validate_config(self)
    }
}

impl ModelConfig {
    pub fn validate(&self) -> RecResult<()> {
        if self.embedding_dim == 0 {
            return Err(RecError::InvalidConfig("embedding_dim must be positive".into()));
        }
        if self.use_deep_tower && self.hidden_dim == 0 {
            return Err(RecError::InvalidConfig(
                "hidden_dim must be positive for the deep tower".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.embedding_dim, 32);
        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.training.loss, LossType::Softmax);
    }

    #[test]
    fn test_loss_type_deserializes_lowercase() {
        let loss: LossType = serde_json::from_str("\"bpr\"").unwrap();
        assert_eq!(loss, LossType::Bpr);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"training": {"batch_size": 8, "loss": "bpr"}}"#).unwrap();
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.training.epochs, 10);
        assert_eq!(config.model.embedding_dim, 32);
    }
}
