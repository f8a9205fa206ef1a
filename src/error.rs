use thiserror::Error;

pub type RecResult<T> = std::result::Result<T, RecError>;

#[derive(Debug, Error)]
pub enum RecError {
    #[error("data contract violation: {0}")]
    DataContractViolation(String),

    #[error("non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        epoch: usize,
        batch: usize,
        value: f32,
    },

    #[error("non-finite gradient for parameter `{parameter}` at epoch {epoch}, batch {batch}")]
    NonFiniteGradient {
        epoch: usize,
        batch: usize,
        parameter: String,
    },

    #[error("no valid negative item for user {user} after {attempts} attempts")]
    SamplingExhausted { user: usize, attempts: usize },

    #[error("index {index} out of range for {table} with {len} rows")]
    InvalidIndex {
        table: &'static str,
        index: usize,
        len: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("a training run is already in progress")]
    TrainingInProgress,

    #[error("no trained model is available")]
    ModelNotTrained,

    #[error("parse error in {source_name} line {line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RecError {
    /// Fatal errors end a training run; everything else is absorbed per sample.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RecError::SamplingExhausted { .. })
    }
}
