use crate::algorithms::embedding::{EmbeddingStore, Gradients};
use crate::config::OptimizerKind;
use crate::error::{RecError, RecResult};
use ndarray::{Array2, Zip};
use std::collections::HashMap;
use std::fmt;

pub trait Optimizer: Send + Sync + fmt::Debug {
    /// Marks the start of one optimizer step covering every parameter update that follows.
    fn begin_step(&mut self);

    fn update(&mut self, key: &str, params: &mut Array2<f32>, gradients: &Array2<f32>);

    fn reset(&mut self);

    /// Applies one step to every parameter in `grads`.
    ///
    /// Names and shapes are checked before the first write, so a bad gradient
    /// leaves the store untouched.
    fn apply(&mut self, store: &mut EmbeddingStore, grads: &Gradients) -> RecResult<()> {
        for (name, grad) in grads.iter() {
            let param = store
                .parameter(name)
                .ok_or_else(|| RecError::InvalidConfig(format!("unknown parameter `{name}`")))?;
            if param.dim() != grad.dim() {
                return Err(RecError::ShapeMismatch {
                    expected: format!("{name} {:?}", param.dim()),
                    actual: format!("{:?}", grad.dim()),
                });
            }
        }

        self.begin_step();
        for (name, grad) in grads.iter() {
            if let Some(param) = store.parameter_mut(name) {
                self.update(name, param, grad);
            }
        }
        Ok(())
    }
}

pub fn build_optimizer(kind: OptimizerKind, learning_rate: f64) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Adam => Box::new(Adam::with_learning_rate(learning_rate)),
        OptimizerKind::Sgd => Box::new(SGD::new(learning_rate)),
    }
}

#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f64,
}

impl SGD {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for SGD {
    fn begin_step(&mut self) {}

    fn update(&mut self, _key: &str, params: &mut Array2<f32>, gradients: &Array2<f32>) {
        params.scaled_add(-(self.learning_rate as f32), gradients);
    }

    fn reset(&mut self) {
        // SGD doesn't maintain state
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    m: HashMap<String, Array2<f32>>,
    v: HashMap<String, Array2<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::with_learning_rate(0.001)
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, key: &str, params: &mut Array2<f32>, gradients: &Array2<f32>) {
        let t = self.t.max(1);
        let beta1 = self.beta1 as f32;
        let beta2 = self.beta2 as f32;
        let epsilon = self.epsilon as f32;
        let lr = self.learning_rate as f32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        let m = self
            .m
            .entry(key.to_string())
            .or_insert_with(|| Array2::zeros(params.dim()));
        let v = self
            .v
            .entry(key.to_string())
            .or_insert_with(|| Array2::zeros(params.dim()));

        Zip::from(params)
            .and(m)
            .and(v)
            .and(gradients)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            });
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }
}
