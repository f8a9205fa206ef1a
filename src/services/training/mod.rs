//! Epoch/batch training loop.
//!
//! [`Trainer::step`] performs exactly one unit of work: one batch with its
//! optimizer update, an epoch boundary, or the end of the run. Callers that
//! need to stay responsive (the async service, a UI) yield between steps;
//! [`Trainer::train`] simply loops until the run ends.

use crate::algorithms::embedding::Gradients;
use crate::algorithms::loss;
use crate::algorithms::optimizer::{build_optimizer, Optimizer};
use crate::algorithms::sampler::NegativeSampler;
use crate::algorithms::tower::TowerOutput;
use crate::algorithms::TwoTowerModel;
use crate::config::{Config, LossType, TrainingConfig};
use crate::error::{RecError, RecResult};
use crate::models::{BatchReport, Dataset, EpochReport, Interaction, TrainingReport};
use chrono::Utc;
use ndarray::{concatenate, s, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    Training,
    Cancelled,
}

/// Cloneable stop flag, checked before every batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Progress callbacks invoked synchronously by [`Trainer::train`].
pub trait TrainingObserver: Send {
    fn on_batch_end(&mut self, _report: &BatchReport) {}

    fn on_epoch_end(&mut self, _report: &EpochReport) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl TrainingObserver for NoopObserver {}

/// Outcome of one [`Trainer::step`].
#[derive(Debug, Clone)]
pub enum Step {
    Batch(BatchReport),
    EpochEnd(EpochReport),
    Finished(TrainingReport),
    Cancelled(TrainingReport),
}

#[derive(Debug)]
struct Run {
    report: TrainingReport,
    order: Vec<usize>,
    epoch: usize,
    batch: usize,
    cursor: usize,
    loss_sum: f64,
    examples: usize,
    batches: usize,
}

struct BatchForward {
    size: usize,
    skipped: usize,
    loss: f32,
    users: TowerOutput,
    items: TowerOutput,
    grad_users: Array2<f32>,
    grad_items: Array2<f32>,
}

#[derive(Debug)]
pub struct Trainer {
    config: TrainingConfig,
    dataset: Arc<Dataset>,
    model: TwoTowerModel,
    optimizer: Box<dyn Optimizer>,
    sampler: NegativeSampler,
    rated: Vec<HashSet<usize>>,
    rng: StdRng,
    state: TrainerState,
    cancellation: CancellationToken,
    run: Option<Run>,
    skipped_total: usize,
    last_report: Option<TrainingReport>,
}

impl Trainer {
    /// Validates `config` and `dataset`, then initializes a fresh model.
    pub fn new(config: &Config, dataset: Arc<Dataset>) -> RecResult<Self> {
        config.validate()?;
        dataset.validate()?;
        let mut rng = match config.training.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let model = TwoTowerModel::from_dataset(&config.model, &dataset, &mut rng)?;
        Ok(Self::assemble(&config.training, dataset, model, rng))
    }

    /// Continues training an existing model on `dataset`.
    pub fn with_model(
        config: &Config,
        dataset: Arc<Dataset>,
        model: TwoTowerModel,
    ) -> RecResult<Self> {
        config.validate()?;
        dataset.validate()?;
        if model.num_users() != dataset.num_users() || model.num_items() != dataset.num_items() {
            return Err(RecError::DataContractViolation(format!(
                "model has {}x{} users/items, dataset has {}x{}",
                model.num_users(),
                model.num_items(),
                dataset.num_users(),
                dataset.num_items()
            )));
        }
        let rng = match config.training.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self::assemble(&config.training, dataset, model, rng))
    }

    fn assemble(
        config: &TrainingConfig,
        dataset: Arc<Dataset>,
        model: TwoTowerModel,
        rng: StdRng,
    ) -> Self {
        let sampler = NegativeSampler::new(dataset.num_items(), config.max_negative_attempts);
        Self {
            config: config.clone(),
            rated: dataset.rated_items(),
            optimizer: build_optimizer(config.optimizer, config.learning_rate),
            dataset,
            model,
            sampler,
            rng,
            state: TrainerState::Idle,
            cancellation: CancellationToken::new(),
            run: None,
            skipped_total: 0,
            last_report: None,
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn model(&self) -> &TwoTowerModel {
        &self.model
    }

    pub fn into_model(self) -> TwoTowerModel {
        self.model
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Report of the most recently finished, cancelled or failed run.
    pub fn last_report(&self) -> Option<&TrainingReport> {
        self.last_report.as_ref()
    }

    pub fn train(&mut self, observer: &mut dyn TrainingObserver) -> RecResult<TrainingReport> {
        loop {
            match self.step()? {
                Step::Batch(report) => observer.on_batch_end(&report),
                Step::EpochEnd(report) => observer.on_epoch_end(&report),
                Step::Finished(report) | Step::Cancelled(report) => return Ok(report),
            }
        }
    }

    /// Advances the run by one unit of work, starting a new run when idle.
    ///
    /// A fatal error ends the run and returns the trainer to `Idle`; the
    /// parameters keep the values of the last completed batch.
    pub fn step(&mut self) -> RecResult<Step> {
        if self.state == TrainerState::Cancelled {
            return Ok(Step::Cancelled(self.last_report.clone().unwrap_or_default()));
        }

        let mut run = match self.run.take() {
            Some(run) => run,
            None => self.start_run(),
        };

        if self.cancellation.is_cancelled() {
            return Ok(self.finish(run, true));
        }
        if run.epoch >= self.config.epochs {
            return Ok(self.finish(run, false));
        }

        if run.cursor >= run.order.len() {
            let report = EpochReport {
                epoch: run.epoch,
                mean_loss: if run.examples > 0 {
                    run.loss_sum / run.examples as f64
                } else {
                    0.0
                },
                batches: run.batches,
                examples: run.examples,
            };
            info!(
                epoch = report.epoch,
                mean_loss = report.mean_loss,
                batches = report.batches,
                "epoch finished"
            );
            run.report.epochs.push(report.clone());
            run.epoch += 1;
            self.begin_epoch(&mut run);
            self.run = Some(run);
            return Ok(Step::EpochEnd(report));
        }

        let end = (run.cursor + self.config.batch_size).min(run.order.len());
        match self.run_batch(run.epoch, run.batch, &run.order[run.cursor..end]) {
            Ok(report) => {
                run.cursor = end;
                run.batch += 1;
                if report.size > 0 {
                    run.batches += 1;
                    run.loss_sum += f64::from(report.loss) * report.size as f64;
                    run.examples += report.size;
                }
                run.report.skipped_samples += report.skipped_samples;
                self.run = Some(run);
                Ok(Step::Batch(report))
            }
            Err(e) => {
                error!(
                    run_id = %run.report.run_id,
                    epoch = run.epoch,
                    batch = run.batch,
                    "training aborted: {}",
                    e
                );
                run.report.finished_at = Some(Utc::now());
                self.last_report = Some(run.report);
                self.state = TrainerState::Idle;
                Err(e)
            }
        }
    }

    fn start_run(&mut self) -> Run {
        self.state = TrainerState::Training;
        self.skipped_total = 0;
        let mut run = Run {
            report: TrainingReport::new(),
            order: (0..self.dataset.interactions.len()).collect(),
            epoch: 0,
            batch: 0,
            cursor: 0,
            loss_sum: 0.0,
            examples: 0,
            batches: 0,
        };
        info!(
            run_id = %run.report.run_id,
            users = self.dataset.num_users(),
            items = self.dataset.num_items(),
            interactions = self.dataset.interactions.len(),
            loss = ?self.config.loss,
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            deep = self.model.store().is_deep(),
            "training started"
        );
        self.begin_epoch(&mut run);
        run
    }

    fn begin_epoch(&mut self, run: &mut Run) {
        run.order.shuffle(&mut self.rng);
        run.batch = 0;
        run.cursor = 0;
        run.loss_sum = 0.0;
        run.examples = 0;
        run.batches = 0;
    }

    fn finish(&mut self, mut run: Run, cancelled: bool) -> Step {
        run.report.finished_at = Some(Utc::now());
        run.report.cancelled = cancelled;
        let report = run.report;
        self.last_report = Some(report.clone());

        if cancelled {
            self.state = TrainerState::Cancelled;
            info!(run_id = %report.run_id, epochs = report.epochs.len(), "training cancelled");
            Step::Cancelled(report)
        } else {
            self.state = TrainerState::Idle;
            info!(
                run_id = %report.run_id,
                final_loss = ?report.final_loss(),
                skipped = report.skipped_samples,
                "training finished"
            );
            Step::Finished(report)
        }
    }

    /// Forward, loss and backward for one batch, then a single optimizer step.
    /// Nothing is written unless the loss and every gradient are finite.
    fn run_batch(
        &mut self,
        epoch: usize,
        batch: usize,
        positions: &[usize],
    ) -> RecResult<BatchReport> {
        let interactions: Vec<Interaction> = positions
            .iter()
            .map(|&position| self.dataset.interactions[position])
            .collect();

        let forward = match self.config.loss {
            LossType::Softmax => Some(self.softmax_forward(&interactions)?),
            LossType::Bpr => self.bpr_forward(&interactions)?,
        };

        let Some(forward) = forward else {
            warn!(epoch, batch, "every sample in the batch was skipped");
            return Ok(BatchReport {
                epoch,
                batch,
                size: 0,
                loss: 0.0,
                skipped_samples: interactions.len(),
            });
        };

        if !forward.loss.is_finite() {
            return Err(RecError::NonFiniteLoss {
                epoch,
                batch,
                value: forward.loss,
            });
        }

        let mut grads = Gradients::new();
        self.model
            .user_tower()
            .backward(self.model.store(), &forward.users, &forward.grad_users, &mut grads)?;
        self.model
            .item_tower()
            .backward(self.model.store(), &forward.items, &forward.grad_items, &mut grads)?;

        if let Some(parameter) = grads.first_non_finite() {
            return Err(RecError::NonFiniteGradient {
                epoch,
                batch,
                parameter: parameter.to_string(),
            });
        }

        self.optimizer.apply(self.model.store_mut(), &grads)?;

        debug!(epoch, batch, size = forward.size, loss = forward.loss, "batch finished");
        Ok(BatchReport {
            epoch,
            batch,
            size: forward.size,
            loss: forward.loss,
            skipped_samples: forward.skipped,
        })
    }

    fn softmax_forward(&self, batch: &[Interaction]) -> RecResult<BatchForward> {
        let users: Vec<usize> = batch.iter().map(|i| i.user).collect();
        let items: Vec<usize> = batch.iter().map(|i| i.item).collect();

        let user_out = self.model.forward_users(&users)?;
        let item_out = self.model.forward_items(&items)?;
        let temperature = self.config.temperature;
        let loss = loss::in_batch_softmax(&user_out.embeddings, &item_out.embeddings, temperature)?;

        Ok(BatchForward {
            size: batch.len(),
            skipped: 0,
            loss: loss.value,
            users: user_out,
            items: item_out,
            grad_users: loss.grad_users,
            grad_items: loss.grad_items,
        })
    }

    /// Positives and sampled negatives go through the item tower together.
    fn bpr_forward(&mut self, batch: &[Interaction]) -> RecResult<Option<BatchForward>> {
        let mut users = Vec::with_capacity(batch.len());
        let mut positives = Vec::with_capacity(batch.len());
        let mut negatives = Vec::with_capacity(batch.len());
        let mut skipped = 0;

        for interaction in batch {
            match self
                .sampler
                .sample(interaction.user, &self.rated[interaction.user], &mut self.rng)
            {
                Ok(negative) => {
                    users.push(interaction.user);
                    positives.push(interaction.item);
                    negatives.push(negative);
                }
                Err(e) if !e.is_fatal() => {
                    skipped += 1;
                    self.skipped_total += 1;
                    warn!(user = interaction.user, skipped_total = self.skipped_total, "{}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if users.is_empty() {
            return Ok(None);
        }

        let n = users.len();
        let mut item_indices = positives;
        item_indices.extend_from_slice(&negatives);

        let user_out = self.model.forward_users(&users)?;
        let item_out = self.model.forward_items(&item_indices)?;
        let pos = item_out.embeddings.slice(s![..n, ..]).to_owned();
        let neg = item_out.embeddings.slice(s![n.., ..]).to_owned();

        let loss = loss::bpr(&user_out.embeddings, &pos, &neg)?;
        let grad_negatives = loss.grad_negatives.unwrap_or_else(|| Array2::zeros(neg.dim()));
        let grad_items = concatenate(Axis(0), &[loss.grad_items.view(), grad_negatives.view()])
            .map_err(|e| RecError::ShapeMismatch {
                expected: format!("{:?}", item_out.embeddings.dim()),
                actual: e.to_string(),
            })?;

        Ok(Some(BatchForward {
            size: n,
            skipped,
            loss: loss.value,
            users: user_out,
            items: item_out,
            grad_users: loss.grad_users,
            grad_items,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::embedding::{Side, USER_EMBEDDING};
    use crate::services::dataset::{synthetic, DatasetBuilder};

    fn config(batch_size: usize, epochs: usize, loss: LossType) -> Config {
        let mut config = Config::default();
        config.model.embedding_dim = 8;
        config.training.batch_size = batch_size;
        config.training.epochs = epochs;
        config.training.loss = loss;
        config.training.seed = Some(11);
        config
    }

    fn drain(trainer: &mut Trainer) -> Vec<Step> {
        let mut steps = Vec::new();
        loop {
            let step = trainer.step().unwrap();
            let done = matches!(step, Step::Finished(_) | Step::Cancelled(_));
            steps.push(step);
            if done {
                return steps;
            }
        }
    }

    #[test]
    fn test_oversized_batch_yields_one_batch_per_epoch() {
        let dataset = Arc::new(synthetic::bijection(5, 0).unwrap());
        let mut trainer = Trainer::new(&config(100, 3, LossType::Softmax), dataset).unwrap();
        let steps = drain(&mut trainer);

        let sizes: Vec<usize> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Batch(b) => Some(b.size),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![5, 5, 5]);
        assert_eq!(trainer.state(), TrainerState::Idle);
    }

    #[test]
    fn test_partial_final_batch_is_processed() {
        let dataset = Arc::new(synthetic::bijection(5, 0).unwrap());
        let mut trainer = Trainer::new(&config(2, 1, LossType::Softmax), dataset).unwrap();
        let report = trainer.train(&mut NoopObserver).unwrap();
        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.epochs[0].batches, 3);
        assert_eq!(report.epochs[0].examples, 5);
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_cancel_before_first_batch_leaves_parameters() {
        let dataset = Arc::new(synthetic::bijection(4, 0).unwrap());
        let mut trainer = Trainer::new(&config(2, 5, LossType::Softmax), dataset).unwrap();
        let before = trainer.model().store().table(Side::User).clone();

        trainer.cancellation_token().cancel();
        let report = trainer.train(&mut NoopObserver).unwrap();
        assert!(report.cancelled);
        assert!(report.epochs.is_empty());
        assert_eq!(trainer.state(), TrainerState::Cancelled);
        assert_eq!(trainer.model().store().table(Side::User), &before);
        assert!(matches!(trainer.step().unwrap(), Step::Cancelled(_)));
    }

    #[test]
    fn test_non_finite_loss_aborts_to_idle() {
        let dataset = Arc::new(synthetic::bijection(4, 0).unwrap());
        let config = config(4, 2, LossType::Softmax);
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = TwoTowerModel::from_dataset(&config.model, &dataset, &mut rng).unwrap();
        if let Some(table) = model.store_mut().parameter_mut(USER_EMBEDDING) {
            table.row_mut(0).fill(f32::NAN);
        }
        let items_before = model.store().table(Side::Item).clone();

        let mut trainer = Trainer::with_model(&config, dataset, model).unwrap();
        let err = trainer.train(&mut NoopObserver).unwrap_err();
        assert!(matches!(err, RecError::NonFiniteLoss { epoch: 0, batch: 0, .. }));
        assert_eq!(trainer.state(), TrainerState::Idle);
        assert_eq!(trainer.model().store().table(Side::Item), &items_before);
    }

    #[test]
    fn test_bpr_skips_users_without_negatives() {
        let mut builder = DatasetBuilder::new(0);
        builder.interaction("all", "x", 5.0, 0);
        builder.interaction("all", "y", 5.0, 1);
        builder.interaction("some", "x", 5.0, 2);
        let dataset = Arc::new(builder.build().unwrap());

        let mut trainer = Trainer::new(&config(8, 2, LossType::Bpr), dataset).unwrap();
        let report = trainer.train(&mut NoopObserver).unwrap();
        assert_eq!(report.skipped_samples, 4);
        assert!(report.epochs.iter().all(|e| e.examples == 1));
        assert!(report.loss_history().iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_invalid_dataset_prevents_training() {
        let dataset = Arc::new(Dataset::default());
        let err = Trainer::new(&config(8, 1, LossType::Softmax), dataset).unwrap_err();
        assert!(matches!(err, RecError::DataContractViolation(_)));
    }

    #[test]
    fn test_observer_sees_every_epoch() {
        #[derive(Default)]
        struct Recorder {
            batches: usize,
            epochs: Vec<f64>,
        }
        impl TrainingObserver for Recorder {
            fn on_batch_end(&mut self, _report: &BatchReport) {
                self.batches += 1;
            }
            fn on_epoch_end(&mut self, report: &EpochReport) {
                self.epochs.push(report.mean_loss);
            }
        }

        let dataset = Arc::new(synthetic::random(6, 12, 3, 4, 1).unwrap());
        let mut trainer = Trainer::new(&config(4, 3, LossType::Bpr), dataset).unwrap();
        let mut recorder = Recorder::default();
        let report = trainer.train(&mut recorder).unwrap();
        assert_eq!(recorder.epochs, report.loss_history());
        assert_eq!(recorder.batches, 3 * 5);
    }
}
