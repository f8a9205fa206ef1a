use crate::algorithms::retriever::TopKRetriever;
use crate::algorithms::TwoTowerModel;
use crate::config::Config;
use crate::error::{RecError, RecResult};
use crate::models::{Dataset, Interaction, Recommendation, TrainingReport};
use crate::services::training::{CancellationToken, NoopObserver, Step, Trainer, TrainingObserver};
use crate::utils::metrics::{MetricsCalculator, RecommendationMetrics};
use anyhow::Result;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Async facade over one dataset: trains a model cooperatively and serves
/// top-K recommendations from the last trained model.
pub struct RecommendationService {
    config: Arc<Config>,
    dataset: Arc<Dataset>,
    rated: Arc<Vec<HashSet<usize>>>,
    model: Arc<RwLock<Option<Arc<TwoTowerModel>>>>,
    active_run: Arc<Mutex<Option<CancellationToken>>>,
}

/// Holds the single-run slot for the lifetime of a training future.
///
/// The slot is released on every exit path, including a future dropped at a
/// yield point.
struct ActiveRunGuard {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl ActiveRunGuard {
    fn acquire(
        slot: &Arc<Mutex<Option<CancellationToken>>>,
        token: CancellationToken,
    ) -> RecResult<Self> {
        let mut active = slot.lock();
        if active.is_some() {
            return Err(RecError::TrainingInProgress);
        }
        *active = Some(token);
        Ok(Self { slot: slot.clone() })
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

impl RecommendationService {
    pub fn new(config: Config, dataset: Arc<Dataset>) -> Result<Self> {
        config.validate()?;
        dataset.validate()?;
        let rated = Arc::new(dataset.rated_items());

        Ok(Self {
            config: Arc::new(config),
            dataset,
            rated,
            model: Arc::new(RwLock::new(None)),
            active_run: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub async fn train(&self) -> Result<TrainingReport> {
        self.train_with_observer(&self.config, &mut NoopObserver).await
    }

    /// Runs a full training session, yielding to the runtime after every step.
    ///
    /// Only one run may be active at a time. The trained model replaces the
    /// served one when the run finishes or is cancelled; a failed run leaves
    /// the previous model in place.
    pub async fn train_with_observer(
        &self,
        config: &Config,
        observer: &mut dyn TrainingObserver,
    ) -> Result<TrainingReport> {
        let mut trainer = Trainer::new(config, self.dataset.clone())?;
        let run_guard = ActiveRunGuard::acquire(&self.active_run, trainer.cancellation_token())?;

        let outcome = loop {
            match trainer.step() {
                Ok(Step::Batch(report)) => observer.on_batch_end(&report),
                Ok(Step::EpochEnd(report)) => observer.on_epoch_end(&report),
                Ok(Step::Finished(report)) | Ok(Step::Cancelled(report)) => break Ok(report),
                Err(e) => break Err(e),
            }
            tokio::task::yield_now().await;
        };

        let report = outcome?;
        *self.model.write().await = Some(Arc::new(trainer.into_model()));
        drop(run_guard);
        info!(
            run_id = %report.run_id,
            epochs = report.epochs.len(),
            cancelled = report.cancelled,
            "model updated"
        );
        Ok(report)
    }

    /// Requests cancellation of the active run. Returns false when idle.
    pub async fn cancel(&self) -> bool {
        match self.active_run.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_training(&self) -> bool {
        self.active_run.lock().is_some()
    }

    pub async fn is_trained(&self) -> bool {
        self.model.read().await.is_some()
    }

    pub async fn recommend(
        &self,
        user: usize,
        exclude: &HashSet<usize>,
        k: usize,
    ) -> Result<Vec<Recommendation>> {
        let model = self.snapshot().await?;
        let retriever = TopKRetriever::new(self.config.retrieval.scoring_batch_size);
        Ok(retriever.recommend(&model, user, exclude, k)?)
    }

    /// Top `k` items the user has not interacted with.
    pub async fn recommend_unrated(&self, user: usize, k: usize) -> Result<Vec<Recommendation>> {
        let exclude = self.rated.get(user).cloned().unwrap_or_default();
        self.recommend(user, &exclude, k).await
    }

    /// Ranking metrics over held-out interactions, one list per interaction.
    /// Training items are excluded from every list.
    pub async fn evaluate(
        &self,
        held_out: &[Interaction],
        k: usize,
    ) -> Result<RecommendationMetrics> {
        let model = self.snapshot().await?;
        let rated = self.rated.clone();
        let retriever = TopKRetriever::new(self.config.retrieval.scoring_batch_size);
        let held_out = held_out.to_vec();

        let metrics = tokio::task::spawn_blocking(move || -> RecResult<RecommendationMetrics> {
            let empty = HashSet::new();
            let lists = held_out
                .par_iter()
                .map(|interaction| -> RecResult<(Vec<usize>, HashSet<usize>)> {
                    let exclude = rated.get(interaction.user).unwrap_or(&empty);
                    let recommended = retriever
                        .recommend(&model, interaction.user, exclude, k)?
                        .into_iter()
                        .map(|r| r.item)
                        .collect::<Vec<usize>>();
                    Ok((recommended, HashSet::from([interaction.item])))
                })
                .collect::<RecResult<Vec<_>>>()?;
            Ok(MetricsCalculator::new(k).calculate_all_metrics(&lists, model.num_items()))
        })
        .await??;

        info!(
            users = metrics.users_evaluated,
            hit_rate = metrics.hit_rate_at_k,
            ndcg = metrics.ndcg_at_k,
            coverage = metrics.coverage,
            "evaluation finished"
        );
        Ok(metrics)
    }

    /// The served model, shared so scoring never holds the lock.
    async fn snapshot(&self) -> RecResult<Arc<TwoTowerModel>> {
        self.model.read().await.clone().ok_or(RecError::ModelNotTrained)
    }
}

impl Clone for RecommendationService {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            dataset: self.dataset.clone(),
            rated: self.rated.clone(),
            model: self.model.clone(),
            active_run: self.active_run.clone(),
        }
    }
}
