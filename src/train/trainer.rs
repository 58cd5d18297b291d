//! The training loop.
//!
//! A [`Trainer`] owns the model parameters and drives them through the
//! [`TrainingState`] machine:
//!
//!  - `Initialized -> Running` when [`Trainer::run()`] requests its first batch;
//!  - `Running -> Checkpointing -> Running` every `checkpoint_interval` steps, and when a
//!    new best validation metric is reached;
//!  - `Running -> Stopped(reason)` on max steps, early stopping, cancellation or data
//!    exhaustion, after flushing a final checkpoint;
//!  - `* -> Failed(reason)` on a non-finite loss or a persistence error. Failures are
//!    reported, never retried, and no checkpoint is written after one.
//!
//! Each step consumes one batch, computes the loss, checks it is finite, backpropagates
//! and applies the optimizer update. The step works on a copy of the model rebuilt from
//! its record (see [`ModelConfig::load()`]) that is only committed back once the update
//! succeeded, and the optimizer state is only touched by that update, so a failed step
//! leaves parameters, batch norm statistics and optimizer state as they were.

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use super::{
    checkpoint::{record_from_bytes, record_to_bytes, Checkpoint, CheckpointMeta, CheckpointStore},
    config::{RunConfig, TrainConfig},
    context::{StopReason, TrainingContext, TrainingState},
    metrics::{MetricRecord, MetricsLog, METRICS_FILENAME},
};
use crate::{
    dataset::{Batch, BatchSource, CancellationToken},
    evaluate::{evaluate, EvaluationReport},
    model::{ModelConfig, SeqSignalModel},
    BasenjiError, TrainBackend,
};

type TrainModel = SeqSignalModel<TrainBackend>;

enum CheckpointKind {
    Latest,
    Best,
}

/// Owns the parameters, optimizer state and [`TrainingContext`] of a run.
pub struct Trainer {
    config: TrainConfig,
    model_config: ModelConfig,
    window_len: usize,
    track_names: Vec<String>,
    model: TrainModel,
    optimizer_record: Option<Vec<u8>>,
    context: TrainingContext,
    state: TrainingState,
    store: CheckpointStore,
    metrics: MetricsLog,
    token: CancellationToken,
    device: <TrainBackend as Backend>::Device,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("state", &self.state)
            .field("context", &self.context)
            .field("out_dir", &self.config.out_dir)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// A trainer with freshly initialized parameters, seeded with the run's seed.
    ///
    /// Initialization goes through [`ModelConfig::init_seeded()`]: trainers built
    /// concurrently with the same seed start from the same parameters. burn's dropout
    /// draws from the same process-wide generator, so only runs without dropout are
    /// reproducible when several train at once in one process.
    pub fn new(config: &RunConfig, token: CancellationToken) -> Result<Self, BasenjiError> {
        let device = Default::default();
        let model = config.model.init_seeded::<TrainBackend>(
            config.train.seed,
            config.data.window_len as usize,
            config.data.tracks.len(),
            &device,
        );
        Self::with_model(config, model, token)
    }

    /// A trainer starting from the given parameters. The trainer works on its own copy,
    /// so training never changes the batch norm statistics of `model` or its clones.
    pub fn with_model(
        config: &RunConfig,
        model: TrainModel,
        token: CancellationToken,
    ) -> Result<Self, BasenjiError> {
        config.validate()?;
        if model.num_targets() != config.data.tracks.len() {
            return Err(BasenjiError::InvalidConfig(format!(
                "the model predicts {} tracks but {} are configured",
                model.num_targets(),
                config.data.tracks.len()
            )));
        }
        let model = config.model.load::<TrainBackend>(
            model.into_record(),
            config.data.window_len as usize,
            config.data.tracks.len(),
            &Default::default(),
        );
        Self::build(config, model, TrainingContext::new(), None, token)
    }

    /// Continue a run from a checkpoint: parameters, optimizer state and context are
    /// restored, and the metrics log is appended to.
    pub fn resume(
        config: &RunConfig,
        checkpoint: Checkpoint,
        token: CancellationToken,
    ) -> Result<Self, BasenjiError> {
        config.validate()?;
        let meta = &checkpoint.meta;
        if meta.model != config.model
            || meta.window_len != config.data.window_len as usize
            || meta.track_names != config.track_names()
        {
            return Err(BasenjiError::InvalidConfig(
                "the checkpoint's model, window length or tracks differ from the configuration"
                    .to_string(),
            ));
        }
        if meta.optimizer != config.train.optimizer.name() {
            return Err(BasenjiError::InvalidConfig(format!(
                "the checkpoint was trained with {}, the configuration uses {}",
                meta.optimizer,
                config.train.optimizer.name()
            )));
        }
        let model = checkpoint.load_model::<TrainBackend>(&Default::default())?;
        info!(step = checkpoint.step, "resuming from checkpoint");
        Self::build(
            config,
            model,
            checkpoint.meta.context,
            Some(checkpoint.optimizer_record),
            token,
        )
    }

    fn build(
        config: &RunConfig,
        model: TrainModel,
        context: TrainingContext,
        optimizer_record: Option<Vec<u8>>,
        token: CancellationToken,
    ) -> Result<Self, BasenjiError> {
        let store = CheckpointStore::new(&config.train.out_dir, config.train.io_retries)?;
        let resuming = optimizer_record.is_some();
        let metrics = MetricsLog::open(
            config.train.out_dir.join(METRICS_FILENAME),
            config.train.io_retries,
            resuming,
        )?;
        Ok(Self {
            config: config.train.clone(),
            model_config: config.model.clone(),
            window_len: config.data.window_len as usize,
            track_names: config.track_names(),
            model,
            optimizer_record,
            context,
            state: TrainingState::Initialized,
            store,
            metrics,
            token,
            device: Default::default(),
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    pub fn model(&self) -> &TrainModel {
        &self.model
    }

    pub fn into_model(self) -> TrainModel {
        self.model
    }

    pub fn out_dir(&self) -> &PathBuf {
        &self.config.out_dir
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.store
    }

    /// The pipeline job the next batch should come from; non-zero when resuming.
    pub fn first_batch_job(&self) -> u64 {
        self.context.batches_consumed
    }

    /// Train until a stop condition or a failure.
    ///
    /// # Arguments
    /// * `batches`: the training batches.
    /// * `validation`: held-out batches; without them there is no evaluation, no best
    ///   checkpoint and no early stopping.
    ///
    /// # Errors
    /// Failures (non-finite loss, persistence, pipeline errors) move the trainer to
    /// [`TrainingState::Failed`] and are returned.
    pub fn run<S: BatchSource>(
        &mut self,
        batches: &mut S,
        validation: Option<&[Batch]>,
    ) -> Result<StopReason, BasenjiError> {
        if self.state != TrainingState::Initialized {
            return Err(BasenjiError::InvalidConfig(format!(
                "a trainer can only run once (state: {})",
                self.state
            )));
        }
        let grad_clip = self.config.grad_clip_norm;
        if let Some(adam) = self.config.optimizer.adam(grad_clip) {
            self.run_with(adam.init(), batches, validation)
        } else if let Some(sgd) = self.config.optimizer.sgd(grad_clip) {
            self.run_with(sgd.init(), batches, validation)
        } else {
            Err(BasenjiError::InvalidConfig(format!(
                "unsupported optimizer {}",
                self.config.optimizer.name()
            )))
        }
    }

    fn run_with<O, S>(
        &mut self,
        mut optim: O,
        batches: &mut S,
        validation: Option<&[Batch]>,
    ) -> Result<StopReason, BasenjiError>
    where
        O: Optimizer<TrainModel, TrainBackend>,
        S: BatchSource,
    {
        if let Some(bytes) = self.optimizer_record.take() {
            match record_from_bytes::<TrainBackend, O::Record>(bytes, &self.device) {
                Ok(record) => optim = optim.load_record(record),
                Err(e) => return Err(self.fail(e)),
            }
        }

        let result = self
            .train_loop(&mut optim, batches, validation)
            .and_then(|reason| {
                self.save_checkpoint(&optim, CheckpointKind::Latest)?;
                Ok(reason)
            });
        match result {
            Ok(reason) => {
                info!(
                    step = self.context.step,
                    epoch = self.context.epoch,
                    dropped_examples = self.context.dropped_examples,
                    best_metric = self.context.best_metric,
                    "training stopped: {}",
                    reason
                );
                self.transition(TrainingState::Stopped(reason));
                Ok(reason)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn train_loop<O, S>(
        &mut self,
        optim: &mut O,
        batches: &mut S,
        validation: Option<&[Batch]>,
    ) -> Result<StopReason, BasenjiError>
    where
        O: Optimizer<TrainModel, TrainBackend>,
        S: BatchSource,
    {
        self.transition(TrainingState::Running);
        info!(
            step = self.context.step,
            max_steps = self.config.max_steps,
            optimizer = self.config.optimizer.name(),
            loss = %self.config.loss,
            "training started"
        );
        if validation.is_none() {
            warn!("no validation regions: evaluation and early stopping are disabled");
        }

        loop {
            if self.context.step >= self.config.max_steps {
                return Ok(StopReason::MaxSteps);
            }
            if self.token.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            let sampled = match batches.next_batch() {
                Ok(Some(sampled)) => sampled,
                Ok(None) => return Ok(StopReason::DataExhausted),
                Err(BasenjiError::Cancelled) => return Ok(StopReason::Cancelled),
                Err(e) => return Err(e),
            };
            self.context.batches_consumed += 1;
            self.context.epoch = sampled.epoch;
            if !sampled.dropped.is_empty() {
                let dropped = sampled.dropped.len() as u64;
                self.context.dropped_examples += dropped;
                self.metrics.append(&[MetricRecord::global(
                    self.context.step,
                    "dropped_examples",
                    dropped as f64,
                )])?;
            }
            let Some(batch) = sampled.batch else {
                debug!(epoch = sampled.epoch, index = sampled.index, "skipping empty batch");
                continue;
            };

            let (model, loss) = self.train_step(self.working_copy(), optim, &batch)?;
            self.model = model;
            self.context.step += 1;
            self.context.last_loss = Some(loss);
            let step = self.context.step;

            if step % self.config.log_interval == 0 {
                info!(step, epoch = self.context.epoch, loss, "training");
                self.metrics
                    .append(&[MetricRecord::global(step, "train_loss", loss)])?;
            }

            if let Some(validation) = validation {
                if self.config.eval_interval > 0 && step % self.config.eval_interval == 0 {
                    let report = self.evaluate(validation)?;
                    let metric = report.mean_pearson_r();
                    if self.context.record_evaluation(metric) {
                        info!(step, mean_pearson_r = metric, "new best model");
                        self.save_checkpoint(optim, CheckpointKind::Best)?;
                    } else {
                        info!(
                            step,
                            mean_pearson_r = metric,
                            rounds_without_improvement = self.context.rounds_without_improvement,
                            "no improvement"
                        );
                    }
                    if self.context.patience_exhausted(self.config.patience) {
                        return Ok(StopReason::EarlyStopping);
                    }
                }
            }

            if self.config.checkpoint_interval > 0 && step % self.config.checkpoint_interval == 0 {
                self.save_checkpoint(optim, CheckpointKind::Latest)?;
            }
        }
    }

    /// A copy of the committed model that shares no state with it.
    fn working_copy(&self) -> TrainModel {
        self.model_config.load::<TrainBackend>(
            self.model.clone().into_record(),
            self.window_len,
            self.track_names.len(),
            &self.device,
        )
    }

    /// One optimization step on a copy of the model; returns the updated model and the
    /// loss.
    fn train_step<O>(
        &self,
        model: TrainModel,
        optim: &mut O,
        batch: &Batch,
    ) -> Result<(TrainModel, f64), BasenjiError>
    where
        O: Optimizer<TrainModel, TrainBackend>,
    {
        let inputs = batch.input_tensor::<TrainBackend>(&self.device);
        let targets = batch.target_tensor::<TrainBackend>(&self.device);
        let predictions = model.forward(inputs);
        let loss = self.config.loss.forward(predictions, targets);

        let value = loss.clone().into_scalar().elem::<f64>();
        if !value.is_finite() {
            return Err(BasenjiError::DivergenceError {
                step: self.context.step + 1,
                loss: value,
            });
        }

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = optim.step(self.config.learning_rate, model, grads);
        Ok((model, value))
    }

    /// Evaluate the current parameters in inference mode and log the metrics.
    fn evaluate(&mut self, validation: &[Batch]) -> Result<EvaluationReport, BasenjiError> {
        let model = self.model.valid();
        let report = evaluate(&model, validation, &self.track_names)?;
        for track in &report.tracks {
            debug!(
                step = self.context.step,
                track = %track.track,
                pearson_r = track.pearson_r,
                r2 = track.r2,
                mse = track.mse,
                "validation"
            );
        }
        self.metrics.append(&report.to_records(self.context.step))?;
        Ok(report)
    }

    fn save_checkpoint<O>(&mut self, optim: &O, kind: CheckpointKind) -> Result<(), BasenjiError>
    where
        O: Optimizer<TrainModel, TrainBackend>,
    {
        self.transition(TrainingState::Checkpointing);
        let optimizer_record = record_to_bytes::<TrainBackend, _>(optim.to_record())?;
        let checkpoint = Checkpoint::new(self.meta(), &self.model, optimizer_record)?;
        match kind {
            CheckpointKind::Latest => self.store.save_latest(&checkpoint)?,
            CheckpointKind::Best => self.store.save_best(&checkpoint)?,
        }
        self.transition(TrainingState::Running);
        Ok(())
    }

    fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            context: self.context.clone(),
            model: self.model_config.clone(),
            window_len: self.window_len,
            track_names: self.track_names.clone(),
            optimizer: self.config.optimizer.name().to_string(),
        }
    }

    fn fail(&mut self, e: BasenjiError) -> BasenjiError {
        error!(step = self.context.step, error = %e, "training failed");
        self.transition(TrainingState::Failed(e.to_string()));
        e
    }

    fn transition(&mut self, next: TrainingState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "invalid training state transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "training state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SampledBatch;
    use crate::test_utilities::{small_run_config, synthetic_batches};
    use ndarray::Array2;
    use tempfile::tempdir;

    fn params(model: &TrainModel) -> Vec<f32> {
        model
            .head
            .weight
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    /// `batch` with every target set to `value`.
    fn filled(batch: &Batch, value: f32) -> Batch {
        let examples: Vec<_> = batch
            .examples()
            .iter()
            .cloned()
            .map(|mut e| {
                e.targets = Array2::from_elem(e.targets.raw_dim(), value);
                e
            })
            .collect();
        Batch::new(examples).unwrap()
    }

    /// Cancels its token once `remaining` batches have been handed out.
    struct CancelAfter {
        batches: std::vec::IntoIter<SampledBatch>,
        remaining: usize,
        token: CancellationToken,
    }

    impl BatchSource for CancelAfter {
        fn next_batch(&mut self) -> Result<Option<SampledBatch>, BasenjiError> {
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                self.token.cancel();
            }
            Ok(self.batches.next())
        }
    }

    #[test]
    fn test_runs_to_max_steps() {
        let dir = tempdir().unwrap();
        let mut config = small_run_config(dir.path());
        config.train.max_steps = 4;
        config.train.checkpoint_interval = 2;
        let mut trainer = Trainer::new(&config, CancellationToken::new()).unwrap();
        let before = params(trainer.model());

        let mut batches = synthetic_batches(6, 1).into_iter();
        let reason = trainer.run(&mut batches, None).unwrap();
        assert_eq!(reason, StopReason::MaxSteps);
        assert_eq!(trainer.state(), &TrainingState::Stopped(StopReason::MaxSteps));
        assert_eq!(trainer.context().step, 4);
        assert_ne!(params(trainer.model()), before);

        let latest = Checkpoint::read(trainer.checkpoints().latest_path()).unwrap();
        assert_eq!(latest.step, 4);
        assert!(trainer.run(&mut batches, None).is_err());
    }

    #[test]
    fn test_data_exhaustion_and_empty_batches() {
        let dir = tempdir().unwrap();
        let config = small_run_config(dir.path());
        let mut trainer = Trainer::new(&config, CancellationToken::new()).unwrap();
        let mut batches = synthetic_batches(2, 1);
        batches.insert(
            1,
            SampledBatch {
                epoch: 0,
                index: 1,
                batch: None,
                dropped: vec![],
            },
        );
        let reason = trainer.run(&mut batches.into_iter(), None).unwrap();
        assert_eq!(reason, StopReason::DataExhausted);
        assert_eq!(trainer.context().step, 2);
        assert_eq!(trainer.context().batches_consumed, 3);
    }

    #[test]
    fn test_cancellation() {
        let dir = tempdir().unwrap();
        let config = small_run_config(dir.path());
        let token = CancellationToken::new();
        token.cancel();
        let mut trainer = Trainer::new(&config, token).unwrap();
        let reason = trainer.run(&mut synthetic_batches(3, 1).into_iter(), None).unwrap();
        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(trainer.context().step, 0);
        // the final checkpoint is still flushed
        assert!(trainer.checkpoints().latest_path().exists());
    }

    #[test]
    fn test_nan_loss_fails_without_checkpoint() {
        let dir = tempdir().unwrap();
        let config = small_run_config(dir.path());
        let mut trainer = Trainer::new(&config, CancellationToken::new()).unwrap();

        let mut batches = synthetic_batches(2, 1);
        let mut poisoned = batches[0].clone();
        poisoned.batch = poisoned.batch.map(|batch| filled(&batch, f32::NAN));
        batches.insert(1, poisoned);

        let before = params(trainer.model());
        let result = trainer.run(&mut batches.into_iter(), None);
        assert!(matches!(result, Err(BasenjiError::DivergenceError { step: 2, .. })));
        assert!(matches!(trainer.state(), TrainingState::Failed(_)));
        assert_eq!(trainer.context().step, 1);
        assert_ne!(params(trainer.model()), before);
        assert!(params(trainer.model()).iter().all(|x| x.is_finite()));
        assert!(!trainer.checkpoints().latest_path().exists());
    }

    #[test]
    fn test_cancellation_mid_run_flushes_checkpoint() {
        let dir = tempdir().unwrap();
        let config = small_run_config(dir.path());
        let token = CancellationToken::new();
        let mut trainer = Trainer::new(&config, token.clone()).unwrap();
        let mut batches = CancelAfter {
            batches: synthetic_batches(6, 1).into_iter(),
            remaining: 2,
            token,
        };
        let reason = trainer.run(&mut batches, None).unwrap();
        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(trainer.state(), &TrainingState::Stopped(StopReason::Cancelled));
        assert_eq!(trainer.context().step, 2);
        let latest = Checkpoint::read(trainer.checkpoints().latest_path()).unwrap();
        assert_eq!(latest.step, 2);
    }

    #[test]
    fn test_early_stopping() {
        let dir = tempdir().unwrap();
        let mut config = small_run_config(dir.path());
        config.train.eval_interval = 1;
        config.train.patience = 1;
        let mut trainer = Trainer::new(&config, CancellationToken::new()).unwrap();

        // constant targets: every evaluation scores a correlation of 0, so only the
        // first one is an improvement
        let validation: Vec<Batch> = synthetic_batches(2, 5)
            .iter()
            .filter_map(|sampled| sampled.batch.as_ref())
            .map(|batch| filled(batch, 0.0))
            .collect();
        let mut batches = synthetic_batches(6, 1).into_iter();
        let reason = trainer.run(&mut batches, Some(&validation)).unwrap();

        assert_eq!(reason, StopReason::EarlyStopping);
        assert_eq!(
            trainer.state(),
            &TrainingState::Stopped(StopReason::EarlyStopping)
        );
        let context = trainer.context();
        assert_eq!(context.step, 2);
        assert_eq!(context.best_step, Some(1));
        assert_eq!(context.best_metric, Some(0.0));
        assert_eq!(context.rounds_without_improvement, 1);

        let best = Checkpoint::read(trainer.checkpoints().best_path()).unwrap();
        assert_eq!(Some(best.step), context.best_step);
        let latest = Checkpoint::read(trainer.checkpoints().latest_path()).unwrap();
        assert_eq!(latest.step, 2);
        assert_ne!(best.model_record, latest.model_record);
    }
}
