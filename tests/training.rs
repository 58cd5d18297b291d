//! Training loop properties: reproducibility, checkpoint round trips and failure
//! behavior.

use basenji::{
    dataset::{
        AugmentConfig, BatchPipeline, BatchSampler, CancellationToken, PipelineConfig,
        SamplerConfig,
    },
    model::SeqSignalModel,
    prelude::*,
    ranges::windows::WindowIndexer,
    test_utilities::{
        small_run_config, synthetic_batches, synthetic_source, SMALL_BIN_WIDTH, SMALL_WINDOW_LEN,
    },
    train::{
        checkpoint::record_to_bytes, Checkpoint, RunConfig, StopReason, Trainer, TrainingState,
    },
    TrainBackend,
};
use burn::module::Module;
use std::sync::Arc;
use tempfile::tempdir;

fn model_bytes(model: &SeqSignalModel<TrainBackend>) -> Vec<u8> {
    record_to_bytes::<TrainBackend, _>(model.clone().into_record()).unwrap()
}

/// An independent model with the parameters and statistics of `model`.
fn copy_of(
    config: &RunConfig,
    model: &SeqSignalModel<TrainBackend>,
) -> SeqSignalModel<TrainBackend> {
    config.model.load::<TrainBackend>(
        model.clone().into_record(),
        config.data.window_len as usize,
        config.data.tracks.len(),
        &Default::default(),
    )
}

#[test]
fn test_fixed_seed_and_parameters_reproduce() {
    let dir = tempdir().unwrap();
    let mut config = small_run_config(dir.path());
    config.train.max_steps = 5;
    let initial = Trainer::new(&config, CancellationToken::new())
        .unwrap()
        .into_model();

    let train = |out: &str| {
        let mut config = config.clone();
        config.train.out_dir = dir.path().join(out);
        let mut trainer =
            Trainer::with_model(&config, copy_of(&config, &initial), CancellationToken::new())
                .unwrap();
        let reason = trainer
            .run(&mut synthetic_batches(8, 3).into_iter(), None)
            .unwrap();
        assert_eq!(reason, StopReason::MaxSteps);
        model_bytes(trainer.model())
    };
    let first = train("first");
    let second = train("second");
    assert_eq!(first, second);
    assert_ne!(first, model_bytes(&initial));
}

#[test]
fn test_concurrent_initialization_is_reproducible() {
    let dir = tempdir().unwrap();
    let config = small_run_config(dir.path());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let mut config = config.clone();
            config.train.out_dir = dir.path().join(format!("init-{}", i));
            std::thread::spawn(move || {
                let trainer = Trainer::new(&config, CancellationToken::new()).unwrap();
                model_bytes(trainer.model())
            })
        })
        .collect();
    let models: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(models.windows(2).all(|pair| pair[0] == pair[1]));

    let mut other = config.clone();
    other.train.seed += 1;
    other.train.out_dir = dir.path().join("other");
    let trainer = Trainer::new(&other, CancellationToken::new()).unwrap();
    assert_ne!(model_bytes(trainer.model()), models[0]);
}

#[test]
fn test_checkpoint_round_trip() {
    let dir = tempdir().unwrap();
    let mut config = small_run_config(dir.path());
    config.train.max_steps = 3;
    let mut trainer = Trainer::new(&config, CancellationToken::new()).unwrap();
    trainer
        .run(&mut synthetic_batches(3, 9).into_iter(), None)
        .unwrap();

    let checkpoint = Checkpoint::read(trainer.checkpoints().latest_path()).unwrap();
    assert_eq!(checkpoint.step, 3);
    assert_eq!(checkpoint.meta.context.step, 3);
    assert_eq!(checkpoint.meta.track_names, vec!["a", "t"]);

    let restored = checkpoint
        .load_model::<TrainBackend>(&Default::default())
        .unwrap();
    assert_eq!(model_bytes(&restored), model_bytes(trainer.model()));

    // decoding a re-encoded checkpoint gives the same bytes
    let encoded = checkpoint.encode().unwrap();
    assert_eq!(Checkpoint::decode(&encoded).unwrap().encode().unwrap(), encoded);
}

#[test]
fn test_nan_loss_keeps_last_checkpoint() {
    let dir = tempdir().unwrap();
    let mut config = small_run_config(dir.path());
    config.train.checkpoint_interval = 2;
    let mut trainer = Trainer::new(&config, CancellationToken::new()).unwrap();

    let mut batches = synthetic_batches(4, 2);
    if let Some(batch) = batches[2].batch.as_mut() {
        let examples: Vec<_> = batch
            .examples()
            .iter()
            .cloned()
            .map(|mut e| {
                e.targets.fill(f32::NAN);
                e
            })
            .collect();
        *batch = Batch::new(examples).unwrap();
    }

    let result = trainer.run(&mut batches.into_iter(), None);
    assert!(matches!(
        result,
        Err(BasenjiError::DivergenceError { step: 3, .. })
    ));
    assert!(matches!(trainer.state(), TrainingState::Failed(_)));

    // the checkpoint of step 2 is intact and matches the uncorrupted parameters
    let checkpoint = Checkpoint::read(trainer.checkpoints().latest_path()).unwrap();
    assert_eq!(checkpoint.step, 2);
    let restored = checkpoint
        .load_model::<TrainBackend>(&Default::default())
        .unwrap();
    assert_eq!(model_bytes(&restored), model_bytes(trainer.model()));
}

fn pipeline(num_workers: usize, first_job: u64) -> BatchPipeline {
    let source = Arc::new(synthetic_source(
        2,
        1_000,
        SMALL_WINDOW_LEN,
        SMALL_BIN_WIDTH,
    ));
    let indexer = WindowIndexer::from_seqlens(source.seqlens(), SMALL_WINDOW_LEN)
        .unwrap()
        .with_step(SMALL_WINDOW_LEN / 2)
        .unwrap();
    let sampler_config = SamplerConfig {
        batch_size: 4,
        seed: 11,
        shuffle: true,
        strict: false,
        augment: AugmentConfig {
            reverse_complement: true,
            shifts: vec![-1, 0, 1],
        },
    };
    let sampler = Arc::new(BatchSampler::new(source, &indexer, sampler_config).unwrap());
    let config = PipelineConfig {
        num_workers,
        prefetch: 3,
        max_epochs: None,
    };
    BatchPipeline::spawn_from(sampler, &config, CancellationToken::new(), first_job).unwrap()
}

#[test]
fn test_training_independent_of_worker_count() {
    let dir = tempdir().unwrap();
    let mut config = small_run_config(dir.path());
    config.train.max_steps = 6;
    let initial = Trainer::new(&config, CancellationToken::new())
        .unwrap()
        .into_model();

    let train = |num_workers: usize| {
        let mut config = config.clone();
        config.train.out_dir = dir.path().join(format!("workers-{}", num_workers));
        let mut trainer =
            Trainer::with_model(&config, copy_of(&config, &initial), CancellationToken::new())
                .unwrap();
        trainer.run(&mut pipeline(num_workers, 0), None).unwrap();
        model_bytes(trainer.model())
    };
    assert_eq!(train(1), train(4));
}

#[test]
fn test_resume_continues_the_run() {
    let dir = tempdir().unwrap();
    let mut config = small_run_config(dir.path());
    config.train.max_steps = 3;
    let mut trainer = Trainer::new(&config, CancellationToken::new()).unwrap();
    trainer.run(&mut pipeline(2, 0), None).unwrap();
    let checkpoint = Checkpoint::read(trainer.checkpoints().latest_path()).unwrap();

    config.train.max_steps = 6;
    let mut resumed = Trainer::resume(&config, checkpoint, CancellationToken::new()).unwrap();
    assert_eq!(resumed.context().step, 3);
    let first_job = resumed.first_batch_job();
    assert_eq!(first_job, 3);
    let reason = resumed.run(&mut pipeline(2, first_job), None).unwrap();
    assert_eq!(reason, StopReason::MaxSteps);
    assert_eq!(resumed.context().step, 6);
    assert_eq!(resumed.context().batches_consumed, 6);

    // a different optimizer cannot pick up the optimizer state
    let checkpoint = Checkpoint::read(resumed.checkpoints().latest_path()).unwrap();
    config.train.optimizer = basenji::train::OptimizerConfig::Sgd { momentum: None };
    assert!(Trainer::resume(&config, checkpoint, CancellationToken::new()).is_err());
}
