//! The implementations of the `basenji` subcommands.
//!
//! Each command returns a [`CommandOutput`], whose [`Report`] lists anything that was
//! skipped along the way.

use indexmap::IndexMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    dataset::{Batch, BatchPipeline, BatchSampler, CancellationToken, ExampleSource, SamplerConfig},
    encoding::OneHotEncoder,
    evaluate::{evaluate, EvaluationReport},
    io::{read_seqlens, BedIterator, OutputStream},
    predict::{PredictionSummary, PredictionWriter},
    ranges::{coitrees::Blacklist, windows::WindowIndexer, GenomicInterval},
    reporting::{CommandOutput, Report},
    sequences::{
        nucleotide::NucleotideSequences,
        numeric::{strand_swap_permutation, TargetTracks},
    },
    train::{Checkpoint, DataConfig, RunConfig, StopReason, Trainer},
    traits::{Sequences, TsvSerialize},
    BasenjiError, InferenceBackend, Position,
};

/// Read the regions of a BED file.
pub fn read_regions(filepath: &PathBuf) -> Result<Vec<GenomicInterval>, BasenjiError> {
    BedIterator::new(filepath)?.collect()
}

fn read_blacklist(filepath: &PathBuf) -> Result<Blacklist, BasenjiError> {
    Blacklist::from_intervals(read_regions(filepath)?)
}

/// Load the genome of a run, restricted to the sequences of its `seqlens` file if one
/// is given.
///
/// # Errors
/// Returns [`BasenjiError::InvalidGenomeFile`] if the FASTA and the `seqlens` file
/// disagree on a sequence length.
pub fn load_genome(
    data: &DataConfig,
) -> Result<(NucleotideSequences, IndexMap<String, Position>), BasenjiError> {
    let Some(seqlens_path) = &data.seqlens else {
        let genome = NucleotideSequences::from_fasta(&data.fasta, None)?;
        let seqlens = genome.seqlens()?;
        return Ok((genome, seqlens));
    };
    let seqlens = read_seqlens(seqlens_path)?;
    let seqnames: Vec<String> = seqlens.keys().cloned().collect();
    let genome = NucleotideSequences::from_fasta(&data.fasta, Some(seqnames))?;
    for (seqname, length) in &seqlens {
        let fasta_length = genome.get_sequence_length(seqname)?;
        if fasta_length != *length {
            return Err(BasenjiError::InvalidGenomeFile(format!(
                "sequence '{}' has length {} in the FASTA but {} in '{}'",
                seqname,
                fasta_length,
                length,
                seqlens_path.display()
            )));
        }
    }
    Ok((genome, seqlens))
}

/// The windows of `regions` (or of the whole genome), honoring the run's step and
/// blacklist.
fn build_indexer(
    data: &DataConfig,
    seqlens: &IndexMap<String, Position>,
    regions: Option<&PathBuf>,
    step: Position,
) -> Result<WindowIndexer, BasenjiError> {
    let indexer = match regions {
        Some(path) => WindowIndexer::new(read_regions(path)?, seqlens, data.window_len)?,
        None => WindowIndexer::from_seqlens(seqlens, data.window_len)?,
    };
    let indexer = indexer.with_step(step)?;
    match &data.blacklist {
        Some(path) => indexer.with_blacklist(read_blacklist(path)?, data.max_blacklist_fraction),
        None => Ok(indexer),
    }
}

/// Load the genome and target tracks of a run into an [`ExampleSource`].
pub fn build_source(config: &RunConfig) -> Result<ExampleSource, BasenjiError> {
    let (genome, seqlens) = load_genome(&config.data)?;
    let targets = TargetTracks::load(&config.data.tracks, &seqlens)?;
    info!(
        sequences = seqlens.len(),
        tracks = targets.len(),
        "loaded genome and targets"
    );
    ExampleSource::new(
        genome,
        targets,
        OneHotEncoder::new(config.data.neutral),
        config.data.window_len,
        config.bin_width(),
    )
}

/// Build every held-out batch of `regions`, without augmentation.
fn held_out_batches(
    config: &RunConfig,
    source: Arc<ExampleSource>,
    regions: &PathBuf,
    report: &mut Report,
) -> Result<Vec<Batch>, BasenjiError> {
    let indexer = build_indexer(
        &config.data,
        source.seqlens(),
        Some(regions),
        config.data.window_len,
    )?;
    let sampler_config = SamplerConfig::evaluation(config.train.batch_size, config.train.strict);
    let sampler = BatchSampler::new(source, &indexer, sampler_config)?;
    let sampled = sampler.collect_epoch(0)?;
    let dropped: usize = sampled.iter().map(|s| s.dropped.len()).sum();
    report.add_skipped(dropped, "held-out examples", "data errors");
    let batches: Vec<Batch> = sampled.into_iter().filter_map(|s| s.batch).collect();
    if batches.is_empty() {
        return Err(BasenjiError::NoExamples(regions.display().to_string()));
    }
    debug!(batches = batches.len(), "built held-out batches");
    Ok(batches)
}

fn check_checkpoint(config: &RunConfig, checkpoint: &Checkpoint) -> Result<(), BasenjiError> {
    if checkpoint.meta.track_names != config.track_names()
        || checkpoint.meta.window_len != config.data.window_len as usize
    {
        return Err(BasenjiError::InvalidConfig(format!(
            "the checkpoint predicts tracks {:?} from {}bp windows, the configuration lists \
             {:?} and {}bp windows",
            checkpoint.meta.track_names,
            checkpoint.meta.window_len,
            config.track_names(),
            config.data.window_len
        )));
    }
    Ok(())
}

fn output_writer(output: Option<&PathBuf>) -> std::io::Result<Box<dyn Write>> {
    output
        .map_or(OutputStream::new_stdout(None), |file| {
            OutputStream::new(file, None)
        })
        .writer()
}

/// Write the windows of the regions in a BED file (or of whole sequences) as BED.
#[allow(clippy::too_many_arguments)]
pub fn basenji_windows(
    seqlens: &PathBuf,
    regions: Option<&PathBuf>,
    width: Position,
    step: Option<Position>,
    blacklist: Option<&PathBuf>,
    max_blacklist_fraction: f64,
    output: Option<&PathBuf>,
) -> Result<CommandOutput<usize>, BasenjiError> {
    let seqlens = read_seqlens(seqlens)?;
    let indexer = match regions {
        Some(path) => WindowIndexer::new(read_regions(path)?, &seqlens, width)?,
        None => WindowIndexer::from_seqlens(&seqlens, width)?,
    };
    let mut indexer = indexer.with_step(step.unwrap_or(width))?;
    if let Some(path) = blacklist {
        indexer = indexer.with_blacklist(read_blacklist(path)?, max_blacklist_fraction)?;
    }

    let mut writer = output_writer(output)?;
    let mut num_windows = 0;
    for window in &indexer {
        writeln!(writer, "{}", window.to_tsv())?;
        num_windows += 1;
    }
    writer.flush()?;

    let mut report = Report::new();
    if num_windows == 0 {
        report.add_issue(format!(
            "no {}bp windows fit in the {} regions",
            width,
            indexer.regions().len()
        ));
    }
    Ok(CommandOutput::new(num_windows, report))
}

/// Train a model as described by a run configuration file.
///
/// # Arguments
/// * `config_path`: the TOML run configuration.
/// * `seed`, `out_dir`, `max_steps`: overrides of the configuration's values.
/// * `resume`: a checkpoint to continue from.
/// * `token`: cancels the run at the next step boundary.
pub fn basenji_train(
    config_path: &PathBuf,
    seed: Option<u64>,
    out_dir: Option<&PathBuf>,
    max_steps: Option<u64>,
    resume: Option<&PathBuf>,
    token: CancellationToken,
) -> Result<CommandOutput<StopReason>, BasenjiError> {
    let config = RunConfig::from_file(config_path)?.with_overrides(
        seed,
        out_dir.cloned(),
        max_steps,
    );
    config.validate()?;
    let mut report = Report::new();

    let source = Arc::new(build_source(&config)?);
    let train_indexer = build_indexer(
        &config.data,
        source.seqlens(),
        config.data.train_regions.as_ref(),
        config.data.step(),
    )?;
    let sampler = Arc::new(BatchSampler::new(
        Arc::clone(&source),
        &train_indexer,
        config.train.sampler_config(),
    )?);
    info!(
        windows = sampler.num_windows(),
        batches_per_epoch = sampler.num_batches(),
        "indexed training windows"
    );

    let validation = match &config.data.valid_regions {
        Some(path) => Some(held_out_batches(&config, source, path, &mut report)?),
        None => None,
    };

    let mut trainer = match resume {
        Some(path) => Trainer::resume(&config, Checkpoint::read(path)?, token.clone())?,
        None => Trainer::new(&config, token.clone())?,
    };
    let mut pipeline = BatchPipeline::spawn_from(
        sampler,
        &config.train.pipeline,
        token,
        trainer.first_batch_job(),
    )?;
    let reason = trainer.run(&mut pipeline, validation.as_deref())?;

    report.add_skipped(
        trainer.context().dropped_examples as usize,
        "training examples",
        "data errors",
    );
    if let Some(best) = trainer.context().best_metric {
        info!(
            best_step = trainer.context().best_step,
            mean_pearson_r = best,
            "best validation model"
        );
    }
    Ok(CommandOutput::new(reason, report))
}

/// Evaluate a checkpoint on the held-out regions of a run, writing a per-track table.
pub fn basenji_evaluate(
    config_path: &PathBuf,
    checkpoint_path: &PathBuf,
    regions: Option<&PathBuf>,
    output: Option<&PathBuf>,
) -> Result<CommandOutput<EvaluationReport>, BasenjiError> {
    let config = RunConfig::from_file(config_path)?;
    config.validate()?;
    let checkpoint = Checkpoint::read(checkpoint_path)?;
    check_checkpoint(&config, &checkpoint)?;
    let regions = regions.or(config.data.valid_regions.as_ref()).ok_or_else(|| {
        BasenjiError::InvalidConfig(
            "evaluation needs held-out regions: set data.valid_regions or pass --regions"
                .to_string(),
        )
    })?;

    let mut report = Report::new();
    let source = Arc::new(build_source(&config)?);
    let batches = held_out_batches(&config, source, regions, &mut report)?;
    let model = checkpoint.load_model::<InferenceBackend>(&Default::default())?;
    let evaluation = evaluate(&model, &batches, &config.track_names())?;

    let mut writer = output_writer(output)?;
    writeln!(writer, "track\tpearson_r\tr2\tmse\tbins")?;
    for track in &evaluation.tracks {
        writeln!(
            writer,
            "{}\t{:.6}\t{:.6}\t{:.6}\t{}",
            track.track, track.pearson_r, track.r2, track.mse, track.count
        )?;
    }
    writer.flush()?;
    info!(
        step = checkpoint.step,
        examples = evaluation.num_examples,
        mean_pearson_r = evaluation.mean_pearson_r(),
        "evaluated checkpoint"
    );
    Ok(CommandOutput::new(evaluation, report))
}

/// Write per-bin predictions of a checkpoint over the windows of a BED file.
///
/// Windows are non-overlapping; a window on the `-` strand is predicted on the reverse
/// complement and reported in forward coordinates.
pub fn basenji_predict(
    config_path: &PathBuf,
    checkpoint_path: &PathBuf,
    regions: &PathBuf,
    output: Option<&PathBuf>,
) -> Result<CommandOutput<PredictionSummary>, BasenjiError> {
    let config = RunConfig::from_file(config_path)?;
    config.validate()?;
    let checkpoint = Checkpoint::read(checkpoint_path)?;
    check_checkpoint(&config, &checkpoint)?;

    let (genome, seqlens) = load_genome(&config.data)?;
    let indexer = build_indexer(&config.data, &seqlens, Some(regions), config.data.window_len)?;
    let model = checkpoint.load_model::<InferenceBackend>(&Default::default())?;
    let writer = PredictionWriter::new(
        &model,
        &genome,
        OneHotEncoder::new(config.data.neutral),
        config.track_names(),
        strand_swap_permutation(&config.data.tracks)?,
        config.data.window_len,
        config.bin_width(),
        config.train.batch_size,
    )?
    .with_strict(config.train.strict);

    let mut output = output_writer(output)?;
    let summary = writer.write(indexer.iter(), &mut output)?;

    let mut report = Report::new();
    report.add_skipped(summary.dropped, "windows", "data errors");
    Ok(CommandOutput::new(summary, report))
}
