//! Test cases and test utility functions.
//!
//! The synthetic data here has a signal that is a deterministic function of the
//! sequence: track `a` is 1.0 on every `A` and track `t` is 1.0 on every `T`. The two
//! are strand pairs, so reverse complement augmentation keeps sequence and targets
//! consistent, and a model can actually learn it.

use indexmap::IndexMap;
use ndarray::Array1;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::{
    dataset::{AugmentConfig, BatchSampler, ExampleSource, SampledBatch, SamplerConfig},
    encoding::{OneHotEncoder, ALPHABET},
    model::{ConvStage, ModelConfig},
    ranges::windows::WindowIndexer,
    sequences::{
        nucleotide::{NucleotideSequences, Nucleotides},
        numeric::{NumericTrack, TargetTracks, TrackSpec},
    },
    train::{DataConfig, RunConfig, TrainConfig},
    Position,
};

/// The window length of the small synthetic runs.
pub const SMALL_WINDOW_LEN: Position = 64;

/// The pooling factor of [`small_model_config()`].
pub const SMALL_BIN_WIDTH: Position = 8;

/// Build a random nucleotide sequence.
pub fn random_sequence(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Write `(name, sequence)` records to a FASTA file.
pub fn write_fasta(filepath: impl AsRef<Path>, records: &[(&str, &str)]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(filepath)?);
    for (name, seq) in records {
        writeln!(writer, ">{}", name)?;
        for line in seq.as_bytes().chunks(60) {
            writer.write_all(line)?;
            writer.write_all(b"\n")?;
        }
    }
    writer.flush()
}

/// A random genome of `num_chroms` sequences named `chr1`, `chr2`, ...
pub fn random_genome(num_chroms: usize, chrom_len: usize, seed: u64) -> Vec<(String, String)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=num_chroms)
        .map(|i| (format!("chr{}", i), random_sequence(&mut rng, chrom_len)))
        .collect()
}

/// The per-basepair indicator of `base` along `seq`.
pub fn base_indicator(seq: &str, base: u8) -> Array1<f32> {
    seq.bytes()
        .map(|b| if b.eq_ignore_ascii_case(&base) { 1.0 } else { 0.0 })
        .collect()
}

fn indicator_track(
    name: &str,
    pair: &str,
    base: u8,
    genome: &[(String, String)],
) -> NumericTrack {
    let mut spec = TrackSpec::new(name, format!("{}.bedgraph", name));
    spec.strand_pair = Some(pair.to_string());
    let arrays: IndexMap<String, Array1<f32>> = genome
        .iter()
        .map(|(seqname, seq)| (seqname.clone(), base_indicator(seq, base)))
        .collect();
    NumericTrack::from_arrays(spec, arrays).expect("valid synthetic track")
}

/// A single 16bp sequence, `AAAACCCCGGGGTTTT`, with one summed track whose value is
/// the position; windows of 8bp and bins of 4bp.
pub fn tiny_source() -> ExampleSource {
    let seq = "AAAACCCCGGGGTTTT";
    let genome = NucleotideSequences::from_pairs([("chr1", Nucleotides::from(seq))])
        .expect("valid genome");
    let arrays = IndexMap::from([(
        "chr1".to_string(),
        Array1::from_iter((0..seq.len()).map(|i| i as f32)),
    )]);
    let track = NumericTrack::from_arrays(TrackSpec::new("position", "position.bedgraph"), arrays)
        .expect("valid track");
    let targets = TargetTracks::new(vec![track]).expect("valid targets");
    ExampleSource::new(genome, targets, OneHotEncoder::default(), 8, 4).expect("valid source")
}

/// A random genome with the strand-paired `a` and `t` indicator tracks.
pub fn synthetic_source(
    num_chroms: usize,
    chrom_len: usize,
    window_len: Position,
    bin_width: Position,
) -> ExampleSource {
    let genome = random_genome(num_chroms, chrom_len, 1);
    let tracks = vec![
        indicator_track("a", "t", b'A', &genome),
        indicator_track("t", "a", b'T', &genome),
    ];
    let sequences = NucleotideSequences::from_pairs(
        genome
            .iter()
            .map(|(name, seq)| (name.as_str(), Nucleotides::from(seq.as_str()))),
    )
    .expect("valid genome");
    let targets = TargetTracks::new(tracks).expect("valid targets");
    ExampleSource::new(
        sequences,
        targets,
        OneHotEncoder::default(),
        window_len,
        bin_width,
    )
    .expect("valid source")
}

/// A model small enough to train in a unit test, with a pooling factor of
/// [`SMALL_BIN_WIDTH`].
pub fn small_model_config() -> ModelConfig {
    ModelConfig {
        conv: vec![
            ConvStage::new(8, 5, 2),
            ConvStage::new(8, 3, 2),
            ConvStage::new(8, 3, 2),
        ],
        hidden_size: 8,
        dropout: 0.0,
        ..Default::default()
    }
}

/// The `a`/`t` track configuration of the synthetic runs, with paths under `dir`.
pub fn synthetic_track_specs(dir: &Path) -> Vec<TrackSpec> {
    ["a", "t"]
        .iter()
        .zip(["t", "a"])
        .map(|(name, pair)| {
            let mut spec = TrackSpec::new(*name, dir.join(format!("{}.bedgraph", name)));
            spec.strand_pair = Some(pair.to_string());
            spec
        })
        .collect()
}

/// A run configuration for the synthetic data, writing to `dir`.
///
/// The data paths point into `dir` but nothing is written there; use
/// [`SyntheticRun`] for a run with its files on disk.
pub fn small_run_config(dir: &Path) -> RunConfig {
    RunConfig {
        data: DataConfig {
            fasta: dir.join("genome.fa"),
            seqlens: None,
            train_regions: None,
            valid_regions: None,
            blacklist: None,
            max_blacklist_fraction: 0.0,
            window_len: SMALL_WINDOW_LEN,
            step: None,
            neutral: Default::default(),
            tracks: synthetic_track_specs(dir),
        },
        model: small_model_config(),
        train: TrainConfig {
            batch_size: 4,
            learning_rate: 1e-2,
            max_steps: 100,
            checkpoint_interval: 100,
            eval_interval: 0,
            log_interval: 1,
            io_retries: 0,
            out_dir: dir.join("run"),
            ..Default::default()
        },
    }
}

/// The first `n` training batches over `synthetic_source(2, 1000, 64, 8)`, in the
/// order a sampler seeded with `seed` produces them.
pub fn synthetic_batches(n: usize, seed: u64) -> Vec<SampledBatch> {
    let source = Arc::new(synthetic_source(
        2,
        1_000,
        SMALL_WINDOW_LEN,
        SMALL_BIN_WIDTH,
    ));
    let indexer =
        WindowIndexer::from_seqlens(source.seqlens(), SMALL_WINDOW_LEN).expect("valid windows");
    let config = SamplerConfig {
        batch_size: 4,
        seed,
        shuffle: true,
        strict: false,
        augment: AugmentConfig::default(),
    };
    let sampler = BatchSampler::new(source, &indexer, config).expect("valid sampler");
    let mut batches = Vec::with_capacity(n);
    let mut epoch = 0;
    while batches.len() < n {
        let sampled = sampler.collect_epoch(epoch).expect("synthetic data has no errors");
        batches.extend(sampled.into_iter().take(n - batches.len()));
        epoch += 1;
    }
    batches
}

/// Write a bedGraph of the runs of `base` along each sequence.
fn write_indicator_bedgraph(
    filepath: &Path,
    genome: &[(String, String)],
    base: u8,
) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(filepath)?);
    for (seqname, seq) in genome {
        let bytes = seq.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != base {
                i += 1;
                continue;
            }
            let start = i;
            while i < bytes.len() && bytes[i] == base {
                i += 1;
            }
            writeln!(writer, "{}\t{}\t{}\t1", seqname, start, i)?;
        }
    }
    writer.flush()
}

/// A complete synthetic run on disk: a random genome, its `a`/`t` bedGraph tracks,
/// train and validation regions, and a `run.toml` that ties them together.
pub struct SyntheticRun {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub genome: Vec<(String, String)>,
}

impl SyntheticRun {
    /// Write the run files: `num_chroms` sequences of `chrom_len` basepairs. The last
    /// sequence holds the validation regions.
    pub fn new(num_chroms: usize, chrom_len: usize) -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path();
        let genome = random_genome(num_chroms, chrom_len, 7);

        let records: Vec<(&str, &str)> = genome
            .iter()
            .map(|(name, seq)| (name.as_str(), seq.as_str()))
            .collect();
        write_fasta(path.join("genome.fa"), &records)?;

        let mut seqlens = BufWriter::new(File::create(path.join("genome.tsv"))?);
        for (name, seq) in &genome {
            writeln!(seqlens, "{}\t{}", name, seq.len())?;
        }
        seqlens.flush()?;

        write_indicator_bedgraph(&path.join("a.bedgraph"), &genome, b'A')?;
        write_indicator_bedgraph(&path.join("t.bedgraph"), &genome, b'T')?;

        let (valid, train) = genome.split_last().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "at least one sequence is needed")
        })?;
        let mut train_bed = BufWriter::new(File::create(path.join("train.bed"))?);
        for (name, seq) in train {
            writeln!(train_bed, "{}\t0\t{}", name, seq.len())?;
        }
        train_bed.flush()?;
        std::fs::write(
            path.join("valid.bed"),
            format!("{}\t0\t{}\n", valid.0, valid.1.len()),
        )?;

        let config_path = path.join("run.toml");
        std::fs::write(&config_path, Self::config_text())?;
        Ok(Self {
            dir,
            config_path,
            genome,
        })
    }

    fn config_text() -> String {
        format!(
            r#"
[data]
fasta = "genome.fa"
seqlens = "genome.tsv"
train_regions = "train.bed"
valid_regions = "valid.bed"
window_len = {window_len}

[[data.tracks]]
name = "a"
path = "a.bedgraph"
strand_pair = "t"

[[data.tracks]]
name = "t"
path = "t.bedgraph"
strand_pair = "a"

[model]
hidden_size = 8
dropout = 0.0

[[model.conv]]
filters = 8
kernel_size = 5
pool = 2

[[model.conv]]
filters = 8
kernel_size = 3
pool = 2

[[model.conv]]
filters = 8
kernel_size = 3
pool = 2

[train]
batch_size = 4
learning_rate = 0.01
max_steps = 12
checkpoint_interval = 4
eval_interval = 4
patience = 0
log_interval = 2
io_retries = 0
out_dir = "run"

[train.pipeline]
num_workers = 2
prefetch = 4
"#,
            window_len = SMALL_WINDOW_LEN
        )
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("run")
    }
}
