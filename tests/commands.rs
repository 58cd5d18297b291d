//! End-to-end runs of the subcommands on a synthetic genome written to disk.

use basenji::{
    commands::{basenji_evaluate, basenji_predict, basenji_train, basenji_windows},
    dataset::CancellationToken,
    prelude::*,
    test_utilities::{SyntheticRun, SMALL_BIN_WIDTH, SMALL_WINDOW_LEN},
    train::{
        checkpoint::{BEST_CHECKPOINT, LATEST_CHECKPOINT},
        metrics::METRICS_FILENAME,
        Checkpoint, MetricsLog, StopReason,
    },
};
use std::fs;
use tempfile::tempdir;

#[test]
fn test_train_evaluate_predict() {
    let run = SyntheticRun::new(3, 2_048).unwrap();
    let output = basenji_train(
        &run.config_path,
        None,
        None,
        None,
        None,
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(*output.value(), StopReason::MaxSteps);

    let out_dir = run.out_dir();
    let latest = out_dir.join(LATEST_CHECKPOINT);
    assert_eq!(Checkpoint::read(&latest).unwrap().step, 12);
    assert!(out_dir.join(BEST_CHECKPOINT).exists());

    let records = MetricsLog::read(out_dir.join(METRICS_FILENAME)).unwrap();
    let count = |metric: &str| records.iter().filter(|r| r.metric == metric).count();
    assert_eq!(count("train_loss"), 6);
    assert_eq!(count("mean_pearson_r"), 3);
    assert_eq!(count("pearson_r"), 6);
    assert!(records.iter().all(|r| r.value.is_finite()));

    // evaluation of the latest checkpoint on the configured held-out regions
    let table = run.path().join("evaluation.tsv");
    let evaluation = basenji_evaluate(&run.config_path, &latest, None, Some(&table)).unwrap();
    let report = evaluation.value();
    assert_eq!(report.tracks.len(), 2);
    assert_eq!(report.num_examples, 2_048 / SMALL_WINDOW_LEN as usize);
    let table = fs::read_to_string(table).unwrap();
    assert_eq!(table.lines().count(), 3);
    assert!(table.starts_with("track\tpearson_r\tr2\tmse\tbins\n"));

    // predictions for every bin and track of the held-out windows
    let predictions = run.path().join("predictions.tsv");
    let summary = basenji_predict(
        &run.config_path,
        &latest,
        &run.path().join("valid.bed"),
        Some(&predictions),
    )
    .unwrap();
    let windows = 2_048 / SMALL_WINDOW_LEN as usize;
    let bins = (SMALL_WINDOW_LEN / SMALL_BIN_WIDTH) as usize;
    assert_eq!(summary.value().windows, windows);
    assert_eq!(summary.value().dropped, 0);
    let text = fs::read_to_string(predictions).unwrap();
    assert_eq!(text.lines().count(), windows * bins * 2);
    let first: Vec<&str> = text.lines().next().unwrap().split('\t').collect();
    assert_eq!(first[..4], ["chr3", "0", "8", "a"]);
    assert!(first[4].parse::<f32>().unwrap() >= 0.0);
}

#[test]
fn test_train_overrides_and_resume() {
    let run = SyntheticRun::new(2, 1_024).unwrap();
    let out = run.path().join("short");
    let output = basenji_train(
        &run.config_path,
        Some(3),
        Some(&out),
        Some(2),
        None,
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(*output.value(), StopReason::MaxSteps);
    let latest = out.join(LATEST_CHECKPOINT);
    assert_eq!(Checkpoint::read(&latest).unwrap().step, 2);

    let output = basenji_train(
        &run.config_path,
        Some(3),
        Some(&out),
        Some(5),
        Some(&latest),
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(*output.value(), StopReason::MaxSteps);
    let checkpoint = Checkpoint::read(&latest).unwrap();
    assert_eq!(checkpoint.step, 5);
    assert_eq!(checkpoint.meta.context.batches_consumed, 5);

    // the metrics log was appended to, not truncated
    let records = MetricsLog::read(out.join(METRICS_FILENAME)).unwrap();
    let steps: Vec<u64> = records
        .iter()
        .filter(|r| r.metric == "train_loss")
        .map(|r| r.step)
        .collect();
    assert_eq!(steps, vec![2, 4]);
}

#[test]
fn test_cancelled_before_start() {
    let run = SyntheticRun::new(2, 1_024).unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let output = basenji_train(&run.config_path, None, None, None, None, token).unwrap();
    assert_eq!(*output.value(), StopReason::Cancelled);
    assert_eq!(
        Checkpoint::read(run.out_dir().join(LATEST_CHECKPOINT))
            .unwrap()
            .step,
        0
    );
}

#[test]
fn test_windows() {
    let dir = tempdir().unwrap();
    let seqlens = dir.path().join("genome.tsv");
    fs::write(&seqlens, "chr1\t1000\nchr2\t300\n").unwrap();
    let regions = dir.path().join("regions.bed");
    fs::write(&regions, "chr1\t100\t612\t.\t.\t-\nchr2\t0\t300\n").unwrap();
    let blacklist = dir.path().join("blacklist.bed");
    fs::write(&blacklist, "chr1\t300\t310\n").unwrap();

    let output = dir.path().join("windows.bed");
    let result = basenji_windows(
        &seqlens,
        Some(&regions),
        128,
        None,
        Some(&blacklist),
        0.0,
        Some(&output),
    )
    .unwrap();
    // chr1: 100, (228 is blacklisted), 356, 484; chr2: 0, 128
    assert_eq!(*result.value(), 5);
    let text = fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "chr1\t100\t228\t.\t.\t-");
    assert_eq!(lines[1], "chr1\t356\t484\t.\t.\t-");
    assert_eq!(lines[4], "chr2\t128\t256\t.\t.\t.");
}

#[test]
fn test_invalid_region_produces_no_output() {
    let dir = tempdir().unwrap();
    let seqlens = dir.path().join("genome.tsv");
    fs::write(&seqlens, "chr1\t10000\n").unwrap();
    let regions = dir.path().join("regions.bed");
    fs::write(&regions, "chr1\t500\t100\n").unwrap();

    let output = dir.path().join("windows.bed");
    let result = basenji_windows(&seqlens, Some(&regions), 64, None, None, 0.0, Some(&output));
    assert!(matches!(result, Err(BasenjiError::InvalidRegion { .. })));
    assert!(!output.exists());
}
