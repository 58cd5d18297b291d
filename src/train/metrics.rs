//! The CSV metrics log.
//!
//! One record per line, `step,track,metric,value`, e.g.
//!
//! ```text
//! step,track,metric,value
//! 50,*,train_loss,0.8312
//! 100,*,dropped_examples,2
//! 500,dnase,pearson_r,0.412
//! 500,*,mean_pearson_r,0.398
//! ```
//!
//! Metrics that are not specific to a track use the track name [`ALL_TRACKS`].

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{io::file::with_retries, BasenjiError};

/// The track column of run-wide metrics.
pub const ALL_TRACKS: &str = "*";

/// The metrics log file name in a run directory.
pub const METRICS_FILENAME: &str = "metrics.csv";

/// One line of the metrics log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: u64,
    pub track: String,
    pub metric: String,
    pub value: f64,
}

impl MetricRecord {
    pub fn new(step: u64, track: impl Into<String>, metric: impl Into<String>, value: f64) -> Self {
        Self {
            step,
            track: track.into(),
            metric: metric.into(),
            value,
        }
    }

    /// A run-wide metric.
    pub fn global(step: u64, metric: impl Into<String>, value: f64) -> Self {
        Self::new(step, ALL_TRACKS, metric, value)
    }
}

/// An append-only CSV log of [`MetricRecord`]s.
#[derive(Clone, Debug)]
pub struct MetricsLog {
    filepath: PathBuf,
    retries: usize,
}

impl MetricsLog {
    /// Open the log at `filepath`.
    ///
    /// # Arguments
    /// * `filepath`: the CSV file.
    /// * `retries`: retries of each failed write.
    /// * `append`: keep existing records (when resuming a run); otherwise the file is
    ///   truncated.
    pub fn open(
        filepath: impl Into<PathBuf>,
        retries: usize,
        append: bool,
    ) -> Result<Self, BasenjiError> {
        let filepath = filepath.into();
        let needs_header = !append || !filepath.exists();
        if needs_header {
            with_retries(&filepath, retries, || {
                let mut file = File::create(&filepath)?;
                file.write_all(b"step,track,metric,value\n")?;
                file.sync_data()
            })?;
        }
        Ok(Self { filepath, retries })
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    /// Append records. Each attempt first cuts the file back to its length before the
    /// append, so a retry never leaves part of a failed attempt behind.
    pub fn append(&self, records: &[MetricRecord]) -> Result<(), BasenjiError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for record in records {
            writer.serialize(record)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| BasenjiError::IOError(e.into_error()))?;
        let offset = with_retries(&self.filepath, self.retries, || {
            fs::metadata(&self.filepath).map(|m| m.len())
        })?;
        with_retries(&self.filepath, self.retries, || {
            write_at(&self.filepath, offset, &bytes)
        })
    }

    /// Read every record of a metrics log.
    pub fn read(filepath: impl AsRef<Path>) -> Result<Vec<MetricRecord>, BasenjiError> {
        let mut reader = csv::Reader::from_path(filepath)?;
        let records = reader
            .deserialize()
            .collect::<Result<Vec<MetricRecord>, _>>()?;
        Ok(records)
    }
}

/// Replace everything from byte `offset` of `filepath` on with `bytes`.
fn write_at(filepath: &Path, offset: u64, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(filepath)?;
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_metrics_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(METRICS_FILENAME);
        let log = MetricsLog::open(&path, 0, false).unwrap();
        log.append(&[
            MetricRecord::global(10, "train_loss", 0.5),
            MetricRecord::new(20, "dnase", "pearson_r", 0.25),
        ])
        .unwrap();
        log.append(&[]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("step,track,metric,value\n10,*,train_loss,0.5\n"));

        // reopening to append keeps the records; reopening fresh truncates
        let log = MetricsLog::open(&path, 0, true).unwrap();
        log.append(&[MetricRecord::global(30, "train_loss", 0.25)]).unwrap();
        let records = MetricsLog::read(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].track, "dnase");

        MetricsLog::open(&path, 0, false).unwrap();
        assert!(MetricsLog::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_retried_append_drops_partial_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(METRICS_FILENAME);
        MetricsLog::open(&path, 0, false).unwrap();
        let offset = fs::metadata(&path).unwrap().len();

        // the remains of an attempt that failed part way through a line
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"10,*,train_lo").unwrap();
        drop(file);

        write_at(&path, offset, b"10,*,train_loss,0.5\n").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "step,track,metric,value\n10,*,train_loss,0.5\n");
        assert_eq!(MetricsLog::read(&path).unwrap().len(), 1);
    }
}
