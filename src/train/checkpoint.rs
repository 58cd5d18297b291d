//! Binary checkpoint files.
//!
//! A checkpoint is an immutable snapshot of the model parameters, the optimizer state and
//! the [`TrainingContext`]. The layout is:
//!
//! | field              | encoding                                  |
//! |--------------------|-------------------------------------------|
//! | magic              | the 8 bytes `BSNJCKPT`                    |
//! | format version     | `u32`, little endian                      |
//! | step counter       | `u64`, little endian                      |
//! | metadata           | `u64` LE length, then JSON                |
//! | model record       | `u64` LE length, then burn binary record  |
//! | optimizer record   | `u64` LE length, then burn binary record  |
//!
//! The JSON metadata ([`CheckpointMeta`]) carries the training context plus everything
//! needed to rebuild the model before its record is loaded.
//!
//! Checkpoints are written with [`write_atomic()`], so a checkpoint file is always either
//! the previous complete snapshot or the new one.

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::context::TrainingContext;
use crate::{
    io::file::{with_retries, write_atomic},
    model::{ModelConfig, SeqSignalModel},
    BasenjiError,
};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"BSNJCKPT";
pub const CHECKPOINT_VERSION: u32 = 1;

/// The file name of the most recent checkpoint in a run directory.
pub const LATEST_CHECKPOINT: &str = "latest.ckpt";
/// The file name of the checkpoint with the best validation metric.
pub const BEST_CHECKPOINT: &str = "best.ckpt";

type ByteRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Serialize a burn record (a module's or an optimizer's) to bytes.
pub fn record_to_bytes<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>, BasenjiError> {
    Recorder::<B>::record(&ByteRecorder::default(), record, ())
        .map_err(|e| BasenjiError::RecordError(format!("{:?}", e)))
}

/// Deserialize a burn record from bytes.
pub fn record_from_bytes<B: Backend, R: Record<B>>(
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<R, BasenjiError> {
    Recorder::<B>::load(&ByteRecorder::default(), bytes, device)
        .map_err(|e| BasenjiError::RecordError(format!("{:?}", e)))
}

/// The JSON section of a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub context: TrainingContext,
    pub model: ModelConfig,
    pub window_len: usize,
    pub track_names: Vec<String>,
    /// The optimizer the record section belongs to (`adam` or `sgd`).
    pub optimizer: String,
}

/// A decoded checkpoint; the records are kept as bytes until a model is rebuilt.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub step: u64,
    pub meta: CheckpointMeta,
    pub model_record: Vec<u8>,
    pub optimizer_record: Vec<u8>,
}

impl Checkpoint {
    /// Snapshot a model, with an already serialized optimizer record.
    pub fn new<B: Backend>(
        meta: CheckpointMeta,
        model: &SeqSignalModel<B>,
        optimizer_record: Vec<u8>,
    ) -> Result<Self, BasenjiError> {
        let model_record = record_to_bytes::<B, _>(model.clone().into_record())?;
        Ok(Self {
            step: meta.context.step,
            meta,
            model_record,
            optimizer_record,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, BasenjiError> {
        let meta = serde_json::to_vec(&self.meta)?;
        let mut bytes = Vec::with_capacity(
            CHECKPOINT_MAGIC.len()
                + 4
                + 8 * 4
                + meta.len()
                + self.model_record.len()
                + self.optimizer_record.len(),
        );
        bytes.extend_from_slice(CHECKPOINT_MAGIC);
        bytes.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.step.to_le_bytes());
        for section in [&meta, &self.model_record, &self.optimizer_record] {
            bytes.extend_from_slice(&(section.len() as u64).to_le_bytes());
            bytes.extend_from_slice(section);
        }
        Ok(bytes)
    }

    /// Decode a checkpoint.
    ///
    /// # Errors
    /// Returns [`BasenjiError::CheckpointFormat`] for a bad magic number, an unsupported
    /// version, truncated or trailing data, or a step counter that disagrees with the
    /// metadata.
    pub fn decode(bytes: &[u8]) -> Result<Self, BasenjiError> {
        let mut reader = SectionReader { bytes, offset: 0 };
        if reader.take(CHECKPOINT_MAGIC.len())? != CHECKPOINT_MAGIC {
            return Err(BasenjiError::CheckpointFormat(
                "not a basenji checkpoint (bad magic number)".to_string(),
            ));
        }
        let version = u32::from_le_bytes(reader.array::<4>()?);
        if version != CHECKPOINT_VERSION {
            return Err(BasenjiError::CheckpointFormat(format!(
                "unsupported checkpoint version {} (expected {})",
                version, CHECKPOINT_VERSION
            )));
        }
        let step = u64::from_le_bytes(reader.array::<8>()?);
        let meta: CheckpointMeta = serde_json::from_slice(reader.section()?)?;
        let model_record = reader.section()?.to_vec();
        let optimizer_record = reader.section()?.to_vec();
        if reader.offset != bytes.len() {
            return Err(BasenjiError::CheckpointFormat(format!(
                "{} trailing bytes",
                bytes.len() - reader.offset
            )));
        }
        if meta.context.step != step {
            return Err(BasenjiError::CheckpointFormat(format!(
                "header step {} disagrees with the training context step {}",
                step, meta.context.step
            )));
        }
        Ok(Self {
            step,
            meta,
            model_record,
            optimizer_record,
        })
    }

    pub fn read(filepath: impl AsRef<Path>) -> Result<Self, BasenjiError> {
        Self::decode(&fs::read(filepath)?)
    }

    /// Atomically write the checkpoint, retrying failed attempts.
    pub fn write(&self, filepath: &Path, retries: usize) -> Result<(), BasenjiError> {
        let bytes = self.encode()?;
        with_retries(filepath, retries, || write_atomic(filepath, &bytes))?;
        info!(step = self.step, path = %filepath.display(), "saved checkpoint");
        Ok(())
    }

    /// Rebuild the model this checkpoint was taken from.
    pub fn load_model<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<SeqSignalModel<B>, BasenjiError> {
        let record = record_from_bytes::<B, _>(self.model_record.clone(), device)?;
        Ok(self.meta.model.load::<B>(
            record,
            self.meta.window_len,
            self.meta.track_names.len(),
            device,
        ))
    }
}

struct SectionReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> SectionReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], BasenjiError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                BasenjiError::CheckpointFormat(format!(
                    "truncated: needed {} bytes at offset {}, file has {}",
                    len,
                    self.offset,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BasenjiError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn section(&mut self) -> Result<&'a [u8], BasenjiError> {
        let len = u64::from_le_bytes(self.array::<8>()?);
        let len = usize::try_from(len)
            .map_err(|_| BasenjiError::CheckpointFormat(format!("section length {}", len)))?;
        self.take(len)
    }
}

/// The checkpoint locations of a run directory.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    retries: usize,
}

impl CheckpointStore {
    /// Use (and create) `dir` for checkpoints.
    pub fn new(dir: impl Into<PathBuf>, retries: usize) -> Result<Self, BasenjiError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, retries })
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_CHECKPOINT)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT)
    }

    pub fn save_latest(&self, checkpoint: &Checkpoint) -> Result<(), BasenjiError> {
        checkpoint.write(&self.latest_path(), self.retries)
    }

    pub fn save_best(&self, checkpoint: &Checkpoint) -> Result<(), BasenjiError> {
        checkpoint.write(&self.best_path(), self.retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AggregatorKind, ConvStage};
    use crate::InferenceBackend;
    use tempfile::tempdir;

    fn meta(step: u64) -> CheckpointMeta {
        let context = TrainingContext {
            step,
            best_metric: Some(0.5),
            ..Default::default()
        };
        CheckpointMeta {
            context,
            model: ModelConfig {
                conv: vec![ConvStage::new(4, 3, 2)],
                hidden_size: 4,
                aggregator: AggregatorKind::Gru,
                num_heads: 1,
                dropout: 0.0,
            },
            window_len: 16,
            track_names: vec!["a".to_string(), "b".to_string()],
            optimizer: "adam".to_string(),
        }
    }

    fn checkpoint(step: u64) -> Checkpoint {
        let meta = meta(step);
        let model = meta.model.init::<InferenceBackend>(16, 2, &Default::default());
        Checkpoint::new(meta, &model, vec![1, 2, 3]).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let bytes = checkpoint(7).encode().unwrap();
        assert_eq!(&bytes[..8], CHECKPOINT_MAGIC);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), CHECKPOINT_VERSION);
        assert_eq!(u64::from_le_bytes(bytes[12..20].try_into().unwrap()), 7);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let bytes = checkpoint(3).encode().unwrap();
        assert!(Checkpoint::decode(&bytes).is_ok());

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Checkpoint::decode(&bad_magic),
            Err(BasenjiError::CheckpointFormat(_))
        ));

        let mut bad_version = bytes.clone();
        bad_version[8] = 99;
        assert!(matches!(
            Checkpoint::decode(&bad_version),
            Err(BasenjiError::CheckpointFormat(_))
        ));

        assert!(matches!(
            Checkpoint::decode(&bytes[..bytes.len() - 1]),
            Err(BasenjiError::CheckpointFormat(_))
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(Checkpoint::decode(&trailing).is_err());
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run"), 0).unwrap();
        let original = checkpoint(11);
        store.save_latest(&original).unwrap();
        let restored = Checkpoint::read(store.latest_path()).unwrap();
        assert_eq!(restored, original);
        assert!(!store.best_path().exists());

        let model = restored.load_model::<InferenceBackend>(&Default::default()).unwrap();
        let again = Checkpoint::new(restored.meta.clone(), &model, vec![1, 2, 3]).unwrap();
        assert_eq!(again.model_record, original.model_record);
    }
}
