//! bedGraph signal track parsing.
//!
//! # ⚠️ Stability
//!
//! `track` and `browser` header lines are not recognized; they must be commented
//! out with `#` (as the UCSC tools allow).

use serde::Deserialize;
use std::path::PathBuf;

use super::tsv::TsvRecordIterator;
use crate::{BasenjiError, Position};

/// One bedGraph row: a 0-indexed, right-exclusive range carrying a signal value.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BedGraphRecord {
    pub seqname: String,
    pub start: Position,
    pub end: Position,
    pub value: f32,
}

/// An iterator over bedGraph records.
#[derive(Debug)]
pub struct BedGraphIterator {
    iter: TsvRecordIterator<BedGraphRecord>,
}

impl BedGraphIterator {
    /// Creates a parsing iterator over a (possibly gzipped) bedGraph file.
    pub fn new(filepath: impl Into<PathBuf>) -> Result<Self, BasenjiError> {
        let iter = TsvRecordIterator::new(filepath)?;
        Ok(Self { iter })
    }
}

impl Iterator for BedGraphIterator {
    type Item = Result<BedGraphRecord, BasenjiError>;
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}
