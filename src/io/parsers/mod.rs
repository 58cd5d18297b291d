//! Parsing iterators for region and signal track formats.
//!
//! To train on genomic data, one first needs to read it off disk and parse it. This is
//! done with *parsing iterators*. These iterators work on both plaintext and gzip-compressed
//! files. Each row of a file is yielded as a parsed record, which then can be filtered or
//! altered while in the iterator, using Rust's [`Iterator`] trait methods.
//!
//! Under the hood, the bedGraph parser uses the [`csv`] crate with [`serde`]; BED regions
//! go through a small line parser since their column count varies.
//!
//! ## Parsing Iterator Item Types
//!
//!  1. [`GenomicInterval`], when a BED region file is loaded ([`BedIterator`]). BED3 lines
//!     have an unknown strand; BED6 lines carry the strand from the sixth column.
//!
//!  2. [`BedGraphRecord`], a range with a single `f32` signal value
//!     ([`BedGraphIterator`]), used to load target tracks.
//!
//! [`GenomicInterval`]: crate::ranges::GenomicInterval
//! [`BedIterator`]: bed::BedIterator
//! [`BedGraphRecord`]: bedgraph::BedGraphRecord
//! [`BedGraphIterator`]: bedgraph::BedGraphIterator

pub mod bed;
pub mod bedgraph;
pub mod tsv;
pub mod utils;

use std::path::{Path, PathBuf};

use crate::error::BasenjiError;

use self::utils::get_base_extension;

/// The supported target track formats, detected from the file extension.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackFormat {
    /// A (possibly gzipped) bedGraph file: `seqname start end value`.
    BedGraph(PathBuf),
    /// A directory of per-sequence `.npy` arrays, with `{}` in the pattern standing in
    /// for the sequence name, e.g. `tracks/dnase_{}.npy`.
    Npy(String),
}

impl TrackFormat {
    /// Detect the track format from the path or pattern.
    pub fn detect(filepath: impl AsRef<Path>) -> Result<Self, BasenjiError> {
        let path = filepath.as_ref();
        let extension = get_base_extension(path).unwrap_or_default();
        match extension.as_str() {
            "bedgraph" | "bedGraph" | "bdg" | "bg" => Ok(TrackFormat::BedGraph(path.to_path_buf())),
            "npy" => {
                let pattern = path.to_string_lossy().to_string();
                if !pattern.contains("{}") {
                    return Err(BasenjiError::InvalidConfig(format!(
                        "npy track pattern '{}' must contain '{{}}' for the sequence name",
                        pattern
                    )));
                }
                Ok(TrackFormat::Npy(pattern))
            }
            _ => Err(BasenjiError::InvalidConfig(format!(
                "could not detect track format of '{}' from its extension",
                path.display()
            ))),
        }
    }
}

/// Parse a single column into type `T`, reporting the offending line on failure.
pub fn parse_column<T: std::str::FromStr>(column: &str, line: &str) -> Result<T, BasenjiError>
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    column.parse::<T>().map_err(|_| BasenjiError::InvalidColumnType {
        expected_type: std::any::type_name::<T>().to_string(),
        found_value: column.to_string(),
        line: line.to_string(),
    })
}
