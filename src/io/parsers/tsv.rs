//! Essential TSV parsing functionality, which wraps the [`csv`] crate's
//! deserialization method using [`serde`].

use csv::{DeserializeRecordsIntoIter, Reader, ReaderBuilder};
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;

use crate::error::BasenjiError;
use crate::io::file::InputStream;

/// Build a TSV reader which ignores comment lines, works on gzip-compressed
/// files, etc.
///
/// Headers are not parsed: lines starting with `'#'` are skipped.
pub fn build_tsv_reader(
    filepath: impl Into<PathBuf>,
) -> Result<Reader<Box<dyn Read>>, BasenjiError> {
    let stream = InputStream::new(filepath).reader()?;
    let boxed: Box<dyn Read> = Box::new(stream);

    let reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(boxed);
    Ok(reader)
}

/// An extensible TSV parser, which deserializes each line into a record type `T`.
pub struct TsvRecordIterator<T> {
    inner: DeserializeRecordsIntoIter<Box<dyn Read>, T>,
}

impl<T> std::fmt::Debug for TsvRecordIterator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsvRecordIterator").finish_non_exhaustive()
    }
}

impl<T> TsvRecordIterator<T>
where
    for<'de> T: Deserialize<'de>,
{
    /// Create a new TSV reader. This will skip lines that begin with `'#'`, since a
    /// pseudo-standard is that these indicate metadata, or column headers.
    pub fn new(filepath: impl Into<PathBuf>) -> Result<Self, BasenjiError> {
        let reader = build_tsv_reader(filepath)?;
        let inner = reader.into_deserialize();
        Ok(Self { inner })
    }
}

impl<T> Iterator for TsvRecordIterator<T>
where
    for<'de> T: Deserialize<'de>,
{
    type Item = Result<T, BasenjiError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|res| res.map_err(BasenjiError::from))
    }
}
