//! Types and methods for reading and parsing input and writing output.

pub mod file;
pub mod parsers;

pub use file::{read_seqlens, with_retries, write_atomic, InputStream, OutputStream};
pub use parsers::{
    bed::BedIterator, bedgraph::BedGraphIterator, tsv::TsvRecordIterator, TrackFormat,
};
