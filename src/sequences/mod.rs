//! Functionality for working with per-basepair data.
//!
//! The [`Sequences`] trait defines an abstraction over per-basepair genomic data, i.e.
//! data where ranges do not need to be explicitly defined because they exhaustively cover
//! the entire genome. Two kinds are used for training:
//!
//!  - *nucleotide* sequence data ([`nucleotide::NucleotideSequences`]), the reference
//!    genome the model reads;
//!  - *numeric* signal tracks ([`numeric::NumericTrack`]), the per-basepair targets the
//!    model learns to predict, bundled per run into [`numeric::TargetTracks`].
//!
//! Both are loaded in-memory: they are shared read-only across the producer threads of
//! the batch pipeline.
//!
//! [`Sequences`]: crate::traits::Sequences

pub mod nucleotide;
pub mod numeric;
