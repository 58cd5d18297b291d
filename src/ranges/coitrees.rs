//! Blacklisted regions, stored as one [`coitrees::BasicCOITree`] interval tree per sequence.
//!
//! Windows overlapping assembly gaps or artifact regions carry no usable signal; the
//! indexer consults a [`Blacklist`] to drop them.

use coitrees::{BasicCOITree, IntervalNode, IntervalTree};
use indexmap::IndexMap;

use crate::{error::BasenjiError, ranges::GenomicInterval, traits::GenericRange, Position};

/// A set of blacklisted ranges, indexed per sequence for overlap queries.
pub struct Blacklist {
    trees: IndexMap<String, BasicCOITree<(), usize>>,
    len: usize,
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist")
            .field("number of ranges:", &self.len)
            .field("sequences", &self.trees.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn to_i32(position: Position) -> Result<i32, BasenjiError> {
    i32::try_from(position)
        .map_err(|_| BasenjiError::InvalidConfig(format!("position {} too large for index", position)))
}

impl Blacklist {
    /// Build a [`Blacklist`] from an iterator of intervals (e.g. parsed from a BED file).
    pub fn from_intervals<I>(intervals: I) -> Result<Self, BasenjiError>
    where
        I: IntoIterator<Item = GenomicInterval>,
    {
        let mut nodes: IndexMap<String, Vec<IntervalNode<(), usize>>> = IndexMap::new();
        let mut len = 0;
        for interval in intervals {
            // coitrees uses 0-indexed, right-inclusive "last"
            let node = IntervalNode::new(to_i32(interval.start)?, to_i32(interval.end)? - 1, ());
            nodes.entry(interval.seqname).or_default().push(node);
            len += 1;
        }
        let trees = nodes
            .into_iter()
            .map(|(seqname, nodes)| (seqname, BasicCOITree::new(&nodes)))
            .collect();
        Ok(Self { trees, len })
    }

    /// Return the number of blacklisted ranges.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return whether the blacklist is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of basepairs of `interval` covered by at least one blacklisted range.
    pub fn covered_width(&self, interval: &GenomicInterval) -> Position {
        let Some(tree) = self.trees.get(&interval.seqname) else {
            return 0;
        };
        let (Ok(first), Ok(last)) = (
            i32::try_from(interval.start),
            i32::try_from(interval.end - 1),
        ) else {
            return 0;
        };
        let (_count, covered) = tree.coverage(first, last);
        covered as Position
    }

    /// The fraction of `interval` covered by blacklisted ranges.
    pub fn covered_fraction(&self, interval: &GenomicInterval) -> f64 {
        self.covered_width(interval) as f64 / interval.width() as f64
    }
}
