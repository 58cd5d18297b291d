//! The window indexer: maps a region list onto fixed-width model input windows.
//!
//! A [`WindowIndexer`] holds validated regions and produces a lazy sequence of
//! [`GenomicInterval`] windows with [`WindowIndexer::iter()`]. Iteration is restartable:
//! each call to `iter()` starts over and yields the same windows in the same order.
//!
//! Only full windows are emitted. A region shorter than the window width yields nothing,
//! and the remainder at the end of each region is dropped (the model needs inputs of
//! exactly width `W`).

use indexmap::IndexMap;

use super::{coitrees::Blacklist, validate_range, GenomicInterval, Strand};
use crate::{error::BasenjiError, Position};

/// Maps regions to fixed-width, optionally overlapping windows.
#[derive(Debug)]
pub struct WindowIndexer {
    regions: Vec<GenomicInterval>,
    width: Position,
    step: Position,
    blacklist: Option<(Blacklist, f64)>,
}

impl WindowIndexer {
    /// Create a new [`WindowIndexer`] over `regions`, with non-overlapping windows of
    /// `width` basepairs.
    ///
    /// # Arguments
    /// * `regions`: the regions to tile with windows.
    /// * `seqlens`: the sequence (i.e. chromosome) lengths, used to validate regions.
    /// * `width`: the window width `W`.
    ///
    /// # Errors
    /// Returns [`BasenjiError::InvalidRegion`] if any region has `start >= end` or
    /// extends past its sequence end, and [`BasenjiError::NotFound`] if a region is on a
    /// sequence not in `seqlens`.
    pub fn new(
        regions: Vec<GenomicInterval>,
        seqlens: &IndexMap<String, Position>,
        width: Position,
    ) -> Result<Self, BasenjiError> {
        if width == 0 {
            return Err(BasenjiError::InvalidConfig(
                "window width must be greater than zero".to_string(),
            ));
        }
        for region in &regions {
            let length = seqlens
                .get(&region.seqname)
                .ok_or_else(|| BasenjiError::NotFound(region.seqname.clone()))?;
            validate_range(&region.seqname, region.start, region.end, *length)?;
        }
        Ok(Self {
            regions,
            width,
            step: width,
            blacklist: None,
        })
    }

    /// Create a new [`WindowIndexer`] tiling entire sequences, on the forward strand.
    pub fn from_seqlens(
        seqlens: &IndexMap<String, Position>,
        width: Position,
    ) -> Result<Self, BasenjiError> {
        let regions = seqlens
            .iter()
            .filter(|(_, length)| **length > 0)
            .map(|(seqname, length)| GenomicInterval::new(seqname, 0, *length, Strand::Forward))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(regions, seqlens, width)
    }

    /// Set the step between consecutive window starts. A step smaller than the width
    /// creates overlapping windows.
    pub fn with_step(mut self, step: Position) -> Result<Self, BasenjiError> {
        if step == 0 {
            return Err(BasenjiError::InvalidConfig(
                "window step must be greater than zero".to_string(),
            ));
        }
        self.step = step;
        Ok(self)
    }

    /// Drop windows with more than `max_fraction` of their bases blacklisted.
    pub fn with_blacklist(
        mut self,
        blacklist: Blacklist,
        max_fraction: f64,
    ) -> Result<Self, BasenjiError> {
        if !(0.0..=1.0).contains(&max_fraction) {
            return Err(BasenjiError::InvalidConfig(format!(
                "blacklist fraction {} must be in [0, 1]",
                max_fraction
            )));
        }
        self.blacklist = Some((blacklist, max_fraction));
        Ok(self)
    }

    /// The window width `W`.
    pub fn width(&self) -> Position {
        self.width
    }

    /// The step between window starts.
    pub fn step(&self) -> Position {
        self.step
    }

    /// The validated regions.
    pub fn regions(&self) -> &[GenomicInterval] {
        &self.regions
    }

    /// Return a lazy iterator over all windows. Each call restarts from the first region.
    pub fn iter(&self) -> Windows<'_> {
        Windows {
            indexer: self,
            region: 0,
            next_start: self.regions.first().map(|r| r.start),
        }
    }

    fn is_blacklisted(&self, window: &GenomicInterval) -> bool {
        self.blacklist
            .as_ref()
            .map_or(false, |(bl, max_fraction)| {
                bl.covered_fraction(window) > *max_fraction
            })
    }
}

impl<'a> IntoIterator for &'a WindowIndexer {
    type Item = GenomicInterval;
    type IntoIter = Windows<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A lazy iterator over the windows of a [`WindowIndexer`].
#[derive(Debug)]
pub struct Windows<'a> {
    indexer: &'a WindowIndexer,
    region: usize,
    next_start: Option<Position>,
}

impl<'a> Iterator for Windows<'a> {
    type Item = GenomicInterval;

    fn next(&mut self) -> Option<Self::Item> {
        let width = self.indexer.width;
        loop {
            let region = self.indexer.regions.get(self.region)?;
            let start = match self.next_start {
                Some(start) => start,
                None => region.start,
            };
            let end = start.checked_add(width);
            match end {
                Some(end) if end <= region.end => {
                    self.next_start = Some(start.saturating_add(self.indexer.step));
                    let window = GenomicInterval {
                        seqname: region.seqname.clone(),
                        start,
                        end,
                        strand: region.strand,
                    };
                    if self.indexer.is_blacklisted(&window) {
                        continue;
                    }
                    return Some(window);
                }
                _ => {
                    // remainder chunk: move on to the next region
                    self.region += 1;
                    self.next_start = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::GenericRange;
    use indexmap::indexmap;

    fn seqlens() -> IndexMap<String, Position> {
        indexmap! { "chr1".to_string() => 35, "chr2".to_string() => 12 }
    }

    #[test]
    fn test_from_seqlens_non_overlapping() {
        let indexer = WindowIndexer::from_seqlens(&seqlens(), 10).unwrap();
        let windows: Vec<_> = indexer.iter().map(|w| (w.seqname, w.start, w.end)).collect();
        assert_eq!(
            windows,
            vec![
                ("chr1".to_string(), 0, 10),
                ("chr1".to_string(), 10, 20),
                ("chr1".to_string(), 20, 30),
                ("chr2".to_string(), 0, 10),
            ]
        );
    }

    #[test]
    fn test_overlapping_windows() {
        let indexer = WindowIndexer::from_seqlens(&seqlens(), 10)
            .unwrap()
            .with_step(5)
            .unwrap();
        let starts: Vec<_> = indexer
            .iter()
            .filter(|w| w.seqname == "chr1")
            .map(|w| w.start)
            .collect();
        assert_eq!(starts, vec![0, 5, 10, 15, 20, 25]);
    }

    #[test]
    fn test_windows_exact_width_and_restartable() {
        let regions = vec![
            GenomicInterval::new("chr1", 3, 34, Strand::Reverse).unwrap(),
            GenomicInterval::new("chr2", 0, 5, Strand::Forward).unwrap(),
        ];
        let indexer = WindowIndexer::new(regions, &seqlens(), 7).unwrap();
        let first: Vec<_> = indexer.iter().collect();
        let second: Vec<_> = indexer.iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|w| w.width() == 7));
        assert!(first.iter().all(|w| w.strand == Strand::Reverse));
    }

    #[test]
    fn test_invalid_regions() {
        let out_of_bounds = vec![GenomicInterval {
            seqname: "chr2".to_string(),
            start: 5,
            end: 13,
            strand: Strand::Forward,
        }];
        assert!(matches!(
            WindowIndexer::new(out_of_bounds, &seqlens(), 4),
            Err(BasenjiError::InvalidRegion { .. })
        ));

        let malformed = vec![GenomicInterval {
            seqname: "chr1".to_string(),
            start: 500,
            end: 100,
            strand: Strand::Forward,
        }];
        assert!(matches!(
            WindowIndexer::new(malformed, &seqlens(), 4),
            Err(BasenjiError::InvalidRegion { .. })
        ));

        let missing = vec![GenomicInterval::new("chrX", 0, 5, Strand::Forward).unwrap()];
        assert!(matches!(
            WindowIndexer::new(missing, &seqlens(), 4),
            Err(BasenjiError::NotFound(_))
        ));
    }

    #[test]
    fn test_zero_step() {
        let indexer = WindowIndexer::from_seqlens(&seqlens(), 10).unwrap();
        assert!(matches!(
            indexer.with_step(0),
            Err(BasenjiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_blacklisted_windows() {
        let bl = Blacklist::from_intervals(vec![
            GenomicInterval::new("chr1", 12, 14, Strand::Unknown).unwrap()
        ])
        .unwrap();
        let indexer = WindowIndexer::from_seqlens(&seqlens(), 10)
            .unwrap()
            .with_blacklist(bl, 0.0)
            .unwrap();
        let starts: Vec<_> = indexer
            .iter()
            .filter(|w| w.seqname == "chr1")
            .map(|w| w.start)
            .collect();
        assert_eq!(starts, vec![0, 20]);
    }
}
