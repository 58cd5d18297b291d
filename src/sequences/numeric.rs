//! Per-basepair numeric target tracks.
//!
//! A [`NumericTrack`] holds one signal channel (e.g. DNase coverage) as a per-basepair
//! `Array1<f32>` for every sequence in the genome. Tracks are loaded from bedGraph files
//! or from per-sequence `.npy` arrays, and [`TargetTracks`] bundles the tracks of one
//! training run, turning a window into a pooled `[bins, tracks]` target matrix.
//!
//! Target preprocessing is applied per bin, in this order:
//!
//!  1. pooling of the per-basepair values in each bin ([`Pooling`]),
//!  2. clipping to an optional maximum,
//!  3. multiplication by the track's scale factor.
//!
//! Missing values (`NaN` in `.npy` input) are read as zero.

use genomap::GenomeMap;
use indexmap::IndexMap;
use ndarray::{s, Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::BasenjiError;
use crate::io::parsers::{bedgraph::BedGraphIterator, TrackFormat};
use crate::ranges::{validate_range, GenomicInterval};
use crate::traits::Sequences;
use crate::Position;

/// How per-basepair values are summarized into a bin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    #[default]
    Sum,
    Mean,
    Max,
}

impl Pooling {
    /// Summarize one bin's values.
    pub fn apply(&self, values: ArrayView1<f32>) -> f32 {
        match self {
            Pooling::Sum => values.sum(),
            Pooling::Mean => values.mean().unwrap_or(0.0),
            Pooling::Max => values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        }
    }
}

fn default_scale() -> f32 {
    1.0
}

/// The configuration of one target track, as listed in a run configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackSpec {
    /// The track's name, used in metrics and prediction output.
    pub name: String,
    /// A bedGraph file, or a `.npy` pattern with `{}` standing in for the sequence name.
    pub path: PathBuf,
    #[serde(default)]
    pub pool: Pooling,
    #[serde(default)]
    pub clip: Option<f32>,
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// The name of the opposite-strand track, exchanged with this one when an example
    /// is reverse complemented.
    #[serde(default)]
    pub strand_pair: Option<String>,
}

impl TrackSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            pool: Pooling::default(),
            clip: None,
            scale: default_scale(),
            strand_pair: None,
        }
    }

    /// Check the preprocessing parameters.
    pub fn validate(&self) -> Result<(), BasenjiError> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(BasenjiError::InvalidConfig(format!(
                "track '{}': scale must be a positive number",
                self.name
            )));
        }
        if let Some(clip) = self.clip {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(BasenjiError::InvalidConfig(format!(
                    "track '{}': clip must be a positive number",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// One per-basepair signal channel over the whole genome.
pub struct NumericTrack {
    spec: TrackSpec,
    data: GenomeMap<Array1<f32>>,
}

impl std::fmt::Debug for NumericTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NumericTrack")
            .field("spec", &self.spec)
            .field("seqnames", &self.data.names())
            .finish()
    }
}

impl NumericTrack {
    /// Load a track, detecting the format from the path in `spec`.
    ///
    /// # Arguments
    /// * `spec`: the track configuration.
    /// * `seqlens`: the genome's sequence lengths; every sequence gets an array of this length.
    pub fn load(
        spec: TrackSpec,
        seqlens: &IndexMap<String, Position>,
    ) -> Result<Self, BasenjiError> {
        spec.validate()?;
        match TrackFormat::detect(&spec.path)? {
            TrackFormat::BedGraph(path) => Self::from_bedgraph(spec, path, seqlens),
            TrackFormat::Npy(pattern) => Self::from_npy(spec, &pattern, seqlens),
        }
    }

    /// Build a track from in-memory per-sequence arrays.
    pub fn from_arrays(
        spec: TrackSpec,
        arrays: IndexMap<String, Array1<f32>>,
    ) -> Result<Self, BasenjiError> {
        spec.validate()?;
        let mut data = GenomeMap::new();
        for (seqname, mut values) in arrays {
            values.mapv_inplace(|x| if x.is_nan() { 0.0 } else { x });
            data.insert(&seqname, values)?;
        }
        Ok(Self { spec, data })
    }

    fn from_bedgraph(
        spec: TrackSpec,
        path: PathBuf,
        seqlens: &IndexMap<String, Position>,
    ) -> Result<Self, BasenjiError> {
        let mut arrays: IndexMap<String, Array1<f32>> = seqlens
            .iter()
            .map(|(name, len)| (name.clone(), Array1::zeros(*len as usize)))
            .collect();

        let mut skipped = 0usize;
        for record in BedGraphIterator::new(&path)? {
            let record = record?;
            let Some(values) = arrays.get_mut(&record.seqname) else {
                skipped += 1;
                continue;
            };
            validate_range(
                &record.seqname,
                record.start,
                record.end,
                values.len() as Position,
            )?;
            values
                .slice_mut(s![record.start as usize..record.end as usize])
                .fill(record.value);
        }
        if skipped > 0 {
            warn!(
                track = %spec.name,
                skipped,
                "bedGraph records on sequences outside the genome were ignored"
            );
        }
        debug!(track = %spec.name, path = %path.display(), "loaded bedGraph track");
        Self::from_arrays(spec, arrays)
    }

    fn from_npy(
        spec: TrackSpec,
        pattern: &str,
        seqlens: &IndexMap<String, Position>,
    ) -> Result<Self, BasenjiError> {
        let mut arrays = IndexMap::new();
        for (seqname, len) in seqlens {
            let filepath = pattern.replace("{}", seqname);
            let values: Array1<f32> = ndarray_npy::read_npy(&filepath)?;
            if values.len() != *len as usize {
                return Err(BasenjiError::InvalidConfig(format!(
                    "track '{}': '{}' has {} values but sequence '{}' has length {}",
                    spec.name,
                    filepath,
                    values.len(),
                    seqname,
                    len
                )));
            }
            arrays.insert(seqname.clone(), values);
        }
        debug!(track = %spec.name, pattern, "loaded npy track");
        Self::from_arrays(spec, arrays)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TrackSpec {
        &self.spec
    }

    /// Pool the values of a region into `bin_width` bins and apply the clip and scale.
    ///
    /// A remainder at the end of the region shorter than `bin_width` is dropped.
    pub fn binned(
        &self,
        seqname: &str,
        start: Position,
        end: Position,
        bin_width: Position,
    ) -> Result<Array1<f32>, BasenjiError> {
        if bin_width == 0 {
            return Err(BasenjiError::InvalidConfig(
                "target bin width must be greater than zero".to_string(),
            ));
        }
        let spec = &self.spec;
        self.region_map(
            &|values: ArrayView1<f32>| {
                let bin_width = bin_width as usize;
                let num_bins = values.len() / bin_width;
                Array1::from_iter((0..num_bins).map(|bin| {
                    let lo = bin * bin_width;
                    let pooled = spec.pool.apply(values.slice(s![lo..lo + bin_width]));
                    let clipped = spec.clip.map_or(pooled, |clip| pooled.min(clip));
                    clipped * spec.scale
                }))
            },
            seqname,
            start,
            end,
        )
    }
}

impl Sequences for NumericTrack {
    type Slice<'a> = ArrayView1<'a, f32>;

    fn seqnames(&self) -> Vec<String> {
        self.data.names()
    }

    fn get_sequence_length(&self, seqname: &str) -> Result<Position, BasenjiError> {
        let values = self
            .data
            .get(seqname)
            .ok_or(BasenjiError::NotFound(seqname.to_string()))?;
        Ok(values.len() as Position)
    }

    fn region_map<V, F>(
        &self,
        func: &F,
        seqname: &str,
        start: Position,
        end: Position,
    ) -> Result<V, BasenjiError>
    where
        F: for<'b> Fn(Self::Slice<'b>) -> V,
    {
        let values = self
            .data
            .get(seqname)
            .ok_or(BasenjiError::NotFound(seqname.to_string()))?;
        validate_range(seqname, start, end, values.len() as Position)?;
        Ok(func(values.slice(s![start as usize..end as usize])))
    }
}

/// Resolve the `strand_pair` declarations of a track list into a column permutation:
/// entry `i` is the index of track `i`'s opposite-strand partner, or `i` itself.
/// Pairs are symmetric, so declaring the pair on one of the two tracks is enough.
///
/// # Errors
/// Returns [`BasenjiError::InvalidConfig`] if there are no tracks, names repeat, or a
/// strand pair names an unknown track or conflicts with another pair.
pub fn strand_swap_permutation<'a, I>(specs: I) -> Result<Vec<usize>, BasenjiError>
where
    I: IntoIterator<Item = &'a TrackSpec>,
{
    let specs: Vec<&TrackSpec> = specs.into_iter().collect();
    if specs.is_empty() {
        return Err(BasenjiError::InvalidConfig(
            "at least one target track is required".to_string(),
        ));
    }
    let index: IndexMap<&str, usize> = specs
        .iter()
        .enumerate()
        .map(|(i, spec)| (spec.name.as_str(), i))
        .collect();
    if index.len() != specs.len() {
        return Err(BasenjiError::InvalidConfig(
            "target track names must be unique".to_string(),
        ));
    }

    let mut strand_swap: Vec<usize> = (0..specs.len()).collect();
    for (i, spec) in specs.iter().enumerate() {
        let Some(pair) = &spec.strand_pair else {
            continue;
        };
        let j = *index.get(pair.as_str()).ok_or_else(|| {
            BasenjiError::InvalidConfig(format!(
                "track '{}' has unknown strand pair '{}'",
                spec.name, pair
            ))
        })?;
        let conflict = (strand_swap[i] != i && strand_swap[i] != j)
            || (strand_swap[j] != j && strand_swap[j] != i);
        if conflict {
            return Err(BasenjiError::InvalidConfig(format!(
                "conflicting strand pairs for track '{}'",
                spec.name
            )));
        }
        strand_swap[i] = j;
        strand_swap[j] = i;
    }
    Ok(strand_swap)
}

/// The target tracks of one run, in configuration order.
#[derive(Debug)]
pub struct TargetTracks {
    tracks: Vec<NumericTrack>,
    strand_swap: Vec<usize>,
}

impl TargetTracks {
    /// Load every track in `specs`.
    pub fn load(
        specs: &[TrackSpec],
        seqlens: &IndexMap<String, Position>,
    ) -> Result<Self, BasenjiError> {
        let tracks = specs
            .iter()
            .map(|spec| NumericTrack::load(spec.clone(), seqlens))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(tracks)
    }

    /// Bundle tracks, resolving their strand pairs with [`strand_swap_permutation()`].
    pub fn new(tracks: Vec<NumericTrack>) -> Result<Self, BasenjiError> {
        let strand_swap = strand_swap_permutation(tracks.iter().map(|t| &t.spec))?;
        Ok(Self {
            tracks,
            strand_swap,
        })
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.name().to_string()).collect()
    }

    /// The column permutation applied when an example is reverse complemented:
    /// column `i` of the flipped targets is column `strand_swap()[i]` of the original.
    pub fn strand_swap(&self) -> &[usize] {
        &self.strand_swap
    }

    /// The pooled `[bins, tracks]` target matrix for a window.
    ///
    /// Targets are always returned in forward-strand orientation.
    pub fn targets(
        &self,
        interval: &GenomicInterval,
        bin_width: Position,
    ) -> Result<Array2<f32>, BasenjiError> {
        let columns = self
            .tracks
            .iter()
            .map(|track| track.binned(&interval.seqname, interval.start, interval.end, bin_width))
            .collect::<Result<Vec<_>, _>>()?;
        let num_bins = columns.first().map_or(0, |c| c.len());
        let mut targets = Array2::zeros((num_bins, columns.len()));
        for (j, column) in columns.iter().enumerate() {
            targets.column_mut(j).assign(column);
        }
        Ok(targets)
    }
}
