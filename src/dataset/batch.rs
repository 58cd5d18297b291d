//! Batches of training examples, and their conversion to model tensors.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use ndarray::{Array3, Axis};

use super::example::TrainingExample;
use crate::{encoding::ALPHABET_SIZE, ranges::GenomicInterval, BasenjiError};

/// A group of [`TrainingExample`]s with identical sequence length and target shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    examples: Vec<TrainingExample>,
}

impl Batch {
    /// Create a new batch.
    ///
    /// # Errors
    /// Returns [`BasenjiError::NoExamples`] for an empty batch,
    /// [`BasenjiError::EncodingError`] if sequence lengths or track counts differ, and
    /// [`BasenjiError::AlignmentError`] if bin counts differ.
    pub fn new(examples: Vec<TrainingExample>) -> Result<Self, BasenjiError> {
        let first = examples
            .first()
            .ok_or_else(|| BasenjiError::NoExamples("batch".to_string()))?;
        let (len, bins, tracks) = (first.sequence.len(), first.num_bins(), first.num_tracks());
        for example in &examples[1..] {
            if example.sequence.len() != len || example.num_tracks() != tracks {
                return Err(BasenjiError::EncodingError(format!(
                    "examples in a batch must share a shape: {} has length {} and {} tracks, \
                     expected {} and {}",
                    example.interval,
                    example.sequence.len(),
                    example.num_tracks(),
                    len,
                    tracks
                )));
            }
            if example.num_bins() != bins {
                return Err(BasenjiError::AlignmentError {
                    sequence_bins: bins,
                    target_bins: example.num_bins(),
                });
            }
        }
        Ok(Self { examples })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    /// The shared sequence length.
    pub fn seq_len(&self) -> usize {
        self.examples[0].sequence.len()
    }

    pub fn num_bins(&self) -> usize {
        self.examples[0].num_bins()
    }

    pub fn num_tracks(&self) -> usize {
        self.examples[0].num_tracks()
    }

    pub fn intervals(&self) -> impl Iterator<Item = &GenomicInterval> {
        self.examples.iter().map(|e| &e.interval)
    }

    /// Stack the encoded sequences into a `[batch, length, 4]` array.
    pub fn inputs(&self) -> Array3<f32> {
        let mut inputs = Array3::<f32>::zeros((self.len(), self.seq_len(), ALPHABET_SIZE));
        for (mut slot, example) in inputs.axis_iter_mut(Axis(0)).zip(&self.examples) {
            slot.assign(&example.sequence.view());
        }
        inputs
    }

    /// Stack the targets into a `[batch, bins, tracks]` array.
    pub fn targets(&self) -> Array3<f32> {
        let mut targets = Array3::<f32>::zeros((self.len(), self.num_bins(), self.num_tracks()));
        for (mut slot, example) in targets.axis_iter_mut(Axis(0)).zip(&self.examples) {
            slot.assign(&example.targets);
        }
        targets
    }

    /// The inputs as a `[batch, length, 4]` tensor on `device`.
    pub fn input_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        array3_to_tensor(self.inputs(), device)
    }

    /// The targets as a `[batch, bins, tracks]` tensor on `device`.
    pub fn target_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        array3_to_tensor(self.targets(), device)
    }
}

/// Move a standard-layout ndarray into a burn tensor of the same shape.
pub fn array3_to_tensor<B: Backend>(array: Array3<f32>, device: &B::Device) -> Tensor<B, 3> {
    let shape = array.shape().to_vec();
    let values: Vec<f32> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Copy a burn tensor back into an ndarray.
pub fn tensor_to_array3<B: Backend>(tensor: Tensor<B, 3>) -> Result<Array3<f32>, BasenjiError> {
    let [d0, d1, d2] = tensor.dims();
    let values = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| BasenjiError::TensorError(format!("{:?}", e)))?;
    Array3::from_shape_vec((d0, d1, d2), values)
        .map_err(|e| BasenjiError::TensorError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encoding::OneHotEncoder,
        ranges::{GenomicInterval, Strand},
        InferenceBackend,
    };
    use ndarray::{array, Array2};

    fn example(seq: &[u8], targets: Array2<f32>) -> TrainingExample {
        let interval = GenomicInterval::new("chr1", 0, seq.len() as u32, Strand::Forward).unwrap();
        let sequence = OneHotEncoder::default().encode(seq).unwrap();
        TrainingExample::new(interval, sequence, targets, 2).unwrap()
    }

    #[test]
    fn test_batch_shapes() {
        let batch = Batch::new(vec![
            example(b"ACGT", array![[1.0], [2.0]]),
            example(b"TTTT", array![[3.0], [4.0]]),
        ])
        .unwrap();
        assert_eq!(batch.inputs().shape(), &[2, 4, 4]);
        assert_eq!(batch.targets(), array![[[1.0], [2.0]], [[3.0], [4.0]]]);
        assert_eq!(batch.inputs()[[1, 2, 3]], 1.0);

        let device = Default::default();
        let tensor = batch.target_tensor::<InferenceBackend>(&device);
        assert_eq!(tensor.dims(), [2, 2, 1]);
        assert_eq!(tensor_to_array3(tensor).unwrap(), batch.targets());
    }

    #[test]
    fn test_batch_rejects_mixed_shapes() {
        assert!(Batch::new(vec![]).is_err());
        let result = Batch::new(vec![
            example(b"ACGT", array![[1.0], [2.0]]),
            example(b"ACGTAC", array![[1.0], [2.0], [3.0]]),
        ]);
        assert!(matches!(result, Err(BasenjiError::EncodingError(_))));
    }
}
