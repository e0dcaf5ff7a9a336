//! Pre-batched local datasets.
//!
//! Partitioning and batch loading happen outside the crate: a client is
//! constructed with an already-batched sequence of (features, labels) pairs
//! for each of its splits. A dataset may be empty, in which case the client
//! contributes zero weight to the round it participates in.

use ndarray::ArrayD;

/// One batch of examples. The first axis of `labels` is the batch size.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: ArrayD<f32>,
    pub labels: ArrayD<f32>,
}

impl Batch {
    pub fn new(features: ArrayD<f32>, labels: ArrayD<f32>) -> Self {
        debug_assert_eq!(features.shape()[0], labels.shape()[0]);
        Self { features, labels }
    }

    /// The number of examples in this batch.
    pub fn len(&self) -> usize {
        self.labels.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An ordered sequence of batches with a fixed, known example count.
#[derive(Debug, Clone, Default)]
pub struct LocalDataset {
    batches: Vec<Batch>,
    example_count: usize,
}

impl LocalDataset {
    pub fn new(batches: Vec<Batch>) -> Self {
        let example_count = batches.iter().map(Batch::len).sum();
        Self {
            batches,
            example_count,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The total number of examples across all batches.
    pub fn example_count(&self) -> usize {
        self.example_count
    }

    pub fn is_empty(&self) -> bool {
        self.example_count == 0
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }
}
