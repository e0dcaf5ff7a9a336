//! The model parameter exchange format and the traits behind which the
//! trainable artifact lives.
//!
//! [`ModelParameters`] is the only payload that ever travels between the
//! coordinator and the clients: an ordered mapping from layer name to a
//! numeric tensor. The model itself, its loss function, the scoring metric
//! and the optimizer are external collaborators supplied by the evaluation
//! domain; the round protocol only talks to them through the [`Model`],
//! [`Loss`], [`Metric`] and [`Optimizer`] traits and treats their failures
//! as opaque.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error returned when a parameter payload does not match the structure
/// of the live model. The payload is rejected wholesale: the receiving model
/// is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeMismatchError {
    #[error("parameter key sets differ: expected {expected:?}, got {actual:?}")]
    KeySet {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("parameter {name:?} has shape {actual:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// An ordered mapping from layer/parameter name to a numeric tensor.
///
/// Insertion order is preserved and significant: two parameter sets are
/// structurally compatible when their names come in the same order and every
/// tensor has the same shape. All clients and the coordinator hold
/// structurally compatible parameters at the start of every round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelParameters {
    layers: Vec<(String, ArrayD<f32>)>,
}

impl ModelParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a named tensor, preserving insertion order.
    pub fn push(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.layers.push((name.into(), tensor));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.layers
            .iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, tensor)| tensor)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.layers
            .iter_mut()
            .find(|(layer, _)| layer == name)
            .map(|(_, tensor)| tensor)
    }

    /// Iterates the layers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.layers
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn names(&self) -> Vec<String> {
        self.layers.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Checks that `other` has the same ordered key set and tensor shapes as
    /// `self`.
    pub fn check_compatible(&self, other: &ModelParameters) -> Result<(), ShapeMismatchError> {
        let expected = self.names();
        let actual = other.names();
        if expected != actual {
            return Err(ShapeMismatchError::KeySet { expected, actual });
        }
        for ((name, ours), (_, theirs)) in self.layers.iter().zip(other.layers.iter()) {
            if ours.shape() != theirs.shape() {
                return Err(ShapeMismatchError::Shape {
                    name: name.clone(),
                    expected: ours.shape().to_vec(),
                    actual: theirs.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

impl std::iter::FromIterator<(String, ArrayD<f32>)> for ModelParameters {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            layers: iter.into_iter().collect(),
        }
    }
}

/// The canonical parameter copy held by the coordinator between rounds.
///
/// Single-owner: the coordinator hands out cloned snapshots during dispatch
/// and replaces the copy only during the publish phase, so no client ever
/// reads a partially updated set. Every publish bumps the version.
#[derive(Debug, Clone)]
pub struct VersionedParameters {
    version: u64,
    params: ModelParameters,
}

impl VersionedParameters {
    pub fn new(params: ModelParameters) -> Self {
        Self { version: 0, params }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns a caller-owned snapshot of the current parameters.
    pub fn snapshot(&self) -> ModelParameters {
        self.params.clone()
    }

    /// Replaces the canonical parameters wholesale and bumps the version.
    ///
    /// The replacement must be structurally compatible with the current
    /// copy; an incompatible one is rejected without touching the state.
    pub fn publish(&mut self, params: ModelParameters) -> Result<u64, ShapeMismatchError> {
        self.params.check_compatible(&params)?;
        self.params = params;
        self.version += 1;
        Ok(self.version)
    }
}

/// The output of one optimizer step over a single batch.
pub struct StepOutput {
    /// The batch loss, as computed by the external loss function before the
    /// parameter update.
    pub loss: f64,
    /// The predictions the step computed for the batch, for metric scoring.
    pub predictions: ArrayD<f32>,
}

/// The trainable artifact. Internals (architecture, activation functions)
/// are opaque to the round protocol.
pub trait Model: Send + Sync {
    /// Returns a snapshot of the model parameters, safe for the caller to
    /// mutate without affecting the live model.
    fn get_parameters(&self) -> ModelParameters;

    /// Replaces the working parameters wholesale, or rejects the payload
    /// wholesale if it is structurally incompatible.
    fn set_parameters(&mut self, params: ModelParameters) -> Result<(), ShapeMismatchError>;

    /// Runs gradient-free inference over a batch of features.
    fn forward(&self, features: &ArrayD<f32>) -> anyhow::Result<ArrayD<f32>>;
}

/// The external loss function. Failures propagate unmodified to the caller.
pub trait Loss: Send + Sync {
    fn compute(&self, predictions: &ArrayD<f32>, labels: &ArrayD<f32>) -> anyhow::Result<f64>;
}

/// The external scoring function mapping (predictions, labels) to a scalar.
pub trait Metric: Send + Sync {
    /// The metric name as reported in telemetry records.
    fn name(&self) -> &str;

    fn score(&self, predictions: &ArrayD<f32>, labels: &ArrayD<f32>) -> anyhow::Result<f64>;
}

/// The external gradient-based optimizer. One call performs exactly one
/// parameter update over one batch; how the gradient is obtained is opaque.
pub trait Optimizer: Send + Sync {
    fn step(
        &mut self,
        model: &mut dyn Model,
        loss: &dyn Loss,
        features: &ArrayD<f32>,
        labels: &ArrayD<f32>,
    ) -> anyhow::Result<StepOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn params(pairs: &[(&str, &[f32])]) -> ModelParameters {
        pairs
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    Array1::from_vec(values.to_vec()).into_dyn(),
                )
            })
            .collect()
    }

    #[test]
    fn compatible_parameters_pass_the_check() {
        let a = params(&[("weight", &[1.0, 2.0]), ("bias", &[0.0])]);
        let b = params(&[("weight", &[5.0, 6.0]), ("bias", &[9.0])]);
        assert!(a.check_compatible(&b).is_ok());
    }

    #[test]
    fn differing_key_sets_are_rejected() {
        let a = params(&[("weight", &[1.0, 2.0])]);
        let b = params(&[("kernel", &[1.0, 2.0])]);
        assert!(matches!(
            a.check_compatible(&b),
            Err(ShapeMismatchError::KeySet { .. })
        ));
    }

    #[test]
    fn differing_shapes_are_rejected() {
        let a = params(&[("weight", &[1.0, 2.0])]);
        let b = params(&[("weight", &[1.0, 2.0, 3.0])]);
        match a.check_compatible(&b) {
            Err(ShapeMismatchError::Shape {
                name,
                expected,
                actual,
            }) => {
                assert_eq!(name, "weight");
                assert_eq!(expected, vec![2]);
                assert_eq!(actual, vec![3]);
            }
            other => panic!("expected shape mismatch, got {:?}", other),
        }
    }

    #[test]
    fn key_order_is_part_of_the_structure() {
        let a = params(&[("weight", &[1.0]), ("bias", &[0.0])]);
        let b = params(&[("bias", &[0.0]), ("weight", &[1.0])]);
        assert!(a.check_compatible(&b).is_err());
    }

    #[test]
    fn publish_bumps_the_version() {
        let mut canonical = VersionedParameters::new(params(&[("weight", &[1.0])]));
        assert_eq!(canonical.version(), 0);
        let version = canonical.publish(params(&[("weight", &[2.0])])).unwrap();
        assert_eq!(version, 1);
        assert_eq!(
            canonical.snapshot().get("weight").unwrap().as_slice(),
            Some(&[2.0][..])
        );
    }

    #[test]
    fn publish_rejects_incompatible_parameters() {
        let mut canonical = VersionedParameters::new(params(&[("weight", &[1.0])]));
        assert!(canonical.publish(params(&[("weight", &[1.0, 2.0])])).is_err());
        assert_eq!(canonical.version(), 0);
        assert_eq!(
            canonical.snapshot().get("weight").unwrap().as_slice(),
            Some(&[1.0][..])
        );
    }
}
