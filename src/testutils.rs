//! Helpers to write tests against the round protocol: deterministic models,
//! losses, metrics and dataset builders.

use anyhow::anyhow;
use ndarray::{Array1, ArrayD};

use crate::{
    client::ClientTrainer,
    data::{Batch, LocalDataset},
    model::{Loss, Metric, Model, ModelParameters, Optimizer, ShapeMismatchError, StepOutput},
};

/// A one-parameter model that predicts a constant value for every example.
pub struct ConstantModel {
    prediction: f32,
}

impl ConstantModel {
    pub fn new(prediction: f32) -> Self {
        Self { prediction }
    }
}

impl Model for ConstantModel {
    fn get_parameters(&self) -> ModelParameters {
        let mut params = ModelParameters::new();
        params.push("output", Array1::from_elem(1, self.prediction).into_dyn());
        params
    }

    fn set_parameters(&mut self, params: ModelParameters) -> Result<(), ShapeMismatchError> {
        self.get_parameters().check_compatible(&params)?;
        if let Some(tensor) = params.get("output") {
            self.prediction = tensor[[0]];
        }
        Ok(())
    }

    fn forward(&self, features: &ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let examples = features.shape()[0];
        Ok(Array1::from_elem(examples, self.prediction).into_dyn())
    }
}

/// Mean squared error.
pub struct SquaredError;

impl Loss for SquaredError {
    fn compute(&self, predictions: &ArrayD<f32>, labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        if predictions.len() != labels.len() {
            return Err(anyhow!(
                "predictions and labels differ in length: {} vs {}",
                predictions.len(),
                labels.len()
            ));
        }
        let sum: f64 = predictions
            .iter()
            .zip(labels.iter())
            .map(|(p, y)| (f64::from(*p) - f64::from(*y)).powi(2))
            .sum();
        Ok(sum / predictions.len() as f64)
    }
}

/// A loss that reports a fixed value regardless of the inputs.
pub struct FixedLoss(pub f64);

impl Loss for FixedLoss {
    fn compute(&self, _predictions: &ArrayD<f32>, _labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

/// A loss that always fails, for error propagation tests.
pub struct FailingLoss;

impl Loss for FailingLoss {
    fn compute(&self, _predictions: &ArrayD<f32>, _labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        Err(anyhow!("loss exploded"))
    }
}

/// A metric that reports a fixed score regardless of the inputs.
pub struct FixedMetric(pub f64);

impl Metric for FixedMetric {
    fn name(&self) -> &str {
        "fixed"
    }

    fn score(&self, _predictions: &ArrayD<f32>, _labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

/// A metric that always fails, for error propagation tests.
pub struct FailingMetric;

impl Metric for FailingMetric {
    fn name(&self) -> &str {
        "failing"
    }

    fn score(&self, _predictions: &ArrayD<f32>, _labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        Err(anyhow!("metric exploded"))
    }
}

/// An optimizer that computes the forward pass and loss but never updates
/// the model.
pub struct FrozenOptimizer;

impl Optimizer for FrozenOptimizer {
    fn step(
        &mut self,
        model: &mut dyn Model,
        loss: &dyn Loss,
        features: &ArrayD<f32>,
        labels: &ArrayD<f32>,
    ) -> anyhow::Result<StepOutput> {
        let predictions = model.forward(features)?;
        let loss = loss.compute(&predictions, labels)?;
        Ok(StepOutput { loss, predictions })
    }
}

/// Builds a rank-1 batch from feature and label slices of equal length.
pub fn rank1_batch(features: &[f32], labels: &[f32]) -> Batch {
    Batch::new(
        Array1::from_vec(features.to_vec()).into_dyn(),
        Array1::from_vec(labels.to_vec()).into_dyn(),
    )
}

pub fn dataset(batches: Vec<Batch>) -> LocalDataset {
    LocalDataset::new(batches)
}

/// A client that reports exactly `metric`/`loss` over an evaluation
/// partition of `eval_examples` examples and never learns anything.
pub fn reporting_client(metric: f64, loss: f64, eval_examples: usize) -> ClientTrainer {
    let eval_data = if eval_examples == 0 {
        LocalDataset::empty()
    } else {
        dataset(vec![rank1_batch(
            &vec![0.0; eval_examples],
            &vec![0.0; eval_examples],
        )])
    };
    ClientTrainer::new(
        Box::new(ConstantModel::new(0.0)),
        Box::new(FrozenOptimizer),
        Box::new(FixedLoss(loss)),
        Box::new(FixedMetric(metric)),
        LocalDataset::empty(),
        eval_data,
    )
}
