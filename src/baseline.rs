//! A small self-contained binary-classification task.
//!
//! The round protocol treats the model, loss, metric and optimizer as
//! opaque collaborators. This module provides concrete ones: a logistic
//! regression [`Baseline`], the matching [`BaselineLoss`], an [`Accuracy`]
//! and a [`RocAuc`] metric, and two gradient-based optimizers. The
//! `coordinator` binary drives a full federation with them and the
//! integration tests use them to exercise real training rounds.

use std::collections::HashMap;

use anyhow::anyhow;
use ndarray::{indices, Array1, ArrayD, Ix1, Ix2};

use crate::model::{Loss, Metric, Model, ModelParameters, Optimizer, ShapeMismatchError, StepOutput};

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// Logistic regression over a fixed number of input features. Parameters
/// are a `weight` vector and a single-element `bias`.
pub struct Baseline {
    weights: Array1<f32>,
    bias: f32,
}

impl Baseline {
    pub fn new(features: usize) -> Self {
        Self {
            weights: Array1::zeros(features),
            bias: 0.0,
        }
    }
}

impl Model for Baseline {
    fn get_parameters(&self) -> ModelParameters {
        let mut params = ModelParameters::new();
        params.push("weight", self.weights.clone().into_dyn());
        params.push("bias", Array1::from_elem(1, self.bias).into_dyn());
        params
    }

    fn set_parameters(&mut self, params: ModelParameters) -> Result<(), ShapeMismatchError> {
        self.get_parameters().check_compatible(&params)?;
        for (name, tensor) in params.iter() {
            match name {
                "weight" => {
                    self.weights = tensor
                        .clone()
                        .into_dimensionality::<Ix1>()
                        .map_err(|_| ShapeMismatchError::Shape {
                            name: name.to_string(),
                            expected: vec![self.weights.len()],
                            actual: tensor.shape().to_vec(),
                        })?;
                }
                "bias" => self.bias = tensor[[0]],
                _ => {}
            }
        }
        Ok(())
    }

    fn forward(&self, features: &ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let x = features
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|err| anyhow!("features must be a rank-2 batch: {}", err))?;
        let logits = x.dot(&self.weights) + self.bias;
        Ok(logits.mapv(sigmoid).into_dyn())
    }
}

/// Binary cross-entropy over probability predictions.
pub struct BaselineLoss;

impl Loss for BaselineLoss {
    fn compute(&self, predictions: &ArrayD<f32>, labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        if predictions.len() != labels.len() {
            return Err(anyhow!(
                "predictions and labels differ in length: {} vs {}",
                predictions.len(),
                labels.len()
            ));
        }
        if predictions.is_empty() {
            return Err(anyhow!("cannot compute a loss over zero examples"));
        }
        // clamp away from 0 and 1 so the logarithms stay finite
        const EPS: f64 = 1e-7;
        let sum: f64 = predictions
            .iter()
            .zip(labels.iter())
            .map(|(p, y)| {
                let p = f64::from(*p).max(EPS).min(1.0 - EPS);
                let y = f64::from(*y);
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum();
        Ok(sum / predictions.len() as f64)
    }
}

/// Fraction of examples where the thresholded prediction matches the label.
pub struct Accuracy;

impl Metric for Accuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn score(&self, predictions: &ArrayD<f32>, labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        if predictions.len() != labels.len() {
            return Err(anyhow!(
                "predictions and labels differ in length: {} vs {}",
                predictions.len(),
                labels.len()
            ));
        }
        if predictions.is_empty() {
            return Err(anyhow!("cannot score zero examples"));
        }
        let correct = predictions
            .iter()
            .zip(labels.iter())
            .filter(|(p, y)| (**p >= 0.5) == (**y >= 0.5))
            .count();
        Ok(correct as f64 / predictions.len() as f64)
    }
}

/// Area under the ROC curve, computed from the rank sum of the positive
/// examples with average ranks for tied scores.
pub struct RocAuc;

impl Metric for RocAuc {
    fn name(&self) -> &str {
        "auc"
    }

    fn score(&self, predictions: &ArrayD<f32>, labels: &ArrayD<f32>) -> anyhow::Result<f64> {
        if predictions.len() != labels.len() {
            return Err(anyhow!(
                "predictions and labels differ in length: {} vs {}",
                predictions.len(),
                labels.len()
            ));
        }
        let mut scored: Vec<(f32, bool)> = predictions
            .iter()
            .zip(labels.iter())
            .map(|(p, y)| (*p, *y >= 0.5))
            .collect();
        let positives = scored.iter().filter(|(_, positive)| *positive).count();
        let negatives = scored.len() - positives;
        if positives == 0 || negatives == 0 {
            return Err(anyhow!("roc-auc needs both classes among the labels"));
        }

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut positive_rank_sum = 0.0;
        let mut index = 0;
        while index < scored.len() {
            let mut end = index;
            while end < scored.len() && scored[end].0 == scored[index].0 {
                end += 1;
            }
            // ranks are 1-based; tied scores share their average rank
            let rank = (index + 1 + end) as f64 / 2.0;
            for entry in &scored[index..end] {
                if entry.1 {
                    positive_rank_sum += rank;
                }
            }
            index = end;
        }

        let positives = positives as f64;
        let negatives = negatives as f64;
        Ok((positive_rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives))
    }
}

const GRADIENT_EPSILON: f32 = 1e-3;

/// Estimates the loss gradient with forward differences through the public
/// parameter interface. Cost grows with the parameter count, which is fine
/// at baseline scale.
fn numeric_gradient(
    model: &mut dyn Model,
    loss: &dyn Loss,
    features: &ArrayD<f32>,
    labels: &ArrayD<f32>,
    base_loss: f64,
) -> anyhow::Result<ModelParameters> {
    let origin = model.get_parameters();
    let mut gradients = ModelParameters::new();
    for (name, tensor) in origin.iter() {
        let mut grad = ArrayD::<f32>::zeros(tensor.raw_dim());
        for idx in indices(tensor.raw_dim()) {
            let mut perturbed = origin.clone();
            if let Some(layer) = perturbed.get_mut(name) {
                layer[idx.clone()] += GRADIENT_EPSILON;
            }
            model.set_parameters(perturbed)?;
            let predictions = model.forward(features)?;
            let perturbed_loss = loss.compute(&predictions, labels)?;
            grad[idx] = ((perturbed_loss - base_loss) as f32) / GRADIENT_EPSILON;
        }
        gradients.push(name, grad);
    }
    model.set_parameters(origin)?;
    Ok(gradients)
}

/// Plain stochastic gradient descent with optional weight decay.
pub struct Sgd {
    learning_rate: f32,
    weight_decay: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
        }
    }
}

impl Optimizer for Sgd {
    fn step(
        &mut self,
        model: &mut dyn Model,
        loss: &dyn Loss,
        features: &ArrayD<f32>,
        labels: &ArrayD<f32>,
    ) -> anyhow::Result<StepOutput> {
        let predictions = model.forward(features)?;
        let loss_value = loss.compute(&predictions, labels)?;
        let gradients = numeric_gradient(model, loss, features, labels, loss_value)?;

        let params = model.get_parameters();
        let updated = params
            .iter()
            .zip(gradients.iter())
            .map(|((name, tensor), (_, grad))| {
                let direction = grad + &(tensor * self.weight_decay);
                (name.to_string(), tensor - &(direction * self.learning_rate))
            })
            .collect();
        model.set_parameters(updated)?;
        Ok(StepOutput {
            loss: loss_value,
            predictions,
        })
    }
}

/// Adam with bias-corrected first and second moments.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    step_count: i32,
    moments: HashMap<String, (ArrayD<f32>, ArrayD<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            step_count: 0,
            moments: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(
        &mut self,
        model: &mut dyn Model,
        loss: &dyn Loss,
        features: &ArrayD<f32>,
        labels: &ArrayD<f32>,
    ) -> anyhow::Result<StepOutput> {
        let predictions = model.forward(features)?;
        let loss_value = loss.compute(&predictions, labels)?;
        let gradients = numeric_gradient(model, loss, features, labels, loss_value)?;

        self.step_count += 1;
        let t = self.step_count;
        let params = model.get_parameters();
        let mut updated = ModelParameters::new();
        for ((name, tensor), (_, grad)) in params.iter().zip(gradients.iter()) {
            let grad = grad + &(tensor * self.weight_decay);
            let (m, v) = self
                .moments
                .entry(name.to_string())
                .or_insert_with(|| {
                    (
                        ArrayD::zeros(tensor.raw_dim()),
                        ArrayD::zeros(tensor.raw_dim()),
                    )
                });
            *m = &*m * self.beta1 + &(&grad * (1.0 - self.beta1));
            *v = &*v * self.beta2 + &(grad.mapv(|g| g * g) * (1.0 - self.beta2));
            let m_hat = &*m / (1.0 - self.beta1.powi(t));
            let v_hat = &*v / (1.0 - self.beta2.powi(t));
            let denom = v_hat.mapv(f32::sqrt) + self.epsilon;
            let delta = m_hat * self.learning_rate / denom;
            updated.push(name, tensor - &delta);
        }
        model.set_parameters(updated)?;
        Ok(StepOutput {
            loss: loss_value,
            predictions,
        })
    }
}
