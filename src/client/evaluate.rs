//! The local evaluation step.
//!
//! A single gradient-free pass over a client's evaluation partition. The
//! empty partition has one canonical contract: the step returns the
//! `example_count = 0` sentinel and the caller must never fold the zeroed
//! means into a weighted average with nonzero weight.

use tracing::debug;

use crate::{
    data::LocalDataset,
    model::{Loss, Metric, Model},
};

/// The outcome of evaluating the model on one local partition.
///
/// When `example_count` is zero the partition was empty and the means carry
/// no information; such an outcome contributes zero weight downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub example_count: usize,
    pub mean_metric: f64,
    pub mean_loss: f64,
}

/// Runs inference over the whole partition once and returns the mean metric
/// and loss, weighted by batch size. Loss or metric failures propagate
/// unmodified and are fatal for the client's round.
pub fn run_evaluation(
    model: &dyn Model,
    loss: &dyn Loss,
    metric: &dyn Metric,
    data: &LocalDataset,
) -> anyhow::Result<Evaluation> {
    if data.is_empty() {
        debug!("evaluation partition is empty, reporting the zero-weight sentinel");
        return Ok(Evaluation {
            example_count: 0,
            mean_metric: 0.0,
            mean_loss: 0.0,
        });
    }

    let mut running_loss = 0.0;
    let mut running_metric = 0.0;
    for batch in data.iter() {
        let predictions = model.forward(&batch.features)?;
        let batch_loss = loss.compute(&predictions, &batch.labels)?;
        let batch_metric = metric.score(&predictions, &batch.labels)?;
        let weight = batch.len() as f64;
        running_loss += batch_loss * weight;
        running_metric += batch_metric * weight;
    }

    let total = data.example_count() as f64;
    Ok(Evaluation {
        example_count: data.example_count(),
        mean_metric: running_metric / total,
        mean_loss: running_loss / total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{dataset, rank1_batch, ConstantModel, FixedMetric, SquaredError};

    #[test]
    fn empty_partition_returns_the_zero_weight_sentinel() {
        let model = ConstantModel::new(0.0);
        let evaluation = run_evaluation(
            &model,
            &SquaredError,
            &FixedMetric(0.9),
            &LocalDataset::empty(),
        )
        .unwrap();
        assert_eq!(
            evaluation,
            Evaluation {
                example_count: 0,
                mean_metric: 0.0,
                mean_loss: 0.0,
            }
        );
    }

    #[test]
    fn means_are_batch_size_weighted() {
        let model = ConstantModel::new(0.0);
        let data = dataset(vec![
            rank1_batch(&[0.0; 3], &[2.0; 3]), // squared error 4.0
            rank1_batch(&[0.0; 1], &[0.0; 1]), // squared error 0.0
        ]);
        let evaluation =
            run_evaluation(&model, &SquaredError, &FixedMetric(0.25), &data).unwrap();
        assert_eq!(evaluation.example_count, 4);
        assert!((evaluation.mean_loss - 3.0).abs() < 1e-12);
        assert!((evaluation.mean_metric - 0.25).abs() < 1e-12);
    }

    #[test]
    fn loss_failures_propagate() {
        let model = ConstantModel::new(0.0);
        let data = dataset(vec![rank1_batch(&[0.0; 2], &[1.0; 2])]);
        assert!(run_evaluation(
            &model,
            &crate::testutils::FailingLoss,
            &FixedMetric(0.0),
            &data
        )
        .is_err());
    }
}
