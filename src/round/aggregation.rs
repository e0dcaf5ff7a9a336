//! Weighted aggregation of per-client results.
//!
//! Scalar aggregation is the heart of the round protocol: the weighted mean
//! over `(example_count, value)` pairs, commutative and associative, so
//! dispatch order never affects the numbers. Parameter aggregation is a
//! pluggable strategy behind [`ParameterAggregation`] since the protocol
//! itself does not mandate one.

use ndarray::ArrayD;
use thiserror::Error;

use crate::{
    model::{ModelParameters, ShapeMismatchError},
    round::{NoDataError, RoundResult, RoundSummary},
};

/// Combines the round results of the selected clients into a round summary.
///
/// `weighted_mean = Σ(example_count_i · value_i) / Σ(example_count_i)`,
/// applied to metric and loss alike. Zero-count results contribute nothing;
/// if the total count is zero the round carries no data and aggregation
/// fails instead of producing NaN.
pub fn weighted_summary(
    round_index: u64,
    results: &[RoundResult],
) -> Result<RoundSummary, NoDataError> {
    let total: usize = results.iter().map(|r| r.example_count).sum();
    if total == 0 {
        return Err(NoDataError { round_index });
    }
    let total = total as f64;
    let weighted_mean_metric = results
        .iter()
        .map(|r| r.example_count as f64 * r.mean_metric)
        .sum::<f64>()
        / total;
    let weighted_mean_loss = results
        .iter()
        .map(|r| r.example_count as f64 * r.mean_loss)
        .sum::<f64>()
        / total;
    Ok(RoundSummary {
        round_index,
        weighted_mean_metric,
        weighted_mean_loss,
    })
}

/// An error returned by a [`ParameterAggregation`] strategy.
#[derive(Debug, Error)]
pub enum CombineError {
    #[error("no parameter updates to combine")]
    Empty,
    #[error("the parameter updates carry zero total weight")]
    ZeroWeight,
    #[error(transparent)]
    Shape(#[from] ShapeMismatchError),
}

/// A strategy for combining per-client parameter updates into the next
/// canonical parameters. Each update is paired with its weight, the number
/// of examples the client trained on.
pub trait ParameterAggregation: Send + Sync {
    fn combine(
        &self,
        updates: &[(usize, ModelParameters)],
    ) -> Result<ModelParameters, CombineError>;
}

/// Federated averaging: the example-count-weighted mean of the client
/// updates, layer by layer.
#[derive(Debug, Default)]
pub struct WeightedAverage;

impl ParameterAggregation for WeightedAverage {
    fn combine(
        &self,
        updates: &[(usize, ModelParameters)],
    ) -> Result<ModelParameters, CombineError> {
        let (_, reference) = updates.first().ok_or(CombineError::Empty)?;
        for (_, update) in &updates[1..] {
            reference.check_compatible(update)?;
        }
        let total: usize = updates.iter().map(|(weight, _)| *weight).sum();
        if total == 0 {
            return Err(CombineError::ZeroWeight);
        }
        let total = total as f32;

        let combined = reference
            .iter()
            .enumerate()
            .map(|(layer, (name, tensor))| {
                let mut acc = ArrayD::<f32>::zeros(tensor.raw_dim());
                for (weight, update) in updates {
                    if *weight == 0 {
                        continue;
                    }
                    let scale = *weight as f32 / total;
                    if let Some((_, update_tensor)) = update.iter().nth(layer) {
                        acc = acc + &(update_tensor * scale);
                    }
                }
                (name.to_string(), acc)
            })
            .collect();
        Ok(combined)
    }
}

/// Takes the first selected client's update as-is, the single-path behavior
/// of a coordinator that performs no cross-client parameter averaging.
#[derive(Debug, Default)]
pub struct Authoritative;

impl ParameterAggregation for Authoritative {
    fn combine(
        &self,
        updates: &[(usize, ModelParameters)],
    ) -> Result<ModelParameters, CombineError> {
        updates
            .first()
            .map(|(_, params)| params.clone())
            .ok_or(CombineError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    use crate::common::ClientId;

    fn result(example_count: usize, mean_metric: f64, mean_loss: f64) -> RoundResult {
        RoundResult {
            client_id: ClientId::new(),
            example_count,
            mean_metric,
            mean_loss,
        }
    }

    fn update(weight: usize, values: &[f32]) -> (usize, ModelParameters) {
        let params = vec![("weight".to_string(), Array1::from_vec(values.to_vec()).into_dyn())]
            .into_iter()
            .collect();
        (weight, params)
    }

    #[test]
    fn weighted_mean_matches_manual_computation() {
        let results = [result(10, 0.8, 0.5), result(30, 0.6, 0.1)];
        let summary = weighted_summary(3, &results).unwrap();
        assert_eq!(summary.round_index, 3);
        assert!((summary.weighted_mean_metric - 0.65).abs() < 1e-12);
        assert!((summary.weighted_mean_loss - 0.2).abs() < 1e-12);
    }

    #[test]
    fn aggregation_is_order_independent() {
        let a = [result(10, 0.8, 0.5), result(30, 0.6, 0.1), result(5, 0.9, 0.3)];
        let mut b = a.clone();
        b.reverse();
        let first = weighted_summary(0, &a).unwrap();
        let second = weighted_summary(0, &b).unwrap();
        assert!((first.weighted_mean_metric - second.weighted_mean_metric).abs() < 1e-12);
        assert!((first.weighted_mean_loss - second.weighted_mean_loss).abs() < 1e-12);
    }

    #[test]
    fn zero_count_results_do_not_change_the_aggregate() {
        let base = [result(10, 0.8, 0.5), result(30, 0.6, 0.1)];
        let mut with_empty = base.to_vec();
        with_empty.push(result(0, 123.0, 456.0));
        let without = weighted_summary(0, &base).unwrap();
        let with = weighted_summary(0, &with_empty).unwrap();
        assert!((without.weighted_mean_metric - with.weighted_mean_metric).abs() < 1e-12);
        assert!((without.weighted_mean_loss - with.weighted_mean_loss).abs() < 1e-12);
    }

    #[test]
    fn all_zero_counts_fail_with_no_data() {
        let results = [result(0, 0.8, 0.5), result(0, 0.6, 0.1)];
        let err = weighted_summary(7, &results).unwrap_err();
        assert_eq!(err, NoDataError { round_index: 7 });
    }

    #[test]
    fn no_results_fail_with_no_data() {
        assert!(weighted_summary(0, &[]).is_err());
    }

    #[test]
    fn weighted_average_combines_proportionally() {
        let combined = WeightedAverage
            .combine(&[update(1, &[1.0]), update(3, &[3.0])])
            .unwrap();
        let tensor = combined.get("weight").unwrap();
        assert!((tensor[[0]] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn weighted_average_skips_zero_weight_updates() {
        let combined = WeightedAverage
            .combine(&[update(4, &[2.0]), update(0, &[100.0])])
            .unwrap();
        let tensor = combined.get("weight").unwrap();
        assert!((tensor[[0]] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn weighted_average_rejects_zero_total_weight() {
        assert!(matches!(
            WeightedAverage.combine(&[update(0, &[1.0])]),
            Err(CombineError::ZeroWeight)
        ));
    }

    #[test]
    fn weighted_average_rejects_mismatched_updates() {
        assert!(matches!(
            WeightedAverage.combine(&[update(1, &[1.0]), update(1, &[1.0, 2.0])]),
            Err(CombineError::Shape(_))
        ));
    }

    #[test]
    fn authoritative_takes_the_first_update() {
        let combined = Authoritative
            .combine(&[update(1, &[7.0]), update(9, &[1.0])])
            .unwrap();
        assert!((combined.get("weight").unwrap()[[0]] - 7.0).abs() < 1e-6);
    }

    #[test]
    fn combining_nothing_is_an_error() {
        assert!(matches!(
            WeightedAverage.combine(&[]),
            Err(CombineError::Empty)
        ));
    }
}
