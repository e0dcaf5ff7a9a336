//! The local training step.
//!
//! Runs a fixed number of optimization epochs over a client's training
//! partition, mutating the model in place. Per batch: one optimizer update,
//! then loss and metric accumulation weighted by batch size; per epoch the
//! accumulated values are divided by the partition's total example count.

use tracing::{debug, info};

use crate::{
    data::LocalDataset,
    model::{Loss, Metric, Model, Optimizer},
};

/// The loss and metric of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub epoch: u32,
    pub loss: f64,
    pub metric: f64,
}

/// Runs `epochs` full passes over `data`, updating `model` in place.
///
/// Returns the ordered per-epoch history. An empty partition short-circuits:
/// the model is left untouched and the history is empty, so there is never a
/// division by a zero example count. Any failure inside the optimizer, loss
/// or metric propagates unmodified; there is no partial-epoch retry.
pub fn run_training(
    model: &mut dyn Model,
    optimizer: &mut dyn Optimizer,
    loss: &dyn Loss,
    metric: &dyn Metric,
    data: &LocalDataset,
    epochs: u32,
) -> anyhow::Result<Vec<EpochRecord>> {
    if data.is_empty() {
        debug!("training partition is empty, skipping local training");
        return Ok(Vec::new());
    }

    let total = data.example_count() as f64;
    let mut history = Vec::with_capacity(epochs as usize);
    for epoch in 0..epochs {
        let mut running_loss = 0.0;
        let mut running_metric = 0.0;
        for batch in data.iter() {
            let output = optimizer.step(model, loss, &batch.features, &batch.labels)?;
            let score = metric.score(&output.predictions, &batch.labels)?;
            let weight = batch.len() as f64;
            running_loss += output.loss * weight;
            running_metric += score * weight;
        }
        let record = EpochRecord {
            epoch,
            loss: running_loss / total,
            metric: running_metric / total,
        };
        info!(
            epoch,
            loss = record.loss,
            metric = record.metric,
            "epoch finished"
        );
        history.push(record);
    }
    Ok(history)
}
