//! The experiment-tracking sink the coordinator reports to.
//!
//! The round protocol only *produces* telemetry records; where they go is an
//! external concern. The sink is injected into the coordinator behind the
//! [`TelemetrySink`] trait so the core has zero dependency on any particular
//! transport or storage.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

use crate::common::ClientId;

/// The round-level record emitted once per published round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundRecord {
    pub round_index: u64,
    pub loss: f64,
    pub evaluation_result: f64,
}

/// The per-client record emitted for every client that reported a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRoundRecord {
    pub round_index: u64,
    pub center: ClientId,
    pub dataset_size: usize,
    pub device: String,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub optimizer: String,
    pub weight_decay: f64,
    pub metric_name: String,
    pub metric_value: f64,
    pub loss: f64,
}

pub trait TelemetrySink: Send + Sync {
    fn record_round(&self, record: RoundRecord);
    fn record_client_round(&self, record: ClientRoundRecord);
}

/// Emits every record as a structured log line.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_round(&self, record: RoundRecord) {
        info!(
            target: "telemetry",
            round_index = record.round_index,
            loss = record.loss,
            evaluation_result = record.evaluation_result,
            "round summary"
        );
    }

    fn record_client_round(&self, record: ClientRoundRecord) {
        info!(
            target: "telemetry",
            round_index = record.round_index,
            center = %record.center,
            dataset_size = record.dataset_size,
            device = %record.device,
            learning_rate = record.learning_rate,
            batch_size = record.batch_size,
            optimizer = %record.optimizer,
            weight_decay = record.weight_decay,
            metric = %record.metric_name,
            metric_value = record.metric_value,
            loss = record.loss,
            "client round"
        );
    }
}

/// Discards every record.
#[derive(Debug, Default)]
pub struct NoSink;

impl TelemetrySink for NoSink {
    fn record_round(&self, _record: RoundRecord) {}
    fn record_client_round(&self, _record: ClientRoundRecord) {}
}

#[derive(Debug, Default)]
struct Records {
    rounds: Vec<RoundRecord>,
    client_rounds: Vec<ClientRoundRecord>,
}

/// Captures every record in memory. Clones share the same storage, so a
/// caller can keep one handle while the coordinator owns the other.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    records: Arc<Mutex<Records>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rounds(&self) -> Vec<RoundRecord> {
        self.lock().rounds.clone()
    }

    pub fn client_rounds(&self) -> Vec<ClientRoundRecord> {
        self.lock().client_rounds.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        // a poisoned lock still holds valid records
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TelemetrySink for InMemorySink {
    fn record_round(&self, record: RoundRecord) {
        self.lock().rounds.push(record);
    }

    fn record_client_round(&self, record: ClientRoundRecord) {
        self.lock().client_rounds.push(record);
    }
}
