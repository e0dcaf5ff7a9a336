use std::collections::HashMap;
use std::time::Duration;

use futures::future;
use tracing::{debug, error, error_span, info, warn, Instrument};

use crate::{
    client::{ClientApi, ClientRoundError, ClientRoundOutcome, RoundMode},
    common::ClientId,
    model::{ModelParameters, VersionedParameters},
    round::{
        aggregation::{self, CombineError, ParameterAggregation},
        PhaseName, RoundError, RoundResult, RoundSummary,
    },
    settings::TrainingSettings,
    telemetry::{ClientRoundRecord, RoundRecord, TelemetrySink},
};

/// The server-side coordinator of the round protocol.
///
/// Owns the canonical model parameters and the registered clients. The round
/// driver calls [`run_round`] once per round with the ordered selection;
/// rounds are strictly sequential and the canonical parameters are replaced
/// only during the publish phase, never while a round is in flight.
///
/// [`run_round`]: Aggregator::run_round
pub struct Aggregator<S> {
    round_id: u64,
    params: VersionedParameters,
    clients: HashMap<ClientId, Box<dyn ClientApi + Send>>,
    training: TrainingSettings,
    /// Per-client deadline within a round; a slow client contributes zero
    /// weight once it expires.
    timeout: Option<Duration>,
    combiner: Box<dyn ParameterAggregation>,
    sink: S,
}

impl<S> Aggregator<S>
where
    S: TelemetrySink,
{
    pub fn new(
        initial_params: ModelParameters,
        training: TrainingSettings,
        timeout: Option<Duration>,
        combiner: Box<dyn ParameterAggregation>,
        sink: S,
    ) -> Self {
        Self {
            round_id: 0,
            params: VersionedParameters::new(initial_params),
            clients: HashMap::new(),
            training,
            timeout,
            combiner,
            sink,
        }
    }

    /// Registers a client and returns its identifier.
    pub fn add_client(&mut self, client: Box<dyn ClientApi + Send>) -> ClientId {
        let id = client.id();
        self.clients.insert(id, client);
        id
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// The version of the canonical parameters, bumped on every training
    /// publish.
    pub fn params_version(&self) -> u64 {
        self.params.version()
    }

    /// A snapshot of the canonical parameters.
    pub fn global_params(&self) -> ModelParameters {
        self.params.snapshot()
    }

    /// Runs one full round over the given ordered selection.
    ///
    /// On success the published [`RoundSummary`] is returned; on failure the
    /// round is reported and aborted without publishing anything, and the
    /// driver decides whether to retry or skip.
    pub async fn run_round(
        &mut self,
        selection: &[ClientId],
        mode: RoundMode,
    ) -> Result<RoundSummary, RoundError> {
        self.round_id += 1;
        let round_id = self.round_id;
        let span = error_span!("round", id = round_id, mode = %mode);
        let result = async move { self.execute_round(round_id, selection, mode).await }
            .instrument(span)
            .await;
        if let Err(ref err) = result {
            error!(round = round_id, cause = %err, "round failed, no summary published");
        }
        result
    }

    async fn execute_round(
        &mut self,
        round_id: u64,
        selection: &[ClientId],
        mode: RoundMode,
    ) -> Result<RoundSummary, RoundError> {
        debug!(phase = %PhaseName::SelectClients, clients = selection.len());
        for client_id in selection {
            if !self.clients.contains_key(client_id) {
                return Err(RoundError::UnknownClient {
                    round_index: round_id,
                    client_id: *client_id,
                });
            }
        }
        let positions: HashMap<ClientId, usize> = selection
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect();

        debug!(phase = %PhaseName::Dispatch, params_version = self.params.version());
        let params = self.params.snapshot();
        let timeout = self.timeout;
        let training = &self.training;
        let mut participants: Vec<(ClientId, &mut Box<dyn ClientApi + Send>)> = self
            .clients
            .iter_mut()
            .filter(|(id, _)| positions.contains_key(id))
            .map(|(id, client)| (*id, client))
            .collect();
        participants.sort_by_key(|(id, _)| positions[id]);

        let dispatched = participants.into_iter().map(|(id, client)| {
            let params = params.clone();
            async move {
                let outcome = match timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, client.run_round(params, mode, training))
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(_) => Err(ClientRoundError::Timeout),
                        }
                    }
                    None => client.run_round(params, mode, training).await,
                };
                (id, outcome)
            }
        });

        // the barrier: every client has reported a result or a failure
        // before anything is aggregated
        let collected: Vec<(ClientId, Result<ClientRoundOutcome, ClientRoundError>)> =
            future::join_all(dispatched).await;
        debug!(phase = %PhaseName::Collect, collected = collected.len());

        let mut outcomes = Vec::with_capacity(collected.len());
        for (client_id, outcome) in collected {
            match outcome {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(client = %client_id, cause = %err, "client failed, contributing zero weight this round");
                }
            }
        }

        debug!(phase = %PhaseName::Aggregate, reporting = outcomes.len());
        let results: Vec<RoundResult> = outcomes.iter().map(|o| o.result.clone()).collect();
        let summary = aggregation::weighted_summary(round_id, &results)?;

        debug!(phase = %PhaseName::Publish);
        if mode == RoundMode::Training {
            self.publish_parameters(round_id, &outcomes)?;
        }
        self.record_telemetry(round_id, &outcomes, &summary);
        info!(
            round = round_id,
            metric = summary.weighted_mean_metric,
            loss = summary.weighted_mean_loss,
            "round summary published"
        );
        Ok(summary)
    }

    /// Replaces the canonical parameters with the combined client updates.
    /// If no client trained on any data this round, the canonical copy is
    /// left unchanged.
    fn publish_parameters(
        &mut self,
        round_id: u64,
        outcomes: &[ClientRoundOutcome],
    ) -> Result<(), RoundError> {
        let updates: Vec<(usize, ModelParameters)> = outcomes
            .iter()
            .filter_map(|outcome| outcome.update.as_ref())
            .map(|update| (update.example_count, update.params.clone()))
            .collect();
        match self.combiner.combine(&updates) {
            Ok(combined) => {
                let version = self
                    .params
                    .publish(combined)
                    .map_err(|source| RoundError::Publish {
                        round_index: round_id,
                        source,
                    })?;
                info!(version, "canonical parameters updated");
                Ok(())
            }
            Err(CombineError::Empty) | Err(CombineError::ZeroWeight) => {
                warn!("no trained updates this round, canonical parameters unchanged");
                Ok(())
            }
            Err(source @ CombineError::Shape(_)) => Err(RoundError::Combine {
                round_index: round_id,
                source,
            }),
        }
    }

    fn record_telemetry(
        &self,
        round_id: u64,
        outcomes: &[ClientRoundOutcome],
        summary: &RoundSummary,
    ) {
        for outcome in outcomes {
            self.sink.record_client_round(ClientRoundRecord {
                round_index: round_id,
                center: outcome.result.client_id,
                dataset_size: outcome.result.example_count,
                device: "cpu".to_string(),
                learning_rate: self.training.learning_rate,
                batch_size: self.training.batch_size,
                optimizer: self.training.optimizer.to_string(),
                weight_decay: self.training.weight_decay,
                metric_name: outcome.metric_name.clone(),
                metric_value: outcome.result.mean_metric,
                loss: outcome.result.mean_loss,
            });
        }
        self.sink.record_round(RoundRecord {
            round_index: round_id,
            loss: summary.weighted_mean_loss,
            evaluation_result: summary.weighted_mean_metric,
        });
    }
}
