//! The client side of the round protocol.
//!
//! A [`ClientTrainer`] owns one participant's identity, its private local
//! datasets and its working copy of the model. The coordinator talks to it
//! exclusively through the [`ClientApi`] trait: a parameter get/set pair and
//! a single per-round entry point that runs the local training and/or
//! evaluation steps and reports the results upstream. The working parameters
//! are ephemeral; they are overwritten at the start of every round the
//! client participates in.

pub mod evaluate;
pub mod train;

pub use self::{
    evaluate::{run_evaluation, Evaluation},
    train::{run_training, EpochRecord},
};

use async_trait::async_trait;
use derive_more::Display;
use thiserror::Error;
use tracing::debug;

use crate::{
    common::ClientId,
    data::LocalDataset,
    model::{Loss, Metric, Model, ModelParameters, Optimizer, ShapeMismatchError},
    round::RoundResult,
    settings::TrainingSettings,
};

/// What a client is asked to do in a round.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum RoundMode {
    /// Evaluate the received parameters on the local evaluation partition.
    #[display(fmt = "evaluation")]
    Evaluation,
    /// Train on the local training partition, then evaluate.
    #[display(fmt = "training")]
    Training,
}

/// A client's updated parameters after local training, weighted by the
/// number of examples it trained on.
#[derive(Debug, Clone)]
pub struct ParameterUpdate {
    pub params: ModelParameters,
    pub example_count: usize,
}

/// Everything a client reports back for one round.
#[derive(Debug, Clone)]
pub struct ClientRoundOutcome {
    /// The scalar results the aggregator folds into the round summary.
    pub result: RoundResult,
    /// The trained parameters, present only in [`RoundMode::Training`].
    pub update: Option<ParameterUpdate>,
    /// The per-epoch training history, empty in evaluation rounds.
    pub history: Vec<EpochRecord>,
    /// The name of the metric behind [`RoundResult::mean_metric`].
    pub metric_name: String,
}

/// A failure that is fatal for this client's round. The aggregator treats
/// the client as contributing zero weight; the round continues for the
/// remaining clients.
#[derive(Debug, Error)]
pub enum ClientRoundError {
    /// A failure inside the local training or evaluation step, propagated
    /// unmodified from the model, loss, metric or optimizer.
    #[error("local step failed: {0}")]
    Step(#[from] anyhow::Error),
    /// The dispatched parameters did not match the client's model.
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),
    /// The client did not finish within the round deadline.
    #[error("client exceeded the round deadline")]
    Timeout,
}

/// The operations the coordinator may request from a client. All of them are
/// synchronous from the protocol's point of view and idempotent given
/// identical input.
#[async_trait]
pub trait ClientApi: Send {
    fn id(&self) -> ClientId;

    /// Returns a snapshot of the working parameters, safe for the caller to
    /// mutate.
    async fn get_parameters(&self) -> ModelParameters;

    /// Replaces the working parameters wholesale. An incompatible payload is
    /// rejected without partially applying anything.
    async fn set_parameters(&mut self, params: ModelParameters)
        -> Result<(), ShapeMismatchError>;

    /// Runs one round on this client: install the dispatched parameters,
    /// run the local step(s) for `mode` and report the outcome.
    async fn run_round(
        &mut self,
        params: ModelParameters,
        mode: RoundMode,
        config: &TrainingSettings,
    ) -> Result<ClientRoundOutcome, ClientRoundError>;
}

/// A participant: one client's identity, model and private data.
pub struct ClientTrainer {
    id: ClientId,
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    loss: Box<dyn Loss>,
    metric: Box<dyn Metric>,
    train_data: LocalDataset,
    eval_data: LocalDataset,
}

impl ClientTrainer {
    pub fn new(
        model: Box<dyn Model>,
        optimizer: Box<dyn Optimizer>,
        loss: Box<dyn Loss>,
        metric: Box<dyn Metric>,
        train_data: LocalDataset,
        eval_data: LocalDataset,
    ) -> Self {
        Self {
            id: ClientId::new(),
            model,
            optimizer,
            loss,
            metric,
            train_data,
            eval_data,
        }
    }
}

#[async_trait]
impl ClientApi for ClientTrainer {
    fn id(&self) -> ClientId {
        self.id
    }

    async fn get_parameters(&self) -> ModelParameters {
        self.model.get_parameters()
    }

    async fn set_parameters(
        &mut self,
        params: ModelParameters,
    ) -> Result<(), ShapeMismatchError> {
        debug!(client = %self.id, "set_parameters");
        self.model.set_parameters(params)
    }

    async fn run_round(
        &mut self,
        params: ModelParameters,
        mode: RoundMode,
        config: &TrainingSettings,
    ) -> Result<ClientRoundOutcome, ClientRoundError> {
        self.model.set_parameters(params)?;

        let (update, history) = match mode {
            RoundMode::Training => {
                debug!(client = %self.id, examples = self.train_data.example_count(), "starting local training");
                let history = train::run_training(
                    self.model.as_mut(),
                    self.optimizer.as_mut(),
                    self.loss.as_ref(),
                    self.metric.as_ref(),
                    &self.train_data,
                    config.epochs,
                )?;
                let update = ParameterUpdate {
                    params: self.model.get_parameters(),
                    example_count: self.train_data.example_count(),
                };
                (Some(update), history)
            }
            RoundMode::Evaluation => (None, Vec::new()),
        };

        let evaluation = evaluate::run_evaluation(
            self.model.as_ref(),
            self.loss.as_ref(),
            self.metric.as_ref(),
            &self.eval_data,
        )?;

        Ok(ClientRoundOutcome {
            result: RoundResult {
                client_id: self.id,
                example_count: evaluation.example_count,
                mean_metric: evaluation.mean_metric,
                mean_loss: evaluation.mean_loss,
            },
            update,
            history,
            metric_name: self.metric.name().to_string(),
        })
    }
}
