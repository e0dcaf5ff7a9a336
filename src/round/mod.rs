//! The server side of the round protocol.
//!
//! A round moves through five phases:
//!
//! ```text
//! SelectClients -> Dispatch -> Collect -> Aggregate -> Publish
//! ```
//!
//! **SelectClients.** The round driver supplies the ordered list of
//! participating client ids, fixed for the round.
//!
//! **Dispatch.** The aggregator sends a snapshot of the canonical parameters
//! to every selected client and asks it to run its local step(s). Dispatch
//! fans out into one task per client; clients are independent within a
//! round.
//!
//! **Collect.** The barrier: aggregation never starts before every
//! dispatched client has returned a [`RoundResult`] or a fatal
//! [`ClientRoundError`] for the round. A failed or timed-out client
//! contributes zero weight; the round continues for the rest.
//!
//! **Aggregate.** Scalar results are combined into an example-count-weighted
//! mean. If every selected client reported zero examples the round aborts
//! with [`NoDataError`] instead of publishing an undefined summary.
//!
//! **Publish.** The [`RoundSummary`] goes to the telemetry sink and, in the
//! training flow, the canonical parameters are replaced by the combined
//! client updates. Rounds are strictly sequential: the next round never
//! starts before publish completes.
//!
//! [`ClientRoundError`]: crate::client::ClientRoundError

pub mod aggregation;
mod aggregator;

pub use self::{
    aggregation::{Authoritative, CombineError, ParameterAggregation, WeightedAverage},
    aggregator::Aggregator,
};

use derive_more::Display;
use thiserror::Error;

use crate::common::ClientId;

/// The name of the phase a round is currently in, for logs and spans.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "SelectClients")]
    SelectClients,
    #[display(fmt = "Dispatch")]
    Dispatch,
    #[display(fmt = "Collect")]
    Collect,
    #[display(fmt = "Aggregate")]
    Aggregate,
    #[display(fmt = "Publish")]
    Publish,
}

/// One client's scalar results for one round.
///
/// Created fresh by the client after its local step(s), consumed exactly
/// once by the aggregator, never mutated. `example_count = 0` is the
/// canonical empty-partition sentinel: the result still exists but carries
/// zero weight.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundResult {
    pub client_id: ClientId,
    pub example_count: usize,
    pub mean_metric: f64,
    pub mean_loss: f64,
}

/// The published outcome of one round, immutable once computed.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub round_index: u64,
    pub weighted_mean_metric: f64,
    pub weighted_mean_loss: f64,
}

/// Every selected client reported an empty partition: there is nothing to
/// weight a summary by, so the round is aborted rather than published.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("round {round_index}: every selected client reported an empty partition")]
pub struct NoDataError {
    pub round_index: u64,
}

/// A round-level failure. No summary is published for a failed round; the
/// round driver decides whether to retry or skip.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error(transparent)]
    NoData(#[from] NoDataError),
    #[error("round {round_index}: client {client_id} is not registered")]
    UnknownClient {
        round_index: u64,
        client_id: ClientId,
    },
    #[error("round {round_index}: failed to combine parameter updates: {source}")]
    Combine {
        round_index: u64,
        source: CombineError,
    },
    #[error("round {round_index}: combined parameters were rejected: {source}")]
    Publish {
        round_index: u64,
        source: crate::model::ShapeMismatchError,
    },
}
