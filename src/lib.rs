//! # Fedheart: round-based federated training for clinical classifiers
//!
//! Multiple data-holding centers ("clients") each own a private partition of
//! a clinical dataset that can never leave their premises. A central
//! coordinator orchestrates training anyway: per round it publishes the
//! canonical model parameters to a selected subset of clients, every client
//! fits and/or evaluates the model on its local partition, and the
//! coordinator combines the reported scalar results into a single
//! example-count-weighted round summary. Raw data is never transmitted; the
//! only payloads are model parameters and scalar metrics.
//!
//! The crate is organized around the round protocol:
//!
//! - [`model`] defines the parameter exchange format ([`ModelParameters`])
//!   and the traits behind which the actual model, loss, metric and
//!   optimizer live. Those are external collaborators: the protocol treats
//!   them as opaque.
//! - [`data`] defines the pre-batched local dataset a client is constructed
//!   with.
//! - [`client`] implements the client side: parameter get/set and the local
//!   training and evaluation steps.
//! - [`round`] implements the server side: the
//!   `SelectClients → Dispatch → Collect → Aggregate → Publish` phases of a
//!   round, weighted scalar aggregation and parameter combination.
//! - [`telemetry`] is the injected sink the coordinator reports summaries
//!   and per-client round records to.
//! - [`settings`] loads and validates the run configuration.
//! - [`baseline`] provides a small self-contained logistic-regression task
//!   (model, loss, metrics, optimizers) so the `coordinator` binary can
//!   drive a real federation over synthetic centers.
//!
//! [`ModelParameters`]: crate::model::ModelParameters

pub mod baseline;
pub mod client;
pub mod common;
pub mod data;
pub mod model;
pub mod round;
pub mod selector;
pub mod settings;
pub mod telemetry;
pub mod testutils;
