//! End-to-end round tests: a coordinator, a handful of in-process clients,
//! and the weighted aggregation contract between them.

use std::time::Duration;

use async_trait::async_trait;
use ndarray::ArrayD;

use fedheart::{
    baseline::{Baseline, BaselineLoss, Sgd},
    client::{ClientApi, ClientRoundError, ClientRoundOutcome, ClientTrainer, RoundMode},
    common::ClientId,
    model::{Loss, Model, ModelParameters, Optimizer, StepOutput},
    round::{Aggregator, Authoritative, ParameterAggregation, RoundError, WeightedAverage},
    settings::{OptimizerKind, TrainingSettings},
    telemetry::InMemorySink,
    testutils::{dataset, rank1_batch, reporting_client, ConstantModel, FailingMetric, FixedLoss, FixedMetric, FrozenOptimizer},
};

fn training_settings() -> TrainingSettings {
    TrainingSettings {
        epochs: 1,
        learning_rate: 0.5,
        batch_size: 4,
        optimizer: OptimizerKind::Sgd,
        clients_per_round: 2,
        experiment_name: "round-tests".to_string(),
        weight_decay: 0.0,
    }
}

fn aggregator(
    clients: Vec<ClientTrainer>,
    timeout: Option<Duration>,
    combiner: Box<dyn ParameterAggregation>,
) -> (Aggregator<InMemorySink>, InMemorySink, Vec<ClientId>) {
    let sink = InMemorySink::new();
    let mut aggregator = Aggregator::new(
        ConstantModel::new(0.0).get_parameters(),
        training_settings(),
        timeout,
        combiner,
        sink.clone(),
    );
    let ids = clients
        .into_iter()
        .map(|client| aggregator.add_client(Box::new(client)))
        .collect();
    (aggregator, sink, ids)
}

#[tokio::test]
async fn summary_is_the_example_count_weighted_mean() {
    let clients = vec![
        reporting_client(0.9, 0.1, 5),
        reporting_client(0.7, 0.3, 15),
    ];
    let (mut aggregator, sink, ids) = aggregator(clients, None, Box::new(WeightedAverage));

    let summary = aggregator
        .run_round(&ids, RoundMode::Evaluation)
        .await
        .unwrap();

    assert_eq!(summary.round_index, 1);
    assert!((summary.weighted_mean_metric - 0.75).abs() < 1e-12);
    assert!((summary.weighted_mean_loss - 0.25).abs() < 1e-12);

    let rounds = sink.rounds();
    assert_eq!(rounds.len(), 1);
    assert!((rounds[0].evaluation_result - 0.75).abs() < 1e-12);
    assert!((rounds[0].loss - 0.25).abs() < 1e-12);
    assert_eq!(sink.client_rounds().len(), 2);
}

#[tokio::test]
async fn an_empty_client_contributes_zero_weight() {
    let clients = vec![
        reporting_client(0.9, 0.1, 5),
        reporting_client(0.7, 0.3, 15),
        reporting_client(0.0, 0.0, 0),
    ];
    let (mut aggregator, sink, ids) = aggregator(clients, None, Box::new(WeightedAverage));

    let summary = aggregator
        .run_round(&ids, RoundMode::Evaluation)
        .await
        .unwrap();

    assert!((summary.weighted_mean_metric - 0.75).abs() < 1e-12);
    assert!((summary.weighted_mean_loss - 0.25).abs() < 1e-12);
    // the empty client still reported a result
    assert_eq!(sink.client_rounds().len(), 3);
}

#[tokio::test]
async fn a_round_without_any_data_is_aborted() {
    let clients = vec![reporting_client(0.5, 0.5, 0), reporting_client(0.1, 0.9, 0)];
    let (mut aggregator, sink, ids) = aggregator(clients, None, Box::new(WeightedAverage));

    let err = aggregator
        .run_round(&ids, RoundMode::Evaluation)
        .await
        .unwrap_err();

    assert!(matches!(err, RoundError::NoData(_)));
    assert!(sink.rounds().is_empty());
}

#[tokio::test]
async fn a_failing_client_contributes_zero_weight() {
    let healthy = reporting_client(0.8, 0.2, 10);
    let failing = ClientTrainer::new(
        Box::new(ConstantModel::new(0.0)),
        Box::new(FrozenOptimizer),
        Box::new(FixedLoss(0.0)),
        Box::new(FailingMetric),
        fedheart::data::LocalDataset::empty(),
        dataset(vec![rank1_batch(&[0.0; 6], &[0.0; 6])]),
    );
    let (mut aggregator, sink, ids) =
        aggregator(vec![healthy, failing], None, Box::new(WeightedAverage));

    let summary = aggregator
        .run_round(&ids, RoundMode::Evaluation)
        .await
        .unwrap();

    assert!((summary.weighted_mean_metric - 0.8).abs() < 1e-12);
    assert!((summary.weighted_mean_loss - 0.2).abs() < 1e-12);
    assert_eq!(sink.client_rounds().len(), 1);
}

#[tokio::test]
async fn dispatch_order_does_not_change_the_summary() {
    let first = {
        let clients = vec![reporting_client(0.9, 0.1, 5), reporting_client(0.7, 0.3, 15)];
        let (mut aggregator, _, ids) = aggregator(clients, None, Box::new(WeightedAverage));
        aggregator
            .run_round(&ids, RoundMode::Evaluation)
            .await
            .unwrap()
    };
    let second = {
        let clients = vec![reporting_client(0.7, 0.3, 15), reporting_client(0.9, 0.1, 5)];
        let (mut aggregator, _, ids) = aggregator(clients, None, Box::new(WeightedAverage));
        aggregator
            .run_round(&ids, RoundMode::Evaluation)
            .await
            .unwrap()
    };
    assert!((first.weighted_mean_metric - second.weighted_mean_metric).abs() < 1e-12);
    assert!((first.weighted_mean_loss - second.weighted_mean_loss).abs() < 1e-12);
}

#[tokio::test]
async fn an_unknown_client_aborts_the_round() {
    let (mut aggregator, _, mut ids) =
        aggregator(vec![reporting_client(0.5, 0.5, 5)], None, Box::new(WeightedAverage));
    ids.push(ClientId::new());
    let err = aggregator
        .run_round(&ids, RoundMode::Evaluation)
        .await
        .unwrap_err();
    assert!(matches!(err, RoundError::UnknownClient { .. }));
}

/// A client wrapper that stalls before doing any work.
struct SlowClient {
    inner: ClientTrainer,
    delay: Duration,
}

#[async_trait]
impl ClientApi for SlowClient {
    fn id(&self) -> ClientId {
        self.inner.id()
    }

    async fn get_parameters(&self) -> ModelParameters {
        self.inner.get_parameters().await
    }

    async fn set_parameters(
        &mut self,
        params: ModelParameters,
    ) -> Result<(), fedheart::model::ShapeMismatchError> {
        self.inner.set_parameters(params).await
    }

    async fn run_round(
        &mut self,
        params: ModelParameters,
        mode: RoundMode,
        config: &TrainingSettings,
    ) -> Result<ClientRoundOutcome, ClientRoundError> {
        tokio::time::sleep(self.delay).await;
        self.inner.run_round(params, mode, config).await
    }
}

#[tokio::test(start_paused = true)]
async fn a_timed_out_client_contributes_zero_weight() {
    let sink = InMemorySink::new();
    let mut aggregator = Aggregator::new(
        ConstantModel::new(0.0).get_parameters(),
        training_settings(),
        Some(Duration::from_millis(100)),
        Box::new(WeightedAverage),
        sink.clone(),
    );
    let fast = aggregator.add_client(Box::new(reporting_client(0.6, 0.4, 10)));
    let slow = aggregator.add_client(Box::new(SlowClient {
        inner: reporting_client(0.0, 0.0, 50),
        delay: Duration::from_secs(60),
    }));

    let summary = aggregator
        .run_round(&[fast, slow], RoundMode::Evaluation)
        .await
        .unwrap();

    assert!((summary.weighted_mean_metric - 0.6).abs() < 1e-12);
    assert!((summary.weighted_mean_loss - 0.4).abs() < 1e-12);
    assert_eq!(sink.client_rounds().len(), 1);
}

#[tokio::test]
async fn a_training_round_publishes_new_canonical_parameters() {
    let sink = InMemorySink::new();
    let mut aggregator = Aggregator::new(
        Baseline::new(2).get_parameters(),
        training_settings(),
        None,
        Box::new(WeightedAverage),
        sink.clone(),
    );
    let features = ndarray::arr2(&[[1.0, 0.5], [0.8, 1.0], [-1.0, -0.5], [-0.6, -1.0]]).into_dyn();
    let labels = ndarray::arr1(&[1.0, 1.0, 0.0, 0.0]).into_dyn();
    let data = dataset(vec![fedheart::data::Batch::new(features, labels)]);
    let client = ClientTrainer::new(
        Box::new(Baseline::new(2)),
        Box::new(Sgd::new(0.5, 0.0)),
        Box::new(BaselineLoss),
        Box::new(FixedMetric(1.0)),
        data.clone(),
        data,
    );
    let id = aggregator.add_client(Box::new(client));

    let before = aggregator.global_params();
    let summary = aggregator
        .run_round(&[id], RoundMode::Training)
        .await
        .unwrap();

    assert_eq!(aggregator.params_version(), 1);
    assert_ne!(aggregator.global_params(), before);
    assert!((summary.weighted_mean_metric - 1.0).abs() < 1e-12);
    assert_eq!(sink.rounds().len(), 1);
}

/// An optimizer that overwrites the model's single parameter with a fixed
/// value, making the published combination easy to predict.
struct SetTo(f32);

impl Optimizer for SetTo {
    fn step(
        &mut self,
        model: &mut dyn Model,
        loss: &dyn Loss,
        features: &ArrayD<f32>,
        labels: &ArrayD<f32>,
    ) -> anyhow::Result<StepOutput> {
        let mut params = model.get_parameters();
        if let Some(tensor) = params.get_mut("output") {
            tensor.fill(self.0);
        }
        model.set_parameters(params)?;
        let predictions = model.forward(features)?;
        let loss = loss.compute(&predictions, labels)?;
        Ok(StepOutput { loss, predictions })
    }
}

fn trained_client(value: f32, train_examples: usize) -> ClientTrainer {
    ClientTrainer::new(
        Box::new(ConstantModel::new(0.0)),
        Box::new(SetTo(value)),
        Box::new(FixedLoss(0.5)),
        Box::new(FixedMetric(0.5)),
        dataset(vec![rank1_batch(
            &vec![0.0; train_examples],
            &vec![0.0; train_examples],
        )]),
        dataset(vec![rank1_batch(&[0.0; 2], &[0.0; 2])]),
    )
}

#[tokio::test]
async fn training_updates_are_combined_by_example_count() {
    let (mut aggregator, _, ids) = aggregator(
        vec![trained_client(1.0, 1), trained_client(3.0, 3)],
        None,
        Box::new(WeightedAverage),
    );
    aggregator
        .run_round(&ids, RoundMode::Training)
        .await
        .unwrap();

    let combined = aggregator.global_params();
    let tensor = combined.get("output").unwrap();
    // (1 * 1.0 + 3 * 3.0) / 4
    assert!((tensor[[0]] - 2.5).abs() < 1e-6);
}

#[tokio::test]
async fn the_authoritative_combiner_takes_the_first_selected_update() {
    let (mut aggregator, _, ids) = aggregator(
        vec![trained_client(7.0, 1), trained_client(3.0, 9)],
        None,
        Box::new(Authoritative),
    );
    aggregator
        .run_round(&ids, RoundMode::Training)
        .await
        .unwrap();

    let tensor = aggregator.global_params();
    assert!((tensor.get("output").unwrap()[[0]] - 7.0).abs() < 1e-6);
}

#[tokio::test]
async fn rounds_are_numbered_sequentially() {
    let (mut aggregator, _, ids) =
        aggregator(vec![reporting_client(0.5, 0.5, 4)], None, Box::new(WeightedAverage));
    for expected in 1..=3u64 {
        let summary = aggregator
            .run_round(&ids[..1], RoundMode::Evaluation)
            .await
            .unwrap();
        assert_eq!(summary.round_index, expected);
    }
}
