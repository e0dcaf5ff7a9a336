//! Drives a federation over synthetic centers: the round driver side of the
//! protocol. Each center owns a private partition of a synthetic binary
//! classification problem; the coordinator runs training rounds and logs the
//! published summaries.

use std::{collections::HashSet, path::PathBuf, process, time::Duration};

use ndarray::{Array1, Array2};
use rand::Rng;
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use fedheart::{
    baseline::{Adam, Baseline, BaselineLoss, RocAuc, Sgd},
    client::{ClientTrainer, RoundMode},
    data::{Batch, LocalDataset},
    model::{Model, Optimizer},
    round::{Aggregator, WeightedAverage},
    selector::{RandomSelector, Selector},
    settings::{OptimizerKind, Settings},
    telemetry::TracingSink,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    /// Number of training rounds to run
    #[structopt(long, default_value = "10")]
    rounds: u64,

    /// Number of data-holding centers in the federation
    #[structopt(long, default_value = "4")]
    centers: usize,

    /// Number of input features of the synthetic problem
    #[structopt(long, default_value = "8")]
    features: usize,

    /// Number of training examples per center
    #[structopt(long, default_value = "64")]
    examples: usize,
}

fn synthetic_partition(
    rng: &mut impl Rng,
    true_weights: &Array1<f32>,
    examples: usize,
    batch_size: usize,
) -> LocalDataset {
    let dim = true_weights.len();
    let mut batches = Vec::new();
    let mut start = 0;
    while start < examples {
        let size = batch_size.min(examples - start);
        let mut features = Array2::<f32>::zeros((size, dim));
        let mut labels = Array1::<f32>::zeros(size);
        for row in 0..size {
            let mut logit = 0.0;
            for col in 0..dim {
                let value: f32 = rng.gen_range(-1.0..1.0);
                features[[row, col]] = value;
                logit += value * true_weights[col];
            }
            labels[row] = if logit > 0.0 { 1.0 } else { 0.0 };
        }
        batches.push(Batch::new(features.into_dyn(), labels.into_dyn()));
        start += size;
    }
    LocalDataset::new(batches)
}

fn local_optimizer(kind: OptimizerKind, learning_rate: f32, weight_decay: f32) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate, weight_decay)),
        OptimizerKind::Sgd => Box::new(Sgd::new(learning_rate, weight_decay)),
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        log: log_settings,
        training,
        round,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let mut rng = rand::thread_rng();
    let true_weights: Array1<f32> =
        Array1::from_iter((0..opt.features).map(|_| rng.gen_range(-1.0..1.0)));

    let mut aggregator = Aggregator::new(
        Baseline::new(opt.features).get_parameters(),
        training.clone(),
        round.timeout_secs.map(Duration::from_secs),
        Box::new(WeightedAverage),
        TracingSink,
    );

    for center in 0..opt.centers {
        let train_data =
            synthetic_partition(&mut rng, &true_weights, opt.examples, training.batch_size);
        let eval_data = synthetic_partition(
            &mut rng,
            &true_weights,
            opt.examples / 4,
            training.batch_size,
        );
        let client = ClientTrainer::new(
            Box::new(Baseline::new(opt.features)),
            local_optimizer(
                training.optimizer,
                training.learning_rate as f32,
                training.weight_decay as f32,
            ),
            Box::new(BaselineLoss),
            Box::new(RocAuc),
            train_data,
            eval_data,
        );
        let id = aggregator.add_client(Box::new(client));
        info!(center, client = %id, "registered center");
    }

    let pool: HashSet<_> = aggregator.client_ids().into_iter().collect();
    let mut selector = RandomSelector;
    info!(
        experiment = %training.experiment_name,
        rounds = opt.rounds,
        clients_per_round = training.clients_per_round,
        "starting federation"
    );
    for _ in 0..opt.rounds {
        let selection = selector.select(&pool, training.clients_per_round);
        match aggregator.run_round(&selection, RoundMode::Training).await {
            Ok(summary) => info!(
                round = summary.round_index,
                metric = summary.weighted_mean_metric,
                loss = summary.weighted_mean_loss,
                "round complete"
            ),
            Err(err) => error!(cause = %err, "round failed"),
        }
    }
}
