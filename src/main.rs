//! Trains the convolutional MNIST classifier provided by `mnist_pipeline`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release -- -h
//! RUST_LOG=info cargo run --release
//! ```
//!
//! Downloads MNIST into the data directory unless `--offline` is given, trains for the given
//! number of epochs and keeps the last and best checkpoints. Metrics are appended to a JSON lines
//! log and the loss curves are plotted next to it.

use std::{error::Error, path::PathBuf, sync::Arc};

use clap::Parser;
use mnist_pipeline::{
    dataloader::DataLoader,
    datasets::{Dataset, MnistDataset},
    file_structure::FileStructManager,
    loss::NLLLoss,
    model::Net,
    monitoring::{LogMonitor, LossPlotMonitor},
    nn::Module,
    optim::SGD,
    train_config::{Stage, TrainConfig},
    trainer::Trainer,
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "data/dataset")]
    data_dir: PathBuf,
    #[clap(long, default_value = "data/checkpoints")]
    checkpoints_dir: PathBuf,
    #[clap(long, default_value = "data/logs")]
    logdir: PathBuf,
    /// Prefix of every checkpoint and log file name
    #[clap(long)]
    prefix: Option<String>,
    #[clap(short, long, default_value_t = 4)]
    batch_size: usize,
    /// Threads loading samples, 0 loads them on the training thread
    #[clap(short = 'w', long, default_value_t = 2)]
    num_workers: usize,
    #[clap(short, long, default_value_t = 50)]
    epochs: usize,
    #[clap(short, long, default_value_t = 1e-4)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.5)]
    momentum: f32,
    #[clap(long, default_value_t = format!("train_mnist"))]
    experiment_name: String,
    /// Fail instead of downloading missing dataset files
    #[clap(long, default_value_t = false)]
    offline: bool,
    /// Continue from the last checkpoint
    #[clap(long, default_value_t = false)]
    resume: bool,
    /// Continue from the best checkpoint
    #[clap(long, default_value_t = false, conflicts_with = "resume")]
    resume_best: bool,
    /// Seeds weight initialization and shuffling
    #[clap(short, long)]
    seed: Option<u64>,
    /// Multiplies the learning rate by this factor when the validation loss stalls
    #[clap(long)]
    lr_decay: Option<f32>,
    /// Epochs without improvement before the learning rate decays
    #[clap(long, default_value_t = 5)]
    lr_patience: usize,
    #[clap(long, default_value_t = false)]
    no_progress: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut rng = match args.seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::from_rng(&mut rand::rng()),
    };
    let model = Net::new(&mut rng);

    let download = !args.offline;
    let train_set: Arc<dyn Dataset> = Arc::new(MnistDataset::new(&args.data_dir, true, download)?);
    let test_set: Arc<dyn Dataset> = Arc::new(MnistDataset::new(&args.data_dir, false, download)?);
    let train_loader = DataLoader::new(vec![train_set], args.batch_size, args.num_workers)?;
    let test_loader =
        DataLoader::new(vec![test_set], args.batch_size, args.num_workers)?.shuffle(false);

    let optimizer = SGD::new(model.parameters(), args.lr, args.momentum);
    let config = TrainConfig::new(
        vec![Stage::train(train_loader), Stage::validation(test_loader)],
        NLLLoss,
        optimizer,
        args.experiment_name,
    );
    let fsm = FileStructManager::new(args.checkpoints_dir, args.logdir, args.prefix);

    let mut trainer = Trainer::new(model, config, fsm.clone())
        .set_epoch_num(args.epochs)
        .add_monitor(LogMonitor::new(&fsm))
        .add_monitor(LossPlotMonitor::new(&fsm))
        .show_progress(!args.no_progress);
    if let Some(coeff) = args.lr_decay {
        trainer = trainer.enable_lr_decaying(coeff, args.lr_patience);
    }
    if args.resume || args.resume_best {
        trainer = trainer.resume(args.resume_best);
    }
    if let Some(seed) = args.seed {
        trainer = trainer.with_seed(seed);
    }

    let reports = trainer.train()?;
    match reports.iter().filter(|r| r.is_best).next_back() {
        Some(best) => log::info!(
            "Best epoch {}: {:?}",
            best.epoch,
            best.records.iter().map(|r| &r.metrics).collect::<Vec<_>>()
        ),
        None => log::info!("No epoch improved on the resumed checkpoint"),
    }
    Ok(())
}
