use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use saestack::checkpoint::{CheckpointManager, TAG_AFTER_INIT, TAG_AFTER_PRETRAINING, TAG_FINAL};
use saestack::criterion::{Criterion, Target};
use saestack::module::GradientModule;
use saestack::{Config, Dataset, PcaGradientEstimator, StackedTopology, StagedTrainer};

#[derive(Parser)]
#[command(name = "saestack")]
#[command(about = "Staged training of stacked autoencoders", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured phase schedule over a dataset
    Train {
        /// Configuration file (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Training dataset
        #[arg(short, long)]
        data: PathBuf,

        /// Held-out dataset for the final evaluation
        #[arg(long)]
        eval_data: Option<PathBuf>,
    },

    /// Validate a configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Estimate leading eigenpairs of the supervised gradient covariance
    Eigen {
        /// Configuration file (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Dataset supplying the gradient samples
        #[arg(short, long)]
        data: PathBuf,

        /// Number of eigenpairs to report
        #[arg(long, default_value_t = 3)]
        count: usize,

        /// Samples folded per covariance re-estimation
        #[arg(long, default_value_t = 32)]
        batch: usize,

        /// Weight kept on the previous covariance estimate per fold
        #[arg(long, default_value_t = 0.9)]
        discount: f64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train {
            config,
            data,
            eval_data,
        } => train(config, data, eval_data),
        Commands::Config { file } => validate_config(file),
        Commands::Eigen {
            config,
            data,
            count,
            batch,
            discount,
        } => estimate_eigen(config, data, count, batch, discount),
    }
}

fn train(config_path: PathBuf, data_path: PathBuf, eval_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let dataset =
        Dataset::load(&data_path).with_context(|| format!("loading {}", data_path.display()))?;
    info!(
        examples = dataset.len(),
        width = dataset.input_width(),
        labeled = dataset.is_labeled(),
        "dataset loaded"
    );

    let topology = StackedTopology::new(config.widths.clone(), config.topology.clone())?;
    if let Some(init) = &config.init_from {
        CheckpointManager::load_file(init, &topology)
            .with_context(|| format!("restoring {}", init.display()))?;
    }
    let checkpoints = config
        .checkpoint_dir
        .as_ref()
        .map(CheckpointManager::new)
        .transpose()?;
    if let Some(manager) = &checkpoints {
        manager.save(TAG_AFTER_INIT, &topology)?;
    }

    let mut trainer = StagedTrainer::new(&topology, config.trainer.clone())?;
    let last_pretraining = config
        .phases
        .iter()
        .rposition(|p| p.kind.is_pretraining());

    for (i, phase) in config.phases.iter().enumerate() {
        let reports = trainer
            .run_phase(phase, &dataset)
            .with_context(|| format!("phase {i} ({})", phase.kind.name()))?;
        for report in &reports {
            info!(
                phase = report.phase,
                epochs = report.epochs,
                loss = report.final_loss,
                converged = report.converged,
                "phase report"
            );
        }
        if Some(i) == last_pretraining {
            if let Some(manager) = &checkpoints {
                manager.save(TAG_AFTER_PRETRAINING, &topology)?;
            }
        }
    }

    if let Some(manager) = &checkpoints {
        manager.save(TAG_FINAL, &topology)?;
    }

    let eval_set = match &eval_path {
        Some(path) => {
            Some(Dataset::load(path).with_context(|| format!("loading {}", path.display()))?)
        }
        None => dataset.is_labeled().then_some(dataset),
    };
    if let Some(set) = eval_set {
        let eval = trainer.evaluate(&set)?;
        info!(
            loss = eval.loss,
            error_rate = eval.error_rate,
            "final evaluation"
        );
        println!(
            "loss {:.6}  error rate {:.2}%",
            eval.loss,
            eval.error_rate * 100.0
        );
    }
    Ok(())
}

fn validate_config(path: PathBuf) -> Result<()> {
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    println!(
        "ok: {} widths, {} hidden layers, {} phases",
        config.widths.len(),
        config.n_hidden(),
        config.phases.len()
    );
    for (i, phase) in config.phases.iter().enumerate() {
        println!(
            "  phase {i}: {} ({} epochs, rate {})",
            phase.kind.name(),
            phase.max_epochs,
            phase.learning_rate
        );
    }
    Ok(())
}

fn estimate_eigen(
    config_path: PathBuf,
    data_path: PathBuf,
    count: usize,
    batch: usize,
    discount: f64,
) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let dataset =
        Dataset::load(&data_path).with_context(|| format!("loading {}", data_path.display()))?;

    let topology = StackedTopology::new(config.widths.clone(), config.topology.clone())?;
    if let Some(init) = &config.init_from {
        CheckpointManager::load_file(init, &topology)?;
    }

    let mut view = topology.supervised()?;
    let groups = view.graph.param_groups();
    let dim: usize = groups.iter().map(|g| g.len()).sum();
    let mut estimator = PcaGradientEstimator::new(dim, batch, discount)?;
    let mut criterion =
        saestack::criterion::ClassNllCriterion::new(topology.output_width());

    for e in 0..dataset.len() {
        let input = dataset.input(e);
        let class = dataset.class(e)?;
        for g in &groups {
            g.zero_grad();
        }
        view.graph.forward(input)?;
        let out = view.graph.output().to_owned();
        criterion.backward(out.view(), Target::Class(class))?;
        view.graph.backward(input, criterion.gradient())?;

        let mut flat = Vec::with_capacity(dim);
        for g in &groups {
            flat.extend_from_slice(&g.grad());
        }
        estimator.observe(&flat)?;
    }

    let (values, vectors) = estimator.leading_eigen(count.min(dim))?;
    println!("folds: {}", estimator.folds());
    for (i, value) in values.iter().enumerate() {
        let norm: f64 = vectors[i].iter().map(|x| x * x).sum::<f64>().sqrt();
        println!("eigenvalue {i}: {value:.6e} (vector norm {norm:.3})");
    }
    Ok(())
}
