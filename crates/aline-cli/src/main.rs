mod config;
mod server;

use std::path::{Path, PathBuf};

use aline_core::wire::{PolicyRequest, schemas};
use aline_core::{
    Episode, Evaluator, FeatureSchema, InferenceService, LatentDynamicsPrior, ModelConfig,
    ModelParams, Trainer,
};
use aline_store::{Checkpoint, CorpusStore, Manifest, TrainingSummary};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "aline", about = "Migraine risk inference with an active query policy")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Write a prior-initialized checkpoint
    Init {
        /// Feature channels; 20 uses the migraine channel schema
        #[arg(long, default_value_t = 20)]
        features: usize,
        /// Small architecture for quick experiments
        #[arg(long)]
        tiny: bool,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Replace an existing checkpoint
        #[arg(long)]
        force: bool,
    },

    /// Train on synthetic prior episodes plus the outcome corpus
    Train {
        /// Synthetic episodes (overrides the config)
        #[arg(long)]
        episodes: Option<usize>,
        /// Epochs (overrides the config)
        #[arg(long)]
        epochs: Option<usize>,
        /// Ignore labeled days from the corpus
        #[arg(long)]
        no_corpus: bool,
    },

    /// Print prediction metrics and policy comparison as JSON
    Eval {
        /// Synthetic evaluation episodes
        #[arg(long, default_value_t = 200)]
        episodes: usize,
        /// Hours each policy selects
        #[arg(long, default_value_t = 3)]
        k: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },

    /// Analyse one day from a JSON request file ("-" for stdin)
    Predict {
        request: PathBuf,
    },

    /// Print JSON Schemas of the wire records
    Schema,

    /// Show outcome corpus statistics
    Stats,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(config, host, port).await,
        Commands::Init {
            features,
            tiny,
            seed,
            force,
        } => cmd_init(&config, features, tiny, seed, force),
        Commands::Train {
            episodes,
            epochs,
            no_corpus,
        } => cmd_train(&config, episodes, epochs, no_corpus),
        Commands::Eval { episodes, k, seed } => cmd_eval(&config, episodes, k, seed),
        Commands::Predict { request } => cmd_predict(&config, &request),
        Commands::Schema => cmd_schema(),
        Commands::Stats => cmd_stats(&config),
    }
}

fn load_checkpoint(config: &AppConfig) -> Result<Checkpoint> {
    let dir = config.checkpoint_dir();
    Checkpoint::load(&dir).with_context(|| {
        format!(
            "failed to load checkpoint from {} (run `aline init` first)",
            dir.display()
        )
    })
}

fn open_corpus(config: &AppConfig) -> Result<CorpusStore> {
    let path = config.corpus_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    CorpusStore::open(&path).with_context(|| format!("failed to open corpus {}", path.display()))
}

fn build_service(config: &AppConfig, ckpt: &Checkpoint) -> Result<InferenceService> {
    InferenceService::new(
        &ckpt.params,
        ckpt.manifest.stats.clone(),
        config.inference.clone(),
    )
    .context("failed to build inference service")
}

fn schema_of(ckpt: &Checkpoint) -> FeatureSchema {
    ckpt.manifest
        .schema
        .clone()
        .unwrap_or_else(|| FeatureSchema::for_width(ckpt.manifest.model.n_features))
}

fn synthetic_episodes(
    config: &AppConfig,
    ckpt: &Checkpoint,
    n: usize,
    seed: u64,
) -> Result<Vec<Episode>> {
    let link = ckpt.params.link().context("checkpoint has no usable link")?;
    let prior = LatentDynamicsPrior::new(config.training.prior.clone(), &schema_of(ckpt), link);
    Ok(prior.sample_many(n, &mut SmallRng::seed_from_u64(seed)))
}

async fn cmd_serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let ckpt = load_checkpoint(&config)?;
    let service = build_service(&config, &ckpt)?;
    let corpus = open_corpus(&config)?;
    tracing::info!(
        "loaded model: {} features, {} latent dims, {} parameters",
        ckpt.manifest.model.n_features,
        ckpt.manifest.model.latent_dim,
        ckpt.params.num_params()
    );

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        trigger.cancel();
    });

    server::serve(listener, server::AppState::new(service, corpus), shutdown).await
}

fn cmd_init(config: &AppConfig, features: usize, tiny: bool, seed: u64, force: bool) -> Result<()> {
    let dir = config.checkpoint_dir();
    if Checkpoint::exists(&dir) && !force {
        anyhow::bail!(
            "checkpoint already exists at {} (use --force to replace)",
            dir.display()
        );
    }
    let model = if tiny {
        ModelConfig::tiny(features)
    } else {
        ModelConfig {
            n_features: features,
            ..ModelConfig::default()
        }
    };
    let schema = FeatureSchema::for_width(features);
    let params =
        ModelParams::initialize(model.clone(), &schema, seed).context("failed to initialize model")?;
    let mut manifest = Manifest::new(model);
    manifest.schema = Some(schema);
    let ckpt = Checkpoint::new(manifest, params)?;
    ckpt.save(&dir)
        .with_context(|| format!("failed to write checkpoint {}", dir.display()))?;

    println!("initialized checkpoint at {}", dir.display());
    println!("parameters: {}", ckpt.params.num_params());
    Ok(())
}

fn cmd_train(
    config: &AppConfig,
    episodes: Option<usize>,
    epochs: Option<usize>,
    no_corpus: bool,
) -> Result<()> {
    let ckpt = load_checkpoint(config)?;
    let width = ckpt.manifest.model.n_features;
    let mut train_cfg = config.training.trainer.clone();
    if let Some(epochs) = epochs {
        train_cfg.epochs = epochs;
    }

    let n_synthetic = episodes.unwrap_or(config.training.synthetic_episodes);
    let mut data = synthetic_episodes(config, &ckpt, n_synthetic, train_cfg.seed)?;
    if !no_corpus {
        let corpus = open_corpus(config)?;
        let labeled = corpus
            .episodes(width, ckpt.manifest.stats.as_ref())
            .context("failed to read corpus episodes")?;
        tracing::info!("adding {} labeled days from the corpus", labeled.len());
        data.extend(labeled);
    }
    if data.len() < 2 {
        anyhow::bail!("need at least 2 episodes to train, have {}", data.len());
    }
    data.shuffle(&mut SmallRng::seed_from_u64(train_cfg.seed));

    let n_val = ((data.len() as f64 * config.training.validation_fraction) as usize).min(data.len() - 1);
    let (val, train) = data.split_at(n_val);
    println!("training on {} episodes, validating on {}", train.len(), val.len());

    let trainer = Trainer::new(train_cfg);
    let (best, report) = trainer.fit(&ckpt.params, train, val).context("training failed")?;

    let mut manifest = ckpt.manifest.clone();
    manifest.training = Some(TrainingSummary {
        episodes: data.len(),
        best_epoch: report.best_epoch,
        best_val_loss: report.best_val_loss,
    });
    let dir = config.checkpoint_dir();
    Checkpoint::new(manifest, best)?
        .save(&dir)
        .with_context(|| format!("failed to write checkpoint {}", dir.display()))?;

    for log in &report.epochs {
        println!(
            "epoch {:>3}  loss={:.4}  val={:.4}  auc={:.3}  brier={:.4}  lr={:.2e}",
            log.epoch, log.train.total, log.val_loss, log.auc, log.brier, log.learning_rate
        );
    }
    println!(
        "best epoch {} (val loss {:.4}){}",
        report.best_epoch,
        report.best_val_loss,
        if report.stopped_early { ", stopped early" } else { "" }
    );
    Ok(())
}

fn cmd_eval(config: &AppConfig, episodes: usize, k: usize, seed: u64) -> Result<()> {
    let ckpt = load_checkpoint(config)?;
    let data = synthetic_episodes(config, &ckpt, episodes, seed)?;
    let service = build_service(config, &ckpt)?;
    let report = Evaluator::new(service.model(), config.inference.clone())
        .report(&data, k, seed)
        .context("evaluation failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_predict(config: &AppConfig, request: &Path) -> Result<()> {
    let raw = if request == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?
    } else {
        std::fs::read_to_string(request)
            .with_context(|| format!("failed to read {}", request.display()))?
    };
    let req: PolicyRequest = serde_json::from_str(&raw).context("invalid request JSON")?;
    let ckpt = load_checkpoint(config)?;
    let service = build_service(config, &ckpt)?;
    let resp = service.analyze(&req).context("prediction failed")?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

fn cmd_schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&schemas())?);
    Ok(())
}

fn cmd_stats(config: &AppConfig) -> Result<()> {
    let corpus = open_corpus(config)?;
    let stats = corpus.stats().context("failed to read corpus stats")?;
    println!("corpus:     {}", config.corpus_path().display());
    println!("days:       {}", stats.days);
    println!("users:      {}", stats.users);
    println!("positives:  {}", stats.positives);
    println!("predicted:  {}", stats.with_prediction);
    let checkpoint = config.checkpoint_dir();
    println!(
        "checkpoint: {}",
        if Checkpoint::exists(&checkpoint) {
            checkpoint.display().to_string()
        } else {
            "(none)".to_string()
        }
    );
    Ok(())
}
