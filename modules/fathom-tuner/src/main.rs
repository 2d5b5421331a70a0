use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fathom_common::{CoefficientVector, Config};
use fathom_tuner::{
    AnnealingConfig, BrowserlessEnvironment, MemoryStore, Trainer, TrainingOptions,
};

/// Tune a ruleset's coefficients against its labeled training pages.
#[derive(Parser, Debug)]
#[command(name = "fathom-train")]
struct Args {
    /// JSON store holding rulesets, facts, pages and training runs.
    #[arg(long)]
    store: PathBuf,

    /// Training run to execute.
    #[arg(long)]
    run: Uuid,

    /// Starting coefficients, e.g. "1,2,3". Defaults to the ruleset's own.
    #[arg(long)]
    initial: Option<CoefficientVector>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    initial_temperature: Option<f64>,

    #[arg(long)]
    cooling_steps: Option<u32>,

    #[arg(long)]
    cooling_fraction: Option<f64>,

    #[arg(long)]
    steps_per_temp: Option<u32>,

    /// Per-call execution timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

/// Info for every workspace crate: `fathom_common`, `fathom_tuner`, this
/// binary (`fathom_train`) and `browserless_client`.
fn log_filter(base: EnvFilter) -> Result<EnvFilter> {
    Ok(base
        .add_directive("fathom=info".parse()?)
        .add_directive("browserless_client=info".parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(EnvFilter::from_default_env())?)
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    config.log_redacted();

    let mut annealing = AnnealingConfig {
        seed: args.seed.or(config.seed),
        ..AnnealingConfig::default()
    };
    if let Some(t) = args.initial_temperature {
        annealing.initial_temperature = t;
    }
    if let Some(n) = args.cooling_steps {
        annealing.cooling_steps = n;
    }
    if let Some(f) = args.cooling_fraction {
        annealing.cooling_fraction = f;
    }
    if let Some(n) = args.steps_per_temp {
        annealing.steps_per_temp = n;
    }
    if args.timeout_secs == Some(0) {
        anyhow::bail!("--timeout-secs must be positive");
    }
    let options = TrainingOptions {
        annealing,
        execution_timeout: args
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(config.execution_timeout),
    };

    let store = MemoryStore::load(&args.store)
        .with_context(|| format!("Failed to load store from {}", args.store.display()))?;
    let trainer = Trainer::new(store, options);

    let cancel = trainer.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling training run");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let env = BrowserlessEnvironment::from_config(&config);
    let report = trainer.train(args.run, env, args.initial).await?;

    trainer
        .store()
        .save(&args.store)
        .with_context(|| format!("Failed to write store to {}", args.store.display()))?;
    info!(path = %args.store.display(), "Store updated");

    println!("\n=== Training run {} ===", report.run_id);
    println!("Coefficients:  {}", report.coefficients);
    println!("Training cost: {:.4}", report.training_cost);
    if let Some(testing_cost) = report.testing_cost {
        println!("Testing cost:  {testing_cost:.4}");
    }
    println!(
        "Transitions: {}  |  Cache hits: {}  |  Evaluations: {}",
        report.stats.transitions, report.stats.cache_hits, report.stats.cache_misses
    );

    Ok(())
}
