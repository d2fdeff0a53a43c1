//! Thin command-line front-end for the Eurostat mirror pipeline.
//!
//! Owns exactly the external collaborator boundary from spec.md §6:
//! argument parsing, environment-driven configuration, logging
//! initialization, and the `update-all` batch loop. Everything else is
//! delegated to `eurostat-orchestrator`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use eurostat_core::model::{LoadStrategy, Representation};
use eurostat_core::PipelineConfig;
use eurostat_fetch::Fetcher;
use eurostat_load::postgres::PostgresLoader;
use eurostat_orchestrator::{Orchestrator, RunOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "eurostat-cli")]
#[command(about = "Mirrors Eurostat statistical datasets into a relational database")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a config file layered under environment variables
    /// prefixed `EUROSTAT_` (e.g. `EUROSTAT_DB__HOST`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single dataset.
    Run {
        #[arg(long)]
        dataset_id: String,

        #[arg(long, value_enum, default_value_t = RepresentationArg::Standard)]
        representation: RepresentationArg,

        #[arg(long, value_enum, default_value_t = LoadStrategyArg::Full)]
        load_strategy: LoadStrategyArg,
    },
    /// Run every dataset id in `--dataset-ids-file`, one per line;
    /// continues past a single dataset's failure (spec.md §7).
    UpdateAll {
        #[arg(long)]
        dataset_ids_file: PathBuf,

        #[arg(long, value_enum, default_value_t = RepresentationArg::Standard)]
        representation: RepresentationArg,

        #[arg(long, value_enum, default_value_t = LoadStrategyArg::Delta)]
        load_strategy: LoadStrategyArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RepresentationArg {
    Standard,
    Full,
}

impl From<RepresentationArg> for Representation {
    fn from(r: RepresentationArg) -> Self {
        match r {
            RepresentationArg::Standard => Representation::Standard,
            RepresentationArg::Full => Representation::Full,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LoadStrategyArg {
    Full,
    Delta,
}

impl From<LoadStrategyArg> for LoadStrategy {
    fn from(s: LoadStrategyArg) -> Self {
        match s {
            LoadStrategyArg::Full => LoadStrategy::Full,
            LoadStrategyArg::Delta => LoadStrategy::Delta,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "eurostat-cli failed");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Run {
            dataset_id,
            representation,
            load_strategy,
        } => {
            let mut orchestrator = build_orchestrator(&config).await?;
            let ok = run_one(&mut orchestrator, &dataset_id, representation.into(), load_strategy.into()).await;
            orchestrator.loader_mut().close_connection().await?;
            Ok(ok)
        }
        Command::UpdateAll {
            dataset_ids_file,
            representation,
            load_strategy,
        } => {
            let ids = std::fs::read_to_string(&dataset_ids_file)?;
            let ids: Vec<&str> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

            let mut orchestrator = build_orchestrator(&config).await?;
            let mut all_ok = true;
            for dataset_id in ids {
                let ok = run_one(&mut orchestrator, dataset_id, representation.into(), load_strategy.into()).await;
                all_ok &= ok;
            }
            orchestrator.loader_mut().close_connection().await?;
            Ok(all_ok)
        }
    }
}

async fn run_one(
    orchestrator: &mut Orchestrator<PostgresLoader>,
    dataset_id: &str,
    representation: Representation,
    load_strategy: LoadStrategy,
) -> bool {
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    match orchestrator
        .run_dataset(dataset_id, representation, load_strategy, cancel)
        .await
    {
        Ok(RunOutcome::Loaded { rows_loaded }) => {
            info!(dataset_id, rows_loaded, "dataset load complete");
            true
        }
        Ok(RunOutcome::SkippedUpToDate) => {
            info!(dataset_id, "dataset already up to date, skipped");
            true
        }
        Err(e) => {
            error!(dataset_id, error = %e, "dataset load failed");
            false
        }
    }
}

async fn build_orchestrator(config: &PipelineConfig) -> anyhow::Result<Orchestrator<PostgresLoader>> {
    let fetcher = Fetcher::new(&config.base_url, &config.cache_root, config.cache_enabled)?;
    let conn_str = format!(
        "host={} port={} user={} password={} dbname={}",
        config.db.host, config.db.port, config.db.user, config.db.password, config.db.dbname
    );
    let loader = PostgresLoader::connect(&conn_str).await?;
    Ok(Orchestrator::new(fetcher, loader, config.clone()))
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<PipelineConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("EUROSTAT")
            .separator("__")
            .try_parsing(true),
    );
    let settings = builder.build()?;
    Ok(settings.try_deserialize()?)
}
