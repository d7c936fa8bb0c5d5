use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use vbench_adapters::ScrapedSource;
use vbench_core::StoreId;
use vbench_pipeline::{
    report_recent_markdown, resolve_profiles_path, run_reconcile, RunConfig, StoreRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "vbench")]
#[command(about = "Benchmark a retailer's scraped catalog against the internal catalog")]
struct Cli {
    /// Events are appended here as well as printed.
    #[arg(long, global = true, env = "VBENCH_LOG_FILE", default_value = "logfile.log")]
    log_file: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match one store against the internal catalog and export the result.
    Run(RunArgs),
    /// List configured store profiles.
    Stores {
        #[arg(long, env = "VBENCH_PROFILES")]
        profiles: Option<PathBuf>,
        /// Relative profile paths are taken from here, as `run` does.
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Summarize recent runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long, env = "VBENCH_STORE", default_value = "aurrera")]
    store: StoreId,

    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// YAML store registry replacing the built-in profiles.
    #[arg(long, env = "VBENCH_PROFILES")]
    profiles: Option<PathBuf>,

    /// Keep the match table in memory instead of replacing the remote table.
    #[arg(long)]
    skip_remote_push: bool,
}

/// No subcommand means `run` with its defaults and environment.
fn resolve_command(command: Option<Commands>) -> Result<Commands, clap::Error> {
    match command {
        Some(command) => Ok(command),
        None => RunArgs::try_parse_from(["run"]).map(Commands::Run),
    }
}

fn init_tracing(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = resolve_command(cli.command).unwrap_or_else(|err| err.exit());
    init_tracing(&cli.log_file)?;

    match command {
        Commands::Run(args) => {
            let mut config = RunConfig::from_env(args.store);
            config.workspace_root = args.workspace;
            if args.profiles.is_some() {
                config.profiles_path = args.profiles;
            }
            config.push_remote = !args.skip_remote_push;

            let summary = run_reconcile(config).await?;
            info!(run_id = %summary.run_id, "summary written");
            println!(
                "run complete: run_id={} store={} both={} external_only={} internal_only={} reports={}",
                summary.run_id,
                summary.store,
                summary.counts.both,
                summary.counts.external_only,
                summary.counts.internal_only,
                summary.reports_dir
            );
        }
        Commands::Stores {
            profiles,
            workspace,
        } => {
            let profiles = resolve_profiles_path(&workspace, profiles.as_deref());
            let registry = StoreRegistry::load(profiles.as_deref()).await?;
            for profile in &registry.stores {
                let source = match &profile.source {
                    ScrapedSource::Query { database, .. } => format!("query on `{database}`"),
                    ScrapedSource::Workbook { path, .. } => format!("workbook {}", path.display()),
                };
                println!(
                    "{}\t{}\tprefix={}\tsource={}\tremote={}.{}",
                    profile.store,
                    profile.display_name,
                    profile.column_prefix,
                    source,
                    profile.exports.remote_database,
                    profile.exports.remote_table
                );
            }
        }
        Commands::Report { runs, workspace } => {
            println!("{}", report_recent_markdown(runs, Some(workspace))?);
        }
    }

    Ok(())
}
