mod commands;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nanotest_common::config::Settings;
use nanotest_common::types::TraitFilter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nanotest")]
#[command(about = "nanotest - Discover and run embedded tests across devices", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./nanotest.json when present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Start workers in debug mode, waiting for a debugger to attach
    #[arg(long, global = true, default_value = "false")]
    debug_worker: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Only tests carrying this trait (repeatable)
    #[arg(long = "trait", value_name = "TRAIT")]
    traits: Vec<String>,

    /// Skip tests carrying this trait (repeatable)
    #[arg(long = "exclude-trait", value_name = "TRAIT")]
    exclude_traits: Vec<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> TraitFilter {
        TraitFilter {
            include: self.traits.iter().cloned().collect(),
            exclude: self.exclude_traits.iter().cloned().collect(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the tests found in test assembly manifests
    Discover {
        /// Manifest files
        #[arg(required = true)]
        manifests: Vec<PathBuf>,

        #[command(flatten)]
        filter: FilterArgs,

        /// Print the collection as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Discover and run tests on the configured devices
    Run {
        /// Manifest files
        #[arg(required = true)]
        manifests: Vec<PathBuf>,

        #[command(flatten)]
        filter: FilterArgs,

        /// Run the devices of a class concurrently
        #[arg(long, default_value = "false")]
        parallel: bool,

        /// Print one JSON outcome per line
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Show the configured devices
    Devices {
        /// Print the devices as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_or_default(cli.settings.as_deref()).context("Failed to load settings")?;

    // stdout is reserved for results
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let ok = match cli.command {
        Commands::Discover { manifests, filter, json } => {
            commands::discover_tests(&settings, cli.debug_worker, &manifests, filter.to_filter(), json).await?
        }
        Commands::Run {
            manifests,
            filter,
            parallel,
            json,
        } => {
            commands::run_tests(
                &settings,
                cli.debug_worker,
                &manifests,
                filter.to_filter(),
                parallel || settings.parallel_devices,
                json,
            )
            .await?
        }
        Commands::Devices { json } => {
            commands::list_devices(&settings, json)?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
