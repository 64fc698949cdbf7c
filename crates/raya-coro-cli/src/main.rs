//! Raya coroutine runtime driver
//!
//! Runs synthetic workloads on the scheduler and manages `raya-coro.toml`
//! configuration files.

mod commands;

use clap::{Parser, Subcommand};
use commands::run::RunArgs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the log filter
const LOG_ENV: &str = "RAYA_CORO_LOG";

#[derive(Parser)]
#[command(name = "raya-coro")]
#[command(about = "Raya coroutine runtime driver", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload and print scheduler statistics
    Run {
        /// Scheduler config file (raya-coro.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the worker count (0 = number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Number of coroutines to launch
        #[arg(short = 'n', long, default_value = "1000")]
        coroutines: usize,
        /// Yields per coroutine
        #[arg(short, long, default_value = "10")]
        yields: usize,
        /// Context backend: "fiber" or "thread"
        #[arg(long)]
        context: Option<String>,
        /// Debug logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the default configuration as TOML
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Config file to check
        file: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(env_filter)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workers,
            coroutines,
            yields,
            context,
            verbose,
        } => {
            init_tracing(verbose);
            commands::run::execute(RunArgs {
                config,
                workers,
                coroutines,
                yields,
                context,
            })
        }
        Commands::Config { output } => commands::config::print_default(output.as_deref()),
        Commands::CheckConfig { file } => {
            init_tracing(false);
            commands::config::check(&file)
        }
    }
}
