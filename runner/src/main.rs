use clap::{Parser, Subcommand};
use simsched::{
    distributed::dispatcher::Dispatcher,
    resources::{self, CoreSampler},
    PoolConfig,
};
use std::{
    io::{self, BufReader},
    path::PathBuf,
    process::exit,
    time::Duration,
};
use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs simulation jobs on local and remote workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// serve executor requests on stdin/stdout, this is what remote workers run
    Dispatch,
    /// print the estimated number of free physical cores
    FreeCores {
        #[arg(long, default_value_t = 500)]
        window_ms: u64,
    },
    /// validate a worker pool file
    CheckPool { path: PathBuf },
}

fn main() {
    // stdout is the dispatcher channel, all logging goes to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dispatch => {
            let stdin = io::stdin().lock();
            let stdout = io::stdout().lock();

            Dispatcher::for_host(CoreSampler::default())
                .serve(BufReader::new(stdin), stdout)
                .unwrap_or_log();
        }
        Commands::FreeCores { window_ms } => {
            println!("{}", resources::free_cores(Duration::from_millis(window_ms)));
        }
        Commands::CheckPool { path } => match PoolConfig::load(&path) {
            Ok(config) => {
                if config.preflight_checks() {
                    exit(1);
                }
                println!("{} worker slot(s) ok", config.workers.len());
            }
            Err(e) => {
                error!("Failed to load {}: {e}", path.display());
                exit(1);
            }
        },
    }
}
