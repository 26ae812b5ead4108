mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sentinel-cli")]
#[command(about = "Sentinel CLI - Run code locally, submit to workers, maintain scratch and cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Resource limits; omitted values take the intake defaults
#[derive(Args, Debug, Clone, Default)]
pub struct LimitArgs {
    /// CPU time budget in seconds
    #[arg(long)]
    cpu: Option<u64>,

    /// Maximum number of live processes
    #[arg(long)]
    procs: Option<u32>,

    /// Memory ceiling in MB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Wall-clock timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Captured bytes per output stream
    #[arg(long)]
    max_output: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file through the local engine
    Run {
        /// Language (cpp, java, python, rust)
        #[arg(short, long)]
        language: String,

        /// Source file to execute
        #[arg(short, long)]
        file: PathBuf,

        /// File whose contents are fed to stdin
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        /// Bypass the artifact cache
        #[arg(long, default_value = "false")]
        no_cache: bool,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Queue a source file for the workers and wait for the outcome
    Submit {
        /// Language (cpp, java, python, rust)
        #[arg(short, long)]
        language: String,

        /// Source file to submit
        #[arg(short, long)]
        file: PathBuf,

        /// File whose contents are fed to stdin
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        /// Tenant the submission is accounted to
        #[arg(short, long, default_value = "anonymous")]
        tenant: String,

        /// Seconds to wait for the outcome
        #[arg(short, long, default_value = "60")]
        wait: u64,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Remove orphaned workspaces and abandoned cache temp directories
    Sweep {
        /// Override the maximum workspace age in seconds
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Probe and list configured toolchains
    Toolchains,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            language,
            file,
            stdin,
            no_cache,
            limits,
        } => {
            commands::run_local(&language, &file, stdin.as_deref(), no_cache, &limits).await?;
        }
        Commands::Submit {
            language,
            file,
            stdin,
            tenant,
            wait,
            limits,
        } => {
            commands::submit(&language, &file, stdin.as_deref(), &tenant, wait, &limits).await?;
        }
        Commands::Sweep { max_age_secs } => {
            commands::sweep(max_age_secs).await?;
        }
        Commands::Toolchains => {
            commands::list_toolchains().await?;
        }
    }

    Ok(())
}
