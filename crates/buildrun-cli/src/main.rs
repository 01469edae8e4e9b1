//! buildrun command line.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildrun")]
#[command(about = "Kubernetes build lifecycle controller", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "BUILDRUN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build controller against the current cluster
    Controller {
        /// Path to the configuration file
        #[arg(long, env = "BUILDRUN_CONFIG", default_value = "buildrun.kdl")]
        config: PathBuf,
        /// Number of concurrent workers, overriding the config file
        #[arg(long)]
        workers: Option<usize>,
        /// Only watch this namespace, overriding the config file
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "buildrun.kdl")]
        path: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Controller {
            config,
            workers,
            namespace,
        } => {
            commands::controller::run(&config, workers, namespace).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
