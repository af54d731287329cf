use clap::{Parser, Subcommand};

mod commands;
mod paper_market;

use commands::{ExplainArgs, GreeksArgs, RunArgs, SizeArgs};

#[derive(Parser)]
#[command(name = "options-guard")]
#[command(about = "Options position health monitoring, repair planning and execution", long_about = None)]
struct Cli {
    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine in paper mode with the web API
    Run(RunArgs),
    /// Price one contract and print its Greeks
    Greeks(GreeksArgs),
    /// Size a trade with fractional Kelly
    Size(SizeArgs),
    /// Recommend, size and explain an entry without submitting it
    Explain(ExplainArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match cli.command {
        Commands::Run(args) => {
            commands::run_service(args).await?;
        }
        Commands::Greeks(args) => {
            commands::run_greeks(args)?;
        }
        Commands::Size(args) => {
            commands::run_size(args)?;
        }
        Commands::Explain(args) => {
            commands::run_explain(args).await?;
        }
    }

    Ok(())
}
