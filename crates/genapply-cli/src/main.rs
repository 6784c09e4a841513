use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::apply::run_apply;
use commands::extract::run_extract;
use commands::serve::run_serve;

#[derive(Parser)]
#[command(name = "genapply")]
#[command(about = "Generate project files with an LLM and apply them safely", long_about = None)]
struct Cli {
    /// Emit diagnostic logs as JSON.
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve(ServeArgs),
    /// Apply an apply-request JSON file or raw generated text.
    Apply(ApplyArgs),
    /// Print the files, explanation and packages found in generated text.
    Extract(ExtractArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Listen address, overriding `server.bind`.
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[derive(Args)]
struct ApplyArgs {
    /// Input file, or `-` for stdin.
    file: PathBuf,
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[derive(Args)]
struct ExtractArgs {
    /// Input file, or `-` for stdin.
    file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    match cli.command {
        Commands::Serve(args) => run_serve(args),
        Commands::Apply(args) => run_apply(args),
        Commands::Extract(args) => run_extract(args),
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("GENAPPLY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
