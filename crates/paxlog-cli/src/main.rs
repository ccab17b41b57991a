//! paxlog command line.
//!
//! # Quick Start
//!
//! ```bash
//! # Show the configuration a node would start with
//! paxlog config --config-dir ./node0
//!
//! # Run a node; every stdin line is submitted as a value
//! paxlog run --config-dir ./node0
//!
//! # Inspect the durable log
//! paxlog dump ./node0/.paxlog/data/paxos.log
//! ```

mod commands;
mod style;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// paxlog - replicated log ordering with Multi-Paxos.
#[derive(Parser)]
#[command(name = "paxlog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl-C, submitting each stdin line as a value.
    Run {
        /// Directory holding paxlog.toml and paxlog.local.toml.
        #[arg(short, long)]
        config_dir: Option<PathBuf>,
    },

    /// Print every record of a paxos log.
    Dump {
        /// Path to a paxos.log file.
        path: PathBuf,
    },

    /// Print the effective configuration.
    Config {
        /// Directory holding paxlog.toml and paxlog.local.toml.
        #[arg(short, long)]
        config_dir: Option<PathBuf>,

        /// Output format (toml, json).
        #[arg(short, long, default_value = "toml")]
        format: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    style::set_no_color(cli.no_color);

    if let Err(e) = dispatch(cli.command) {
        style::print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run { config_dir } => commands::run::run(config_dir.as_deref()),
        Commands::Dump { path } => commands::dump::run(&path),
        Commands::Config { config_dir, format } => {
            commands::config::show(config_dir.as_deref(), &format)
        }
    }
}
