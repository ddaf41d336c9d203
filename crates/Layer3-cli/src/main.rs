//! Taskbox CLI - Main entry point

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taskbox_foundation::BackendKind;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Taskbox - run a task inside an isolated container
#[derive(Parser, Debug)]
#[command(name = "taskbox")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the task described by a JSON spec file
    Run {
        /// Path to the TaskContainerSpec JSON file
        spec: PathBuf,

        /// Backend to use (local, docker-cli, docker-api)
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Image to use when the spec names none
        #[arg(long)]
        image: Option<String>,

        /// Kill the task after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show the resources one container may receive
    Detect {
        /// Backend to query (local, docker-cli, docker-api)
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let code = match args.command {
        Command::Run {
            spec,
            backend,
            image,
            timeout,
        } => {
            commands::run_task(commands::RunOptions {
                spec_path: spec,
                backend,
                image,
                timeout,
            })
            .await?
        }
        Command::Detect { backend } => commands::detect(backend).await?,
    };

    std::process::exit(code);
}
