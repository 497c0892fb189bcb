// Entry point for the Overseer worker agent process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use overseer_common::config_store::{ConfigurationStore, WorkerSettings};
use overseer_common::constants::return_code;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use overseer_worker::Agent;

#[derive(Parser)]
#[command(name = "overseer-worker", about = "Build worker agent")]
struct Cli {
    /// Path to the worker settings file.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker agent (default).
    Run,
    /// Write a settings file for this worker.
    Init {
        /// Master address:port to connect to.
        #[arg(long)]
        master: String,
        /// Registration token issued by `overseer-master init`.
        #[arg(long)]
        token: String,
        /// Worker name (defaults to the hostname).
        #[arg(long, default_value = "")]
        name: String,
        /// Capability tag; repeat for several.
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        /// Maximum parallel runs.
        #[arg(long, default_value_t = 1)]
        capacity: u32,
        /// Overwrite an existing settings file.
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(run());
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = ConfigurationStore::worker_settings_path(cli.settings.as_deref());

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Init {
            master,
            token,
            name,
            capabilities,
            capacity,
            force,
        } => init(&settings_path, master, token, name, capabilities, capacity, force),
        Command::Run => run_agent(&settings_path).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            return_code::TERMINATED_ERROR
        }
    }
}

fn init(
    settings_path: &std::path::Path,
    master: String,
    token: String,
    name: String,
    capabilities: Vec<String>,
    capacity: u32,
    force: bool,
) -> Result<i32> {
    if settings_path.exists() && !force {
        anyhow::bail!(
            "Settings file {:?} already exists (use --force to overwrite)",
            settings_path
        );
    }

    let settings = WorkerSettings {
        master_address: master,
        worker_name: name,
        token,
        capabilities,
        capacity: capacity.max(1),
        work_directory: PathBuf::from("_work"),
    };
    ConfigurationStore::save(settings_path, &settings)?;

    println!("Settings written to {}", settings_path.display());
    Ok(return_code::SUCCESS)
}

async fn run_agent(settings_path: &std::path::Path) -> Result<i32> {
    let settings = ConfigurationStore::load_worker(settings_path)
        .context("Failed to load worker settings (run `overseer-worker init` first)")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            signal_cancel.cancel();
        }
    });

    let agent = Agent::new(settings);
    agent.run(cancel).await
}
