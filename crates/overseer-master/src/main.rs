// Entry point for the Overseer master process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use overseer_common::config_store::{ConfigurationStore, MasterSettings};
use overseer_common::constants::return_code;
use overseer_common::credential;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use overseer_master::Master;

#[derive(Parser)]
#[command(name = "overseer-master", about = "Build coordination master")]
struct Cli {
    /// Path to the master settings file.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the master (default).
    Run,
    /// Write a fresh settings file with a generated registration token.
    Init {
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
    let settings_path = ConfigurationStore::master_settings_path(cli.settings.as_deref());

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Init { force } => init(&settings_path, force),
        Command::Run => run_master(&settings_path).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            return_code::TERMINATED_ERROR
        }
    }
}

/// Generate a registration token and write a default settings file. The raw
/// token is printed once; only its digest is stored.
fn init(settings_path: &std::path::Path, force: bool) -> Result<i32> {
    if settings_path.exists() && !force {
        anyhow::bail!(
            "Settings file {:?} already exists (use --force to overwrite)",
            settings_path
        );
    }

    let token = credential::generate_token();
    let settings = MasterSettings {
        worker_bind: format!(
            "127.0.0.1:{}",
            overseer_common::constants::DEFAULT_WORKER_PORT
        ),
        trigger_bind: format!(
            "127.0.0.1:{}",
            overseer_common::constants::DEFAULT_TRIGGER_PORT
        ),
        token_digest: credential::token_digest(&token),
        heartbeat_timeout_secs: overseer_common::constants::DEFAULT_HEARTBEAT_TIMEOUT.as_secs(),
        retry_limit: overseer_common::constants::DEFAULT_RETRY_LIMIT,
        abort_grace_secs: overseer_common::constants::DEFAULT_ABORT_GRACE.as_secs(),
        store_directory: PathBuf::from("_store"),
    };
    ConfigurationStore::save(settings_path, &settings)?;

    println!("Settings written to {}", settings_path.display());
    println!("Worker registration token (store it now, it is not kept):");
    println!("{}", token);
    Ok(return_code::SUCCESS)
}

async fn run_master(settings_path: &std::path::Path) -> Result<i32> {
    let settings = ConfigurationStore::load_master(settings_path)
        .context("Failed to load master settings (run `overseer-master init` first)")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            signal_cancel.cancel();
        }
    });

    let master = Master::new(settings);
    master.run(cancel).await
}
