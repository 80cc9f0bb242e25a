mod cli;
mod commands;
mod output;

use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use tor_fleet::config::Settings;
use tor_fleet::registry::ClientRegistry;
use tor_fleet::Error as FleetError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(fleet_error) = e.downcast_ref::<FleetError>() {
            eprintln!("Error: {}", fleet_error.with_suggestion());
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    let mut settings = Settings::load(cli.settings.as_deref())?;
    if let Some(dir) = cli.config_dir.clone() {
        settings.config_dir = dir;
    }
    if let Some(dir) = cli.cache_dir.clone() {
        settings.cache_dir = dir;
    }
    tracing::debug!("Using settings: {:?}", settings);

    let registry = ClientRegistry::builder().settings(&settings).build().await?;

    let token = registry.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling in-flight launches");
            token.cancel();
        }
    });

    let out = output::CliOutput;
    let result = match cli.command {
        Commands::List { json } => commands::run_list(&registry, json, &out).await,
        Commands::Running { json } => commands::run_running(&registry, json, &out).await,
        Commands::Start { target } => commands::run_start(&registry, target.selector(), &out).await,
        Commands::Stop { target } => commands::run_stop(&registry, target.selector(), &out).await,
        Commands::StartAll => commands::run_start_all(&registry, &out).await,
        Commands::StopAll => commands::run_stop_all(&registry, &out).await,
        Commands::Rotate { target } => {
            commands::run_rotate(&registry, target.selector(), &out).await
        }
        Commands::Ip { target, refresh } => {
            commands::run_ip(&registry, target.selector(), refresh, &out).await
        }
        Commands::Create {
            port,
            labels,
            data_dir,
        } => commands::run_create(&registry, port, labels, data_dir, &out).await,
        Commands::Delete { target } => {
            commands::run_delete(&registry, target.selector(), &out).await
        }
        Commands::Completions { .. } => Ok(()),
    };

    // Runtime state is handed to the next run even when the command failed
    if let Err(e) = registry.flush_all().await {
        tracing::warn!("Failed to save runtime state: {}", e);
    }
    result
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;
    Ok(())
}
