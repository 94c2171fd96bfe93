//! Scenecast CLI entry point.

use anyhow::Result;
use clap::Parser;
use scenecast::cli::{commands, Cli, Commands, Output};
use scenecast::config::Settings;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let settings = match &cli.config {
        Some(path) => Settings::load_from(Some(&std::path::PathBuf::from(path)))?,
        None => Settings::load()?,
    };

    // Initialize logging
    let log_level = match cli.verbose {
        0 => settings.general.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("scenecast={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Ensure data directories exist
    std::fs::create_dir_all(settings.data_dir())?;

    // Ctrl-C stops at the next checkpoint
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            Output::warning("Interrupted; stopping after in-flight work...");
            trigger.cancel();
        }
    });

    // Execute command
    match &cli.command {
        Commands::Start { run_id, captions } => {
            commands::run_start(run_id, captions, settings, &cancel).await?;
        }

        Commands::Resume { run_id } => {
            commands::run_resume(run_id, settings, &cancel).await?;
        }

        Commands::Status { run_id } => {
            commands::run_status(run_id.as_deref(), settings).await?;
        }

        Commands::Generate {
            run_id,
            video,
            reference_images,
            workers,
        } => {
            commands::run_generate(run_id, *video, *reference_images, *workers, settings, &cancel).await?;
        }

        Commands::Export { run_id, output } => {
            commands::run_export(run_id, output.clone(), settings).await?;
        }

        Commands::Show { run_id, json } => {
            commands::run_show(run_id, *json, settings).await?;
        }

        Commands::Config { action } => {
            commands::run_config(action, settings)?;
        }
    }

    Ok(())
}
