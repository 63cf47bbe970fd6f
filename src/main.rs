use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use vrchat_upload_engine::commands::{self, AppState, ImageMetadata, UploadProgress, UploadRequest};
use vrchat_upload_engine::config::{self, CompressionFormat, Config};
use vrchat_upload_engine::destinations::InMemoryDestinationStore;
use vrchat_upload_engine::security::InputValidator;
use vrchat_upload_engine::uploader::events::UploadPhase;

#[derive(Parser, Debug)]
#[command(author, version, about = "Upload VRChat photos to Discord webhooks", long_about = None)]
struct Cli {
    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Group, compress and upload photos
    Upload {
        #[arg(required = true)]
        files: Vec<String>,
        #[arg(long)]
        webhook_url: String,
        /// The webhook posts into a forum channel; each group gets a thread
        #[arg(long)]
        forum: bool,
        #[arg(long, default_value = "Webhook")]
        name: String,
        #[arg(long)]
        no_group_by_world: bool,
        #[arg(long)]
        no_group_by_time: bool,
        #[arg(long)]
        window_minutes: Option<u32>,
        #[arg(long)]
        max_per_message: Option<u8>,
        #[arg(long, value_parser = parse_format)]
        format: Option<CompressionFormat>,
        #[arg(long)]
        no_player_names: bool,
    },
    /// Print dimensions and size without decoding the images
    Info {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Print embedded VRChat metadata, or write it from a JSON file
    Metadata {
        file: String,
        #[arg(long)]
        write: Option<String>,
    },
    /// Show or reset the configuration file
    Config {
        #[arg(long)]
        reset: bool,
    },
}

fn parse_format(value: &str) -> Result<CompressionFormat, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|_| format!("unknown format '{}', expected jpeg or webp", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let app_config = config::load_config().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration, using defaults: {}", e);
        Config::default()
    });

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        app_config.log_level_filter()
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    log::info!("Starting VRChat Upload Engine v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Upload {
            files,
            webhook_url,
            forum,
            name,
            no_group_by_world,
            no_group_by_time,
            window_minutes,
            max_per_message,
            format,
            no_player_names,
        } => {
            let mut grouping = app_config.grouping_config();
            grouping.group_by_world &= !no_group_by_world;
            grouping.group_by_time &= !no_group_by_time;
            if let Some(minutes) = window_minutes {
                grouping.time_window_secs = u64::from(minutes) * 60;
            }

            let mut delivery = app_config.delivery_config();
            if let Some(max) = max_per_message {
                delivery.max_items_per_message = max;
            }
            if let Some(format) = format {
                delivery.compression.format = format;
            }
            delivery.include_player_names &= !no_player_names;

            if InputValidator::validate_webhook_url(&webhook_url).is_err() {
                log::warn!("Webhook URL does not match the Discord webhook format, sending anyway");
            }

            let store = InMemoryDestinationStore::new();
            let destination_id = store.insert(&name, &webhook_url, forum)?;
            let state = AppState::new(Arc::new(store));

            let request = UploadRequest {
                destination_id,
                file_paths: files,
                grouping,
                delivery,
            };
            run_upload(&state, request).await
        }
        Command::Info { files } => {
            for (path, info) in commands::get_image_info_batch(files).await? {
                match info {
                    Some((width, height, size)) => {
                        println!("{}: {}x{}, {} bytes", path, width, height, size)
                    }
                    None => println!("{}: unreadable", path),
                }
            }
            Ok(())
        }
        Command::Metadata { file, write } => {
            match write {
                Some(json_path) => {
                    let json = std::fs::read_to_string(&json_path)
                        .with_context(|| format!("reading {}", json_path))?;
                    let metadata: ImageMetadata =
                        serde_json::from_str(&json).context("parsing metadata JSON")?;
                    let output = commands::update_image_metadata(&file, metadata).await?;
                    println!("Wrote {}", output);
                }
                None => match commands::get_image_metadata(&file).await? {
                    Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
                    None => println!("{}: no VRChat metadata", file),
                },
            }
            Ok(())
        }
        Command::Config { reset } => {
            if reset {
                config::reset_config()?;
                println!("Configuration reset to defaults");
            }
            let current = config::load_config()?;
            println!("{}", serde_json::to_string_pretty(&current)?);
            Ok(())
        }
    }
}

async fn run_upload(state: &AppState, request: UploadRequest) -> Result<()> {
    let mut events = state.subscribe();
    let session_id = commands::start_upload(state, request).await?;
    println!("Session {}", session_id);

    let mut interval = tokio::time::interval(Duration::from_millis(500));
    let mut cancel_requested = false;

    let progress = loop {
        tokio::select! {
            _ = interval.tick() => {
                let progress = commands::get_upload_progress(state, &session_id).await?;
                if progress.is_terminal() {
                    break progress;
                }
                print_progress(&progress);
            }
            event = events.recv() => match event {
                Ok(event) if event.session_id == session_id => log_event(&event.phase),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => log::debug!("Skipped {} progress events", skipped),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                println!("Cancelling after the current chunk...");
                cancel_requested = true;
                if let Err(e) = commands::cancel_upload_session(state, &session_id).await {
                    log::warn!("Cancel failed: {}", e);
                }
            }
        }
    };

    println!(
        "\nSession {}: {} uploaded, {} failed of {}",
        progress.session_status,
        progress.successful_uploads.len(),
        progress.failed_uploads.len(),
        progress.total_images
    );
    for failed in &progress.failed_uploads {
        println!(
            "  {} ({}{}): {}",
            failed.file_path,
            if failed.is_retryable { "retryable" } else { "permanent" },
            if failed.group_failure { ", group" } else { "" },
            failed.error
        );
    }

    if progress.failed_uploads.is_empty() {
        Ok(())
    } else {
        bail!("{} upload(s) failed", progress.failed_uploads.len())
    }
}

fn print_progress(progress: &UploadProgress) {
    let eta = progress
        .estimated_time_remaining
        .map(|secs| format!(", ~{}s left", secs))
        .unwrap_or_default();
    println!(
        "[{}] {}/{}{}",
        progress.session_status, progress.completed, progress.total_images, eta
    );
}

fn log_event(phase: &UploadPhase) {
    match phase {
        UploadPhase::Grouped { group_count } => log::info!("Grouped into {} group(s)", group_count),
        UploadPhase::GroupStart {
            group_index,
            total_groups,
        } => log::info!("Group {}/{}", group_index + 1, total_groups),
        UploadPhase::ItemError { file_path, message } => {
            log::warn!("{} failed: {}", file_path, message)
        }
        other => log::debug!("{:?}", other),
    }
}
