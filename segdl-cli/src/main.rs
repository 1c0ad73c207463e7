mod cli;
mod config;
mod error;
mod progress;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use segdl_engine::{DownloadManager, DownloadRequest};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::error::AppError;
use crate::progress::{Finished, ProgressView};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<AppError>()
                .map(AppError::exit_code)
                .unwrap_or(1);
            if !matches!(e.downcast_ref::<AppError>(), Some(AppError::Cancelled)) {
                error!("{:#}", e);
                eprintln!("Error: {e:#}");
            }
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = config::build_settings(&args)?;
    let output_dir = config::output_dir(&args, &settings);
    let engine_config = config::engine_config(&args);

    let id = args
        .id
        .clone()
        .unwrap_or_else(|| format!("segdl-{}", chrono::Utc::now().timestamp_millis()));
    let mut request = DownloadRequest::new(&id, &args.url, &output_dir, &args.name);
    for raw in &args.headers {
        let (name, value) = config::parse_header(raw)?;
        request = request.with_header(name, value);
    }
    let output = request.output_path();

    info!(
        url = %args.url,
        output = %output.display(),
        ffmpeg = %engine_config.ffmpeg_path,
        "Starting segdl"
    );

    let (manager, mut events) = DownloadManager::new(engine_config, Arc::new(settings));
    let view = ProgressView::new(&id, output, args.quiet);
    let pipeline = manager
        .start_download(request)
        .await
        .context("Failed to start download")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                manager.cancel_download(&id);
                let _ = pipeline.await;
                view.cancelled();
                return Err(AppError::Cancelled.into());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(AppError::Failed("event channel closed".to_string()).into());
                };
                match view.handle(&event) {
                    Some(Finished::Completed) => {
                        let _ = pipeline.await;
                        return Ok(());
                    }
                    Some(Finished::Failed(message)) => {
                        let _ = pipeline.await;
                        return Err(AppError::Failed(message).into());
                    }
                    None => {}
                }
            }
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("segdl=debug,segdl_engine=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("segdl=info,segdl_engine=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .init();
}
