use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use survey_pipeline::pipeline::{run_pipeline, PipelineContext, Progress};
use survey_pipeline::records::RunIds;
use survey_pipeline::PipelineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs the road-survey annotation pipeline against one video.
#[derive(Parser, Debug)]
#[command(name = "survey_run")]
struct Args {
    /// Input survey video.
    video: PathBuf,

    /// GPS track file (JSON). Omit to pin the run to the default coordinate.
    #[arg(long)]
    gps: Option<PathBuf>,

    /// Pipeline config file (TOML/JSON). Omit for defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "adhoc-video")]
    video_id: String,

    #[arg(long, default_value = "adhoc-route")]
    route_id: String,

    #[arg(long, default_value = "adhoc-survey")]
    survey_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    let ctx = PipelineContext::initialize(
        config,
        RunIds {
            video_id: args.video_id,
            route_id: args.route_id,
            survey_id: args.survey_id,
        },
    )
    .await?;

    let mut progress = Progress::new(|percent, message| {
        info!("{percent:5.1}% {message}");
    });
    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let run = run_pipeline(
        &ctx,
        &args.video,
        args.gps.as_deref(),
        &mut progress,
        cancel_rx,
    )
    .await?;

    info!(
        "processed {}/{} frames, {} assets ({} good, {} damaged)",
        run.processed_frames,
        run.total_frames,
        run.asset_summary.total(),
        run.asset_summary.good,
        run.asset_summary.damaged
    );
    for warning in &run.warnings {
        info!("warning: {warning}");
    }
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}
