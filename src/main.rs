use std::io::Write;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use vigil::analytics::{
    spawn_pipeline, Blob, ClassificationTally, Detection, EffectMode, FrameProcessingPipeline, PipelineHandle,
    ResultBundle,
};
use vigil::config::{Config, ConfigError};

const BUNDLE_CAPACITY: usize = 2;
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// One line of headless renderer output.
#[derive(Serialize)]
struct BundleLine<'a> {
    sequence: u64,
    width: i32,
    height: i32,
    blobs: Option<&'a [Blob]>,
    detections: Option<&'a [Detection]>,
    tally: Option<ClassificationTally>,
}

impl<'a> From<&'a ResultBundle> for BundleLine<'a> {
    fn from(bundle: &'a ResultBundle) -> Self {
        Self {
            sequence: bundle.sequence,
            width: bundle.raw_frame.width(),
            height: bundle.raw_frame.height(),
            blobs: bundle.blobs.as_deref(),
            detections: bundle.detections.as_deref(),
            tally: bundle.tally,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigil=debug".parse()?))
        .init();

    let config = load_config()?;
    let pipeline = FrameProcessingPipeline::from_config(&config)?;
    let (handle, bundles, task) = spawn_pipeline(
        pipeline,
        Duration::from_millis(config.runner.tick_ms),
        BUNDLE_CAPACITY,
    );

    if let Some(source) = &config.source {
        // an unreachable source is not fatal; the pipeline just stays off
        if let Err(e) = handle.set_source(source.kind, source.locator.as_str()).await {
            tracing::error!(kind = %source.kind, source = %source.locator, error = %e, "failed to open source");
        }
    } else {
        tracing::warn!("no [source] configured, nothing to process");
    }

    if config.runner.background {
        handle.toggle_background().await?;
    }
    if config.runner.detection {
        if let Err(e) = handle.toggle_detection().await {
            tracing::warn!(error = %e, "detection effect not enabled");
        }
    }

    let render_handle = tokio::spawn(render(bundles));
    let status_handle = tokio::spawn(report_status(handle.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    handle.stop().await?;
    if let Ok(status) = handle.status().await {
        tracing::info!(frames = status.frames_processed, "final pipeline stats");
    }

    status_handle.abort();
    drop(handle);
    if let Err(e) = task.await {
        tracing::error!("pipeline task failed: {}", e);
    }
    render_handle.abort();
    tracing::info!("shutdown complete");

    Ok(())
}

fn load_config() -> Result<Config, ConfigError> {
    if let Some(path) = std::env::args().nth(1) {
        let config = Config::load_from(&path)?;
        tracing::info!(path = %path, "loaded config");
        return Ok(config);
    }

    match Config::load() {
        Ok(config) => {
            tracing::info!("loaded config from vigil.toml");
            Ok(config)
        }
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no vigil.toml found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e),
    }
}

async fn render(mut bundles: mpsc::Receiver<ResultBundle>) {
    let stdout = std::io::stdout();
    while let Some(bundle) = bundles.recv().await {
        let line = BundleLine::from(&bundle);
        tracing::debug!(
            sequence = bundle.sequence,
            blobs = bundle.blobs.as_ref().map_or(0, Vec::len),
            adults = line.tally.map_or(0, |t| t.adults),
            children = line.tally.map_or(0, |t| t.children),
            animals = line.tally.map_or(0, |t| t.animals),
            "frame processed"
        );

        match serde_json::to_string(&line) {
            Ok(json) => {
                if let Err(e) = writeln!(stdout.lock(), "{json}") {
                    tracing::error!(error = %e, "stdout closed, renderer exiting");
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize bundle"),
        }
    }
}

async fn report_status(handle: PipelineHandle) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    loop {
        interval.tick().await;
        let Ok(status) = handle.status().await else {
            break;
        };
        let mode = match status.effects.mode() {
            EffectMode::Off => "off",
            EffectMode::BackgroundOnly => "background",
            EffectMode::DetectionOnly => "detection",
            EffectMode::Both => "background+detection",
        };
        tracing::info!(
            mode,
            source = ?status.source,
            frames = status.frames_processed,
            blobs = status.blobs.len(),
            adults = status.tally.adults,
            children = status.tally.children,
            animals = status.tally.animals,
            "pipeline stats"
        );
    }
}
