use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use engine::{EngineConfig, ErrorChannel};
use runtime::filter_bus::SharedFilterBus;
use streaming::backend::SearchBackend;
use streaming::http::HttpBackend;
use streaming::memory::MemoryBackend;
use tools::{ScriptEvent, ToolError, read_json, replay};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Replay map events against the aggregation engine and print the render model.
#[derive(Debug, Parser)]
#[command(name = "geoview", version)]
struct Args {
    /// Engine configuration (JSON).
    #[arg(long)]
    config: PathBuf,
    /// Event script (JSON array).
    #[arg(long)]
    events: PathBuf,
    /// GeoJSON FeatureCollection of points served in memory.
    #[arg(long, conflicts_with = "backend_url")]
    data: Option<PathBuf>,
    /// Base URL of a search service answering POST /aggregate and /search.
    #[arg(long)]
    backend_url: Option<String>,
    /// Zoom the engine starts at.
    #[arg(long, default_value_t = 0.0)]
    zoom: f64,
    /// Print each settled step instead of the final render model.
    #[arg(long)]
    steps: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_path(&args.config)?;
    let events: Vec<ScriptEvent> = read_json(&args.events)?;
    let backend = backend(&args)?;

    let bus = Arc::new(SharedFilterBus::new());
    let (errors, mut error_rx) = ErrorChannel::new();
    let engine = engine::spawn(config, args.zoom, backend, bus.clone(), errors)?;

    info!(events = events.len(), "replaying script");
    let steps = replay(&engine, bus.as_ref(), events).await?;

    let mut failures = 0usize;
    while let Ok(err) = error_rx.try_recv() {
        warn!(error = %err, "engine reported an error");
        failures += 1;
    }
    let metrics = engine.metrics().await?;
    info!(failures, counters = ?metrics.counters, "replay finished");

    let output = if args.steps {
        serde_json::to_string_pretty(&steps)?
    } else {
        serde_json::to_string_pretty(engine.render_model().as_ref())?
    };
    println!("{output}");
    Ok(())
}

fn backend(args: &Args) -> Result<Arc<dyn SearchBackend>, ToolError> {
    if let Some(url) = &args.backend_url {
        info!(%url, "using HTTP backend");
        return Ok(Arc::new(HttpBackend::new(url.clone())));
    }
    let path = args.data.as_ref().ok_or(ToolError::NoBackend)?;
    let data: serde_json::Value = read_json(path)?;
    let memory = MemoryBackend::from_geojson(&data)?;
    info!(records = memory.len(), "using in-memory backend");
    Ok(Arc::new(memory))
}
