use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use channel_resolver::{
    config::EngineConfig,
    health::{HealthChecker, HealthCycleReport, HttpStreamProbe},
    matching::AverageHashLogoProvider,
    models::{ChannelView, RawChannelEntry},
    quality::FfprobeQualityProbe,
    registry::ChannelRegistry,
    sync::{SyncEngine, SyncReport, parse_m3u},
};

#[derive(Parser)]
#[command(name = "channel-resolver")]
#[command(version)]
#[command(about = "Merge IPTV provider listings into channels and rank their streams")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve provider entries into channels and print the ranked result
    Resolve {
        /// JSON array of entries, or an M3U playlist (.m3u/.m3u8)
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Provider id for playlist inputs (defaults to the file stem)
        #[arg(long)]
        provider: Option<String>,

        /// Provider priority for playlist inputs
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Run a liveness cycle after syncing
        #[arg(long)]
        probe: bool,

        /// Leave dead streams out of the output
        #[arg(long)]
        active_only: bool,
    },
}

#[derive(Serialize)]
struct ResolveOutput {
    syncs: Vec<SyncReport>,
    health: Option<HealthCycleReport>,
    channels: Vec<ChannelView>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("channel_resolver={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(
            cli.log_json
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!cli.log_json)
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();

    info!("Starting channel-resolver v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load_from_file(&cli.config)?;

    match cli.command {
        Command::Resolve {
            input,
            provider,
            priority,
            probe,
            active_only,
        } => {
            let mut batches: BTreeMap<String, Vec<RawChannelEntry>> = BTreeMap::new();
            for path in &input {
                for entry in read_entries(path, provider.as_deref(), priority).await? {
                    batches.entry(entry.provider_id.clone()).or_default().push(entry);
                }
            }

            let output = resolve(config, batches, probe, active_only).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn resolve(
    config: EngineConfig,
    batches: BTreeMap<String, Vec<RawChannelEntry>>,
    probe: bool,
    active_only: bool,
) -> Result<ResolveOutput> {
    let mut registry = ChannelRegistry::new(&config)?;
    if config.enable_logo_matching {
        let logos = AverageHashLogoProvider::new(config.logo_fetch_timeout, config.logo_cache_size)?;
        registry = registry.with_logo_similarity(Arc::new(logos));
    }
    let registry = Arc::new(registry);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            ctrl_c.cancel();
        }
    });

    let mut engine = SyncEngine::new(registry.clone(), config.clone());
    if config.enable_bitrate_analysis {
        engine = engine.with_quality_probe(Arc::new(FfprobeQualityProbe::from_config(&config)));
    }

    let mut syncs = Vec::with_capacity(batches.len());
    for (provider_id, entries) in &batches {
        syncs.push(engine.sync_provider(provider_id, entries, &cancel).await?);
    }

    let health = if probe {
        let prober = HttpStreamProbe::from_config(&config)?;
        let checker = HealthChecker::new(registry.clone(), Arc::new(prober), config.clone());
        Some(checker.run_cycle(&cancel).await?)
    } else {
        None
    };

    let mut channels = registry.ranked_views().await;
    if active_only {
        for view in &mut channels {
            view.streams.retain(|s| s.health_state.is_active());
        }
    }

    let stats = registry.stats().await;
    info!(
        "Resolved {} streams into {} channels ({} dead)",
        stats.streams, stats.channels, stats.dead_streams
    );

    Ok(ResolveOutput {
        syncs,
        health,
        channels,
    })
}

async fn read_entries(
    path: &Path,
    provider: Option<&str>,
    priority: i32,
) -> Result<Vec<RawChannelEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let is_playlist = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("m3u") || e.eq_ignore_ascii_case("m3u8"));

    if is_playlist {
        let provider_id = provider
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .context("Cannot derive a provider id for the playlist; pass --provider")?;
        return Ok(parse_m3u(&content, &provider_id, priority));
    }

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse entries from {}", path.display()))
}
