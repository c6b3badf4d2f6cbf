//! relayd - MJPEG relay daemon
//!
//! This daemon:
//! 1. Builds the fallback frames (fails hard if it cannot)
//! 2. Loads the detection models and starts the pipeline if configured
//! 3. Serves `/stream` and the detection control endpoints until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use mjpeg_relay::{
    api::{ApiConfig, ApiServer},
    config::RelayConfig,
    detect::DetectionPipeline,
    ingest::HttpUpstream,
    FrameTransformer, RelayContext,
};

const PIPELINE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Resilient MJPEG relay with detection overlay")]
struct Args {
    /// Config file (JSON, or TOML by extension). Defaults to $RELAY_CONFIG.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8081.
    #[arg(long)]
    listen: Option<String>,

    /// Upstream MJPEG URL.
    #[arg(long)]
    upstream: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(upstream) = args.upstream {
        config.upstream.url = upstream;
    }
    config.validate()?;

    let fallback = match config.build_fallback() {
        Ok(fallback) => fallback,
        Err(err) => {
            log::error!("cannot produce fallback frames: {:#}", err);
            return Err(err);
        }
    };
    log::info!("fallback ready: {} frame(s)", fallback.len());

    let registry = config.build_registry()?;
    let pipeline = Arc::new(DetectionPipeline::new(
        registry,
        config.detection.queue_capacity,
    ));
    if config.detection.enabled {
        if let Err(err) = pipeline.enable() {
            log::warn!("detection not started: {}", err);
        }
    }

    let upstream = HttpUpstream::new(config.upstream_config())
        .context("invalid upstream configuration")?;
    let relay = Arc::new(RelayContext {
        upstream: Arc::new(upstream),
        fallback: Arc::new(fallback),
        transformer: FrameTransformer::new(config.transform.clone()),
        pipeline: Some(pipeline.clone()),
        annotator: config.build_annotator()?,
        settings: config.session_settings(),
        shutdown: Arc::new(AtomicBool::new(false)),
    });

    let api_config = ApiConfig {
        addr: config.listen_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, relay).spawn()?;
    log::info!(
        "relayd running. relaying {} on http://{}/stream",
        config.upstream.url,
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("relayd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping relay...");
    api_handle.stop()?;
    if !pipeline.shutdown(PIPELINE_SHUTDOWN_TIMEOUT) {
        log::warn!("detection worker did not stop within {:?}", PIPELINE_SHUTDOWN_TIMEOUT);
    }

    Ok(())
}
