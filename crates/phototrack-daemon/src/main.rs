use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use phototrack_core::prelude::*;
use phototrack_daemon::bootstrap::{load_config, log_level};
use phototrack_daemon::TrackerService;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "phototrack")]
#[command(about = "Keeps a photo catalog in sync with directory trees", long_about = None)]
struct Args {
    /// JSON config file; the TRACKER_* environment and config/.env are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scan every root at startup regardless of the config
    #[arg(long)]
    scan: bool,

    /// Watch every root regardless of the config
    #[arg(long)]
    watch: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    config.startup |= args.scan;
    config.watch |= args.watch;

    tracing_subscriber::fmt()
        .with_max_level(log_level(config.log_level.as_deref(), args.verbose))
        .with_target(false)
        .init();

    config.validate()?;
    info!(
        roots = config.roots.len(),
        host = %config.proc.host,
        processes = config.proc.processes,
        catalog = %config.catalog_dir.display(),
        "phototrack starting"
    );

    let catalog = Catalog::open(&config.catalog_dir)?;
    let (queue, queue_events) = LocalQueue::new();
    let context = TrackerContext {
        catalog,
        queue: Arc::new(queue),
        assets: cleaner_for(&config.content),
        settings: TrackerSettings::from_config(&config),
    };
    let tracker = Arc::new(Tracker::start(context, queue_events).await?);
    let mut events = tracker.subscribe();

    let service = TrackerService::new(tracker.clone());
    service.start(&config).await?;
    info!("Press Ctrl+C to stop...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping...");
                break;
            }
            event = events.recv() => match event {
                Ok(TrackerEvent::Swept(report)) => {
                    info!(albums = report.albums, photos = report.photos, "scan finished");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "tracker events lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let stopped = service.stop().await;
    let shut_down = tracker.shutdown().await;
    if let Err(err) = stopped.and(shut_down) {
        error!(error = %err, "shutdown failed");
        std::process::exit(1);
    }
    info!("phototrack stopped");
    Ok(())
}
