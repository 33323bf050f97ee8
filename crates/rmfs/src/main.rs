//! rmfs: mount a reMarkable tablet's documents as a filesystem.
//!
//! Connects to the device over SSH (or serves a local copy of its data
//! directory), builds the folder tree from the document store and mounts it
//! with FUSE until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use rmfs::config::Config;
use rmfs::fuse;
use rmfs::{LocalSession, SshSession};
use rmfs_core::{Mount, RemoteSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rmfs")]
#[command(about = "Mount a reMarkable tablet's documents as a filesystem")]
struct Args {
    /// Where to mount the documents
    mountpoint: PathBuf,

    /// Device address (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// SSH user (overrides the config file)
    #[arg(short, long)]
    user: Option<String>,

    /// Serve a local copy of the data directory instead of a device
    #[arg(long)]
    local: Option<PathBuf>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,rmfs=debug,rmfs_core=debug"
    } else {
        "info,rmfs=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = args.host {
        config.connection.host = host;
    }
    if let Some(user) = args.user {
        config.connection.user = user;
    }

    info!("Starting rmfs");
    info!("Mount point: {:?}", args.mountpoint);

    if let Some(dir) = args.local {
        info!("Serving local data directory {:?}", dir);
        // Nothing to reload without a device
        let mut mount_config = config.mount.clone();
        mount_config.reload_command.clear();

        let mount = Mount::open_session(LocalSession::new(dir), mount_config).await?;
        serve(Arc::new(mount), &args.mountpoint, &config).await
    } else {
        let session = Arc::new(SshSession::new(&config.connection));
        session.connect(&config.connection.stop_command).await?;

        let result = match Mount::open_session(session.clone(), config.mount.clone()).await {
            Ok(mount) => serve(Arc::new(mount), &args.mountpoint, &config).await,
            Err(e) => Err(e.into()),
        };
        session.disconnect().await;
        result
    }
}

/// Mount, run background flushes and refreshes until Ctrl+C, then unmount
/// and write out everything still pending.
async fn serve<R: RemoteSession + 'static>(
    mount: Arc<Mount<R>>,
    at: &Path,
    config: &Config,
) -> Result<()> {
    let background = fuse::spawn(mount.clone(), tokio::runtime::Handle::current(), at)?;
    info!("Mounted at {:?}. Press Ctrl+C to unmount.", at);

    let flush_period = Duration::from_secs(config.flush_interval_secs.max(1));
    let mut flush = interval_at(Instant::now() + flush_period, flush_period);

    let refresh_enabled = config.refresh_interval_secs > 0;
    let refresh_period = Duration::from_secs(config.refresh_interval_secs.max(1));
    let mut refresh = interval_at(Instant::now() + refresh_period, refresh_period);

    loop {
        tokio::select! {
            _ = flush.tick() => {
                let report = mount.flush_pending().await;
                if !report.is_clean() {
                    warn!("{} changes still pending after flush", report.failed);
                }
            }

            _ = refresh.tick(), if refresh_enabled => {
                match mount.refresh().await {
                    Ok(report) => debug!("Refreshed from device: {:?}", report),
                    Err(e) => warn!("Refresh failed: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Unmounting joins the FUSE thread, which may still be waiting on the runtime
    tokio::task::spawn_blocking(move || drop(background)).await?;
    info!("Unmounted {:?}", at);

    let report = mount.shutdown().await;
    if report.is_clean() {
        info!("Shutting down");
    } else {
        warn!("Shutting down with {} unsaved changes", report.failed);
    }
    Ok(())
}
