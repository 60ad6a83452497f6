//! `delivert` command line.
//!
//! Usage:
//!   delivert inspect [--dir <path>]
//!   delivert simulate [--dir <path>] [--payloads 20] [--outage-ms 5000] [--config overrides.toml]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delivert::{
    scan_backlog, spawn_buffering, BufferingRelay, ConfigStore, ConnectionState, Dispatch,
    DirStore, DurableStore, Endpoint, PartialConfig, PersistentQueue, SimTransport, Transport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "delivert", version, about = "Store-and-forward payload relay")]
struct Cli {
    /// Store directory holding queued payloads, the queue and config
    #[arg(long, global = true, env = "DELIVERT_DIR")]
    dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the persisted config and backlog of a store
    Inspect,

    /// Drive a buffering relay through a link outage against a simulated
    /// transport
    Simulate {
        /// Payloads to send
        #[arg(long, default_value_t = 20)]
        payloads: usize,

        /// Gap between payloads in milliseconds
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,

        /// How long the link stays down from the start, in milliseconds
        #[arg(long, default_value_t = 1000)]
        outage_ms: u64,

        /// TOML file of config overrides (e.g. `PAYLOAD_LIMIT = 5`)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "delivert=info",
        1 => "delivert=debug",
        _ => "delivert=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let no_color = std::env::var("NO_COLOR").is_ok()
        || !std::io::IsTerminal::is_terminal(&std::io::stderr());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!no_color)
        .with_writer(std::io::stderr)
        .init();
}

fn store_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => dirs::data_local_dir()
            .map(|d| d.join("delivert"))
            .context("Cannot determine data directory, pass --dir"),
    }
}

fn load_overrides(path: &Path) -> Result<PartialConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config overrides in {}", path.display()))
}

fn inspect(dir: &Path) -> Result<()> {
    let store: Arc<dyn DurableStore> =
        Arc::new(DirStore::open(dir).with_context(|| format!("Failed to open {}", dir.display()))?);

    let config = ConfigStore::new(store.as_ref()).load_or_default()?;
    let queue = PersistentQueue::load(store.clone(), Endpoint::Buffering, config.payload_limit)?;
    let scan = scan_backlog(store.as_ref(), Endpoint::Buffering)?;

    println!("store:      {}", dir.display());
    println!("config:     {}", serde_json::to_string(&config)?);
    println!("queued:     {} (limit {})", queue.len(), queue.limit());
    println!("files:      {} (max address {:04})", scan.count, scan.max_offset);
    if let Some(front) = queue.front() {
        println!("next drain: {}", Endpoint::Buffering.payload_name(front));
    }
    if scan.count != queue.len() {
        println!("warning:    queue and payload files disagree; next start will reconcile");
    }
    Ok(())
}

async fn simulate(
    dir: &Path,
    payloads: usize,
    interval: Duration,
    outage: Duration,
    overrides: Option<PartialConfig>,
) -> Result<()> {
    let store: Arc<dyn DurableStore> =
        Arc::new(DirStore::open(dir).with_context(|| format!("Failed to open {}", dir.display()))?);
    let transport = SimTransport::new(ConnectionState::Closed);
    let transport_ptr: Arc<dyn Transport> = Arc::new(transport.clone());

    let relay = BufferingRelay::open(store, transport_ptr)?;
    let (handle, task) = spawn_buffering(relay);

    if let Some(overrides) = overrides {
        let config = handle.configure(overrides).await?;
        info!(?config, "Applied overrides");
    }

    // Bring the link up after the outage and keep delivering what arrives
    let link = transport.clone();
    let link_task = tokio::spawn(async move {
        tokio::time::sleep(outage).await;
        link.set_connection(ConnectionState::Open);
        info!("Link up");
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            link.deliver_all();
        }
    });

    let (mut sent, mut stored, mut overflowed) = (0, 0, 0);
    for i in 0..payloads {
        let body = format!("payload-{:04}", i);
        match handle.send(body).await? {
            Dispatch::Sent { .. } => sent += 1,
            Dispatch::Stored { .. } => stored += 1,
            Dispatch::Overflowed { .. } => overflowed += 1,
        }
        tokio::time::sleep(interval).await;
    }
    info!(sent, stored, overflowed, "All payloads dispatched");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = async {
            while scan_pending(dir) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        } => info!("Backlog drained"),
    }

    handle.shutdown().await?;
    let exit = task.await.context("Relay task panicked")??;
    link_task.abort();

    let delivered = transport.delivered().len();
    println!(
        "exit={:?} sent={} stored={} overflowed={} delivered={}",
        exit, sent, stored, overflowed, delivered
    );
    Ok(())
}

/// Count queued payload files without taking the store lock.
fn scan_pending(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .starts_with(Endpoint::Buffering.prefix())
                })
                .count()
        })
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let dir = store_dir(cli.dir)?;
    match cli.command {
        Command::Inspect => inspect(&dir),
        Command::Simulate {
            payloads,
            interval_ms,
            outage_ms,
            config,
        } => {
            let overrides = config.as_deref().map(load_overrides).transpose()?;
            simulate(
                &dir,
                payloads,
                Duration::from_millis(interval_ms),
                Duration::from_millis(outage_ms),
                overrides,
            )
            .await
        }
    }
}
