//! ipfilter daemon
//!
//! Loads the XDP program, reconciles its maps against the config file on
//! every change, and writes per-source statistics on shutdown.

mod api;
mod watcher;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::programs::XdpFlags;
use clap::Parser;
use ipfilter::{FilterMaps, IpFilter, ReconcileReport, Reconciler, StatsReport};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_BPF_OBJECT: &str = "target/bpfel-unknown-none/release/ipfilter";

#[derive(Parser, Debug)]
#[command(name = "ipfilterd")]
#[command(about = "IPv4 blacklist and per-source rate limiting with XDP")]
struct Args {
    /// Config file (default: config.txt next to the executable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Compiled eBPF object
    #[arg(long, default_value = DEFAULT_BPF_OBJECT)]
    bpf_object: PathBuf,

    /// Where to write the statistics table on shutdown
    #[arg(long, default_value = "stats.txt")]
    stats_file: PathBuf,

    /// Try native XDP mode first (falls back to SKB)
    #[arg(long)]
    native: bool,

    /// Log the top sources every N seconds (0 = disabled)
    #[arg(long, default_value = "0")]
    report_interval: u64,

    /// Number of sources in periodic reports
    #[arg(long, default_value = "10")]
    top: usize,

    /// Serve the HTTP API on this port
    #[arg(long)]
    api_port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// State shared between the main loop and the API.
pub struct AppState<M> {
    reconciler: Mutex<Reconciler<M>>,
    config_path: PathBuf,
}

impl<M: FilterMaps> AppState<M> {
    pub fn new(reconciler: Reconciler<M>, config_path: PathBuf) -> Self {
        Self {
            reconciler: Mutex::new(reconciler),
            config_path,
        }
    }

    /// Re-read the config file and run a reconciliation pass.
    pub async fn reload(&self) -> Result<ReconcileReport> {
        let raw = tokio::fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;
        let report = self.reconciler.lock().await.reconcile(&raw)?;
        Ok(report)
    }

    pub async fn report(&self) -> Result<StatsReport> {
        let reconciler = self.reconciler.lock().await;
        Ok(ipfilter::report(reconciler.maps())?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    info!("Starting ipfilter (config: {})", config_path.display());

    let (mut filter, mut maps) = IpFilter::load(&args.bpf_object)?;
    maps.reset_global_counters()?;

    // The first pass is mandatory: it names the interface to attach to.
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let mut reconciler = Reconciler::new(maps);
    let report = reconciler
        .reconcile(&raw)
        .context("Initial configuration rejected")?;

    let flags = if args.native { XdpFlags::DRV_MODE } else { XdpFlags::default() };
    filter.attach(&report.interface, flags)?;

    let state = Arc::new(AppState::new(reconciler, config_path.clone()));
    let (_watcher, mut changes) = watcher::watch(&config_path)?;

    if let Some(port) = args.api_port {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, port).await {
                error!("API server failed: {:#}", e);
            }
        });
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            Some(()) = changes.recv() => {
                info!("Config file changed, reconciling");
                if let Err(e) = state.reload().await {
                    error!("Reconciliation failed, keeping previous state: {:#}", e);
                }
            }
            _ = ticker.tick(), if args.report_interval > 0 => {
                match state.report().await {
                    Ok(report) => log_top(&report, args.top),
                    Err(e) => warn!("Failed to read statistics: {:#}", e),
                }
            }
        }
    }

    let report = state.report().await?;
    write_stats_file(&args.stats_file, &report)?;
    info!("{}", report.totals_line());
    info!("Statistics written to {}", args.stats_file.display());

    drop(filter);
    Ok(())
}

fn default_config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate executable")?;
    let dir = exe.parent().context("Executable has no parent directory")?;
    Ok(dir.join("config.txt"))
}

fn write_stats_file(path: &Path, report: &StatsReport) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    report.write_table(&mut out)?;
    out.flush()?;
    Ok(())
}

fn log_top(report: &StatsReport, n: usize) {
    info!("{}", report.totals_line());
    for s in report.top(n) {
        info!(
            "  {:<15} dropped={:<10} passed={:<10}",
            s.ip.to_string(),
            s.dropped,
            s.passed
        );
    }
}
