//! `sshvm` — SSH server that dynamically provisions Linux microVMs.
//!
//! One VM per username, shared by concurrent sessions, torn down when the
//! last session disconnects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use sshvm_core::config::BRIDGE_NAME;
use sshvm_core::{Config, NetworkFabric, UserStats, VmManager};
use sshvm_gateway::{SessionTracker, SharedState};

/// How long live sessions get to wind down after a shutdown signal.
const DRAIN_WINDOW: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "sshvm",
    about = "SSH server that dynamically provisions Linux microVMs",
    version
)]
struct Cli {
    /// SSH server port
    #[arg(long, default_value_t = 2222)]
    port: u16,

    /// Path to the SSH host key (generated under the data dir if omitted)
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// CIDR block for VM IP addresses (IPv4, /28 or larger)
    #[arg(long, default_value = "192.168.100.0/24")]
    vm_cidr: String,

    /// VM memory in MiB
    #[arg(long, default_value_t = 128)]
    vm_memory: u32,

    /// Number of VM CPUs
    #[arg(long, default_value_t = 1)]
    vm_cpus: u32,

    /// Maximum number of concurrent VMs (0 = unlimited)
    #[arg(long, default_value_t = 16)]
    max_concurrent_vms: usize,

    /// Directory for VM state and data
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Path to the rootfs template image (required)
    #[arg(long)]
    rootfs: PathBuf,

    /// Firecracker binary, copied into the data directory at startup
    #[arg(long)]
    firecracker: PathBuf,

    /// Uncompressed guest kernel image, copied into the data directory
    #[arg(long)]
    kernel: PathBuf,

    /// Allow VMs to access the internet
    #[arg(long)]
    allow_internet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let config = Arc::new(Config::new(
        cli.port,
        cli.host_key,
        &cli.vm_cidr,
        cli.vm_memory,
        cli.vm_cpus,
        cli.max_concurrent_vms,
        cli.data_dir,
        cli.rootfs,
        cli.allow_internet,
    )?);

    info!(
        port = config.port,
        cidr = %config.vm_cidr,
        memory_mib = config.vm_memory,
        cpus = config.vm_cpus,
        max_vms = config.max_concurrent_vms,
        data_dir = %config.data_dir.display(),
        "starting sshvm"
    );

    let monitor_bin = std::fs::read(&cli.firecracker)
        .with_context(|| format!("read monitor binary {}", cli.firecracker.display()))?;
    let kernel = std::fs::read(&cli.kernel)
        .with_context(|| format!("read kernel image {}", cli.kernel.display()))?;

    // Host fabric failures at startup are fatal.
    let fabric = Arc::new(NetworkFabric::new(
        BRIDGE_NAME,
        config.vm_cidr,
        config.gateway(),
    ));
    fabric.setup().context("host network fabric setup")?;

    let manager = Arc::new(VmManager::new(
        config.clone(),
        fabric.clone(),
        &monitor_bin,
        &kernel,
    )?);

    let stats = Arc::new(UserStats::new(&config.data_dir));
    if let Err(e) = stats.load() {
        warn!(error = %e, "could not load user stats, starting fresh");
    }

    let host_key = sshvm_gateway::load_or_generate_host_key(&config.host_key_path())?;

    let state = Arc::new(SharedState {
        config: config.clone(),
        manager: manager.clone(),
        stats: stats.clone(),
        sessions: SessionTracker::default(),
    });

    let served: Result<()> = tokio::select! {
        res = sshvm_gateway::serve(state.clone(), host_key) => res,
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining sessions");
            Ok(())
        }
    };

    // Teardown runs no matter how shutdown was triggered, a server error
    // included. The accept loop is gone; grant live sessions a bounded
    // drain window first.
    if tokio::time::timeout(DRAIN_WINDOW, state.sessions.wait_idle())
        .await
        .is_err()
    {
        warn!(
            active = state.sessions.active(),
            "drain window elapsed, forcing shutdown"
        );
    }

    manager.destroy_all().await;
    fabric.teardown();
    if let Err(e) = stats.save() {
        warn!(error = %e, "failed to save user stats");
    }

    served?;
    info!("sshvm shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
