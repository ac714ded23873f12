//! `vm-start` — boot a single microVM without the SSH front door.
//!
//! Smoke-tests a kernel/rootfs/monitor combination: provisions one VM for
//! a fixed test user, prints how to reach it, and tears it down on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sshvm_core::config::BRIDGE_NAME;
use sshvm_core::{Config, NetworkFabric, VmManager};

const TEST_VM_ID: &str = "test-user";

#[derive(Parser)]
#[command(name = "vm-start", about = "Start a single VM for testing", version)]
struct Cli {
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

    /// CIDR block for VM IP addresses (IPv4, /28 or larger)
    #[arg(long, default_value = "192.168.100.0/24")]
    vm_cidr: String,

    /// VM memory in MiB
    #[arg(long, default_value_t = 128)]
    vm_memory: u32,

    /// Number of VM CPUs
    #[arg(long, default_value_t = 1)]
    vm_cpus: u32,

    /// Allow the VM to access the internet
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
        2222,
        None,
        &cli.vm_cidr,
        cli.vm_memory,
        cli.vm_cpus,
        0,
        cli.data_dir,
        cli.rootfs,
        cli.allow_internet,
    )?);

    let monitor_bin = std::fs::read(&cli.firecracker)
        .with_context(|| format!("read monitor binary {}", cli.firecracker.display()))?;
    let kernel = std::fs::read(&cli.kernel)
        .with_context(|| format!("read kernel image {}", cli.kernel.display()))?;

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

    info!(cidr = %config.vm_cidr, data_dir = %config.data_dir.display(), "creating test VM");
    let result = boot_and_wait(&manager).await;

    // Teardown runs whether the boot succeeded or not.
    info!("shutting down");
    manager.destroy_all().await;
    fabric.teardown();
    result
}

async fn boot_and_wait(manager: &VmManager) -> Result<()> {
    let vm = manager.get_or_create(TEST_VM_ID).await?;

    info!(vm = %vm.id, ip = %vm.ip, "VM is booting");
    info!("try: ssh root@{} (once the guest SSH service is up)", vm.ip);
    info!("press Ctrl-C to destroy the VM and exit");

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    Ok(())
}
