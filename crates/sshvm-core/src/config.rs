//! Runtime configuration, validated once at startup.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;

/// Name of the host bridge joining all per-VM TAP devices.
pub const BRIDGE_NAME: &str = "sshvm-br0";

/// Host key file created under the data directory when `--host-key` is not given.
pub const HOST_KEY_FILE: &str = "ssh_host_ed25519_key";

#[derive(Debug, Clone)]
pub struct Config {
    /// SSH server port.
    pub port: u16,
    /// Path to the SSH host key; generated under `data_dir` when `None`.
    pub host_key: Option<PathBuf>,
    /// CIDR block guest addresses are allocated from.
    pub vm_cidr: Ipv4Network,
    /// Guest memory in MiB.
    pub vm_memory: u32,
    /// Guest vCPU count.
    pub vm_cpus: u32,
    /// Maximum number of concurrently running VMs (0 = unlimited).
    pub max_concurrent_vms: usize,
    /// Directory for bootstrap artifacts, per-VM scratch state, and user stats.
    pub data_dir: PathBuf,
    /// Read-only rootfs template, copied once per VM.
    pub rootfs: PathBuf,
    /// Allow VMs to access the internet. Accepted on the CLI; egress NAT
    /// is part of the fixed fabric rule set regardless.
    pub allow_internet: bool,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        port: u16,
        host_key: Option<PathBuf>,
        vm_cidr: &str,
        vm_memory: u32,
        vm_cpus: u32,
        max_concurrent_vms: usize,
        data_dir: PathBuf,
        rootfs: PathBuf,
        allow_internet: bool,
    ) -> Result<Self> {
        if port == 0 {
            bail!("port must be between 1 and 65535");
        }

        let vm_cidr: Ipv4Network = vm_cidr
            .parse()
            .with_context(|| format!("invalid VM CIDR {vm_cidr:?}"))?;
        // A /28 leaves 13 allocatable addresses after the network, broadcast,
        // and gateway exclusions; anything smaller is useless for sharing.
        if vm_cidr.prefix() > 28 {
            bail!("VM CIDR must be /28 or larger to accommodate multiple VMs");
        }

        if vm_memory < 64 {
            bail!("VM memory must be at least 64 MiB");
        }
        if vm_cpus < 1 {
            bail!("VM must have at least 1 CPU");
        }

        if rootfs.as_os_str().is_empty() {
            bail!("rootfs image path is required");
        }
        if !rootfs.exists() {
            bail!("rootfs image not found: {}", rootfs.display());
        }

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data directory {}", data_dir.display()))?;

        Ok(Self {
            port,
            host_key,
            vm_cidr,
            vm_memory,
            vm_cpus,
            max_concurrent_vms,
            data_dir,
            rootfs,
            allow_internet,
        })
    }

    /// Resolved host key location.
    pub fn host_key_path(&self) -> PathBuf {
        self.host_key
            .clone()
            .unwrap_or_else(|| self.data_dir.join(HOST_KEY_FILE))
    }

    /// First host of the VM CIDR, assigned to the bridge.
    pub fn gateway(&self) -> std::net::Ipv4Addr {
        // A /28-or-larger network always has a first host.
        self.vm_cidr.nth(1).expect("validated CIDR has a gateway")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs.ext4");
        std::fs::write(&rootfs, b"fake rootfs").unwrap();
        (dir, rootfs)
    }

    fn build(cidr: &str, memory: u32, cpus: u32) -> Result<Config> {
        let (dir, rootfs) = tmp_setup();
        Config::new(
            2222,
            None,
            cidr,
            memory,
            cpus,
            16,
            dir.path().join("data"),
            rootfs,
            false,
        )
    }

    #[test]
    fn test_valid_config() {
        let cfg = build("192.168.100.0/24", 128, 1).unwrap();
        assert_eq!(cfg.vm_cidr.prefix(), 24);
        assert_eq!(cfg.host_key_path(), cfg.data_dir.join(HOST_KEY_FILE));
        assert_eq!(cfg.gateway().to_string(), "192.168.100.1");
    }

    #[test]
    fn test_rejects_invalid_cidr() {
        assert!(build("not-a-cidr", 128, 1).is_err());
        // IPv6 is not supported.
        assert!(build("fd00::/64", 128, 1).is_err());
    }

    #[test]
    fn test_rejects_small_cidr() {
        assert!(build("192.168.100.0/29", 128, 1).is_err());
        assert!(build("192.168.100.0/28", 128, 1).is_ok());
    }

    #[test]
    fn test_rejects_tiny_resources() {
        assert!(build("192.168.100.0/24", 32, 1).is_err());
        assert!(build("192.168.100.0/24", 128, 0).is_err());
    }

    #[test]
    fn test_rejects_missing_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::new(
            2222,
            None,
            "192.168.100.0/24",
            128,
            1,
            16,
            dir.path().join("data"),
            dir.path().join("missing.ext4"),
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_port_zero() {
        let (dir, rootfs) = tmp_setup();
        let err = Config::new(
            0,
            None,
            "192.168.100.0/24",
            128,
            1,
            16,
            dir.path().join("data"),
            rootfs,
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_explicit_host_key_wins() {
        let (dir, rootfs) = tmp_setup();
        let key = dir.path().join("custom_key");
        let cfg = Config::new(
            2222,
            Some(key.clone()),
            "192.168.100.0/24",
            128,
            1,
            16,
            dir.path().join("data"),
            rootfs,
            false,
        )
        .unwrap();
        assert_eq!(cfg.host_key_path(), key);
    }
}
