//! One running microVM: scratch state on disk, the supervised monitor
//! process, and its configuration over the per-VM API socket.

use std::fs::{self, File, OpenOptions, Permissions};
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::firecracker::MonitorApi;

/// How long the monitor API socket may take to appear after spawn.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace window between requesting a clean guest shutdown and force-killing
/// the monitor.
const STOP_GRACE: Duration = Duration::from_millis(250);

/// Everything needed to bring up one instance. Assembled by the manager.
pub struct InstanceConfig {
    pub id: String,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mac: String,
    pub tap: String,
    pub vcpus: u32,
    pub memory_mib: u32,
    /// Shared kernel image in the data directory.
    pub kernel: PathBuf,
    /// Shared monitor executable in the data directory.
    pub monitor_bin: PathBuf,
    /// Per-VM scratch directory.
    pub dir: PathBuf,
    /// Writable per-VM rootfs copy inside `dir`.
    pub rootfs: PathBuf,
}

#[derive(Debug)]
pub struct VmInstance {
    pub id: String,
    pub ip: Ipv4Addr,
    gateway: Ipv4Addr,
    netmask: Ipv4Addr,
    mac: String,
    tap: String,
    vcpus: u32,
    memory_mib: u32,
    kernel: PathBuf,
    monitor_bin: PathBuf,
    dir: PathBuf,
    rootfs: PathBuf,
    socket_path: PathBuf,
    pid_file: PathBuf,
    console_in: PathBuf,
    console_out: PathBuf,
    process: Mutex<Option<Child>>,
}

impl VmInstance {
    pub fn new(cfg: InstanceConfig) -> Self {
        let socket_path = cfg.dir.join("firecracker.sock");
        let pid_file = cfg.dir.join("firecracker.pid");
        let console_in = cfg.dir.join("console.in");
        let console_out = cfg.dir.join("console.out");
        Self {
            id: cfg.id,
            ip: cfg.ip,
            gateway: cfg.gateway,
            netmask: cfg.netmask,
            mac: cfg.mac,
            tap: cfg.tap,
            vcpus: cfg.vcpus,
            memory_mib: cfg.memory_mib,
            kernel: cfg.kernel,
            monitor_bin: cfg.monitor_bin,
            dir: cfg.dir,
            rootfs: cfg.rootfs,
            socket_path,
            pid_file,
            console_in,
            console_out,
            process: Mutex::new(None),
        }
    }

    pub fn tap(&self) -> &str {
        &self.tap
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Guest SSH endpoint.
    pub fn ssh_addr(&self) -> String {
        format!("{}:22", self.ip)
    }

    /// Kernel command line. Order-sensitive: the guest's early IP
    /// autoconfiguration parses the `ip=` clause positionally.
    pub fn boot_args(&self) -> String {
        format!(
            "console=ttyS0 reboot=k panic=1 random.trust_cpu=on nomodules ip={}::{}:{}:{}:eth0:off",
            self.ip, self.gateway, self.netmask, self.id
        )
    }

    /// Launch the monitor, configure the machine over its API socket, and
    /// boot the guest. On error the monitor is killed; the caller rolls back
    /// the rest (IP, TAP, scratch directory).
    pub async fn start(&self) -> Result<()> {
        // A stale socket would make the monitor refuse to bind.
        let _ = fs::remove_file(&self.socket_path);

        let child = self.spawn_monitor().context("launch monitor process")?;
        let pid = child.id();
        *self.process.lock().expect("instance lock poisoned") = Some(child);

        if let Err(e) = fs::write(&self.pid_file, pid.to_string()) {
            self.kill_monitor();
            return Err(anyhow::Error::new(e).context("write monitor PID file"));
        }

        if let Err(e) = self.configure().await {
            self.kill_monitor();
            return Err(e);
        }

        info!(vm = %self.id, ip = %self.ip, pid, "microVM started");
        Ok(())
    }

    /// Request a clean guest shutdown, watch the monitor exit for a short
    /// grace window, then force-stop it. The scratch directory and
    /// `console.out` are kept for post-mortem.
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            let api = MonitorApi::new(&self.socket_path);
            let _ = api
                .put("/actions", &json!({ "action_type": "SendCtrlAltDel" }))
                .await;
        }

        let child = self.process.lock().expect("instance lock poisoned").take();
        if let Some(mut child) = child {
            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            loop {
                match child.try_wait().context("wait for monitor")? {
                    Some(status) => {
                        debug!(vm = %self.id, %status, "monitor exited cleanly");
                        break;
                    }
                    None if tokio::time::Instant::now() >= deadline => {
                        warn!(vm = %self.id, "monitor still running after grace window, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    None => tokio::time::sleep(Duration::from_millis(25)).await,
                }
            }
        }

        for path in [&self.socket_path, &self.pid_file, &self.console_in] {
            let _ = fs::remove_file(path);
        }

        info!(vm = %self.id, ip = %self.ip, "microVM stopped");
        Ok(())
    }

    fn spawn_monitor(&self) -> Result<Child> {
        // Console input is a named pipe opened read-write so the open does
        // not block on a missing writer; output is a truncating log.
        let _ = fs::remove_file(&self.console_in);
        make_fifo(&self.console_in, 0o600)?;
        let console_in = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.console_in)
            .with_context(|| format!("open {}", self.console_in.display()))?;

        let console_out = File::create(&self.console_out)
            .with_context(|| format!("create {}", self.console_out.display()))?;
        fs::set_permissions(&self.console_out, Permissions::from_mode(0o644))
            .context("chmod console log")?;
        let console_err = console_out.try_clone().context("clone console log handle")?;

        let mut cmd = Command::new(&self.monitor_bin);
        cmd.arg("--api-sock")
            .arg(&self.socket_path)
            .stdin(Stdio::from(console_in))
            .stdout(Stdio::from(console_out))
            .stderr(Stdio::from(console_err));

        // The monitor gets its own session so signals aimed at the server
        // (e.g. SIGINT from a controlling TTY) never reach it; stop() is the
        // only way it dies.
        // SAFETY: setsid is async-signal-safe and reports failure as -1.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
            .with_context(|| format!("spawn {}", self.monitor_bin.display()))
    }

    async fn configure(&self) -> Result<()> {
        let api = MonitorApi::new(&self.socket_path);
        api.wait_ready(SOCKET_TIMEOUT)
            .await
            .context("monitor API socket not ready")?;

        api.put(
            "/machine-config",
            &json!({
                "vcpu_count": self.vcpus,
                "mem_size_mib": self.memory_mib,
            }),
        )
        .await
        .context("configure machine")?;

        api.put(
            "/boot-source",
            &json!({
                "kernel_image_path": self.kernel.to_string_lossy(),
                "boot_args": self.boot_args(),
            }),
        )
        .await
        .context("configure boot source")?;

        api.put(
            "/drives/rootfs",
            &json!({
                "drive_id": "rootfs",
                "path_on_host": self.rootfs.to_string_lossy(),
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await
        .context("configure root drive")?;

        api.put(
            "/network-interfaces/eth0",
            &json!({
                "iface_id": "eth0",
                "guest_mac": self.mac,
                "host_dev_name": self.tap,
            }),
        )
        .await
        .context("configure network interface")?;

        api.put(
            "/entropy",
            &json!({
                "rate_limiter": {
                    "bandwidth": { "size": 4096, "one_time_burst": 4096, "refill_time": 100 }
                }
            }),
        )
        .await
        .context("configure entropy device")?;

        api.put("/actions", &json!({ "action_type": "InstanceStart" }))
            .await
            .context("boot instance")?;

        Ok(())
    }

    /// Synchronous force-stop, safe to call from a rollback path that
    /// cannot await. Idempotent once the child has been reaped.
    pub(crate) fn kill_monitor(&self) {
        if let Some(mut child) = self.process.lock().expect("instance lock poisoned").take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn make_fifo(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).context("fifo path")?;
    // SAFETY: cpath is a valid NUL-terminated path.
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mkfifo {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(dir: &Path) -> VmInstance {
        VmInstance::new(InstanceConfig {
            id: "alice".to_string(),
            ip: "192.168.100.2".parse().unwrap(),
            gateway: "192.168.100.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            mac: "02:FC:00:00:00:02".to_string(),
            tap: "sshvm-tap-2".to_string(),
            vcpus: 1,
            memory_mib: 128,
            kernel: PathBuf::from("/data/vmlinux"),
            monitor_bin: PathBuf::from("/data/firecracker"),
            dir: dir.to_path_buf(),
            rootfs: dir.join("rootfs.img"),
        })
    }

    #[test]
    fn test_boot_args_literal() {
        let dir = tempfile::tempdir().unwrap();
        let vm = instance(dir.path());
        assert_eq!(
            vm.boot_args(),
            "console=ttyS0 reboot=k panic=1 random.trust_cpu=on nomodules \
             ip=192.168.100.2::192.168.100.1:255.255.255.0:alice:eth0:off"
        );
    }

    #[test]
    fn test_scratch_paths() {
        let dir = tempfile::tempdir().unwrap();
        let vm = instance(dir.path());
        assert_eq!(vm.socket_path, dir.path().join("firecracker.sock"));
        assert_eq!(vm.pid_file, dir.path().join("firecracker.pid"));
        assert_eq!(vm.console_in, dir.path().join("console.in"));
        assert_eq!(vm.console_out, dir.path().join("console.out"));
        assert_eq!(vm.ssh_addr(), "192.168.100.2:22");
    }

    #[test]
    fn test_make_fifo_sets_mode() {
        use std::os::unix::fs::FileTypeExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.in");
        make_fifo(&path, 0o600).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let vm = instance(dir.path());
        vm.stop().await.unwrap();
    }
}
