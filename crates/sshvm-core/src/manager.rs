//! Reference-counted VM ownership: one map from VM id to a running
//! instance plus the number of sessions bound to it.

use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fabric::{self, NetworkFabric};
use crate::instance::{InstanceConfig, VmInstance};
use crate::ippool::IpPool;

/// Returned by [`VmManager::get_or_create`] when the concurrency cap is hit.
/// Typed so the session layer can tell it apart from provisioning failures.
#[derive(Debug)]
pub struct CapacityError {
    pub limit: usize,
}

impl std::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "maximum number of concurrent VMs reached ({})",
            self.limit
        )
    }
}

impl std::error::Error for CapacityError {}

/// Returned when an in-flight create is abandoned because the requesting
/// session went away. Partial resources are rolled back before this
/// surfaces.
#[derive(Debug)]
pub struct CreateCancelled;

impl std::fmt::Display for CreateCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VM create cancelled: session closed")
    }
}

impl std::error::Error for CreateCancelled {}

struct VmEntry {
    vm: Arc<VmInstance>,
    refs: usize,
}

pub struct VmManager {
    config: Arc<Config>,
    fabric: Arc<NetworkFabric>,
    pool: IpPool,
    monitor_bin: PathBuf,
    kernel: PathBuf,
    vms: RwLock<HashMap<String, VmEntry>>,
}

impl VmManager {
    /// Build the manager: set up the IP pool and write the bootstrap
    /// artifacts (monitor executable, kernel image) into the data directory
    /// once; every VM reuses them by path.
    pub fn new(
        config: Arc<Config>,
        fabric: Arc<NetworkFabric>,
        monitor: &[u8],
        kernel: &[u8],
    ) -> Result<Self> {
        let pool = IpPool::new(config.vm_cidr).context("create IP pool")?;

        let monitor_bin = config.data_dir.join("firecracker");
        write_artifact(&monitor_bin, monitor, 0o755)?;
        let kernel_path = config.data_dir.join("vmlinux");
        write_artifact(&kernel_path, kernel, 0o644)?;

        Ok(Self {
            config,
            fabric,
            pool,
            monitor_bin,
            kernel: kernel_path,
            vms: RwLock::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &IpPool {
        &self.pool
    }

    /// Bind to the VM for `id`, creating it if needed. The writer lock is
    /// held across the whole create-and-insert sequence, so concurrent
    /// calls for the same id observe exactly one create.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<VmInstance>> {
        self.get_or_create_with_cancel(id, std::future::pending::<()>())
            .await
    }

    /// Like [`get_or_create`](Self::get_or_create), abandoning the work when
    /// `cancel` completes first. Cancellation is honored both while waiting
    /// for the manager lock and during the create itself; a cancelled create
    /// has its partial resources rolled back before this returns.
    pub async fn get_or_create_with_cancel(
        &self,
        id: &str,
        cancel: impl std::future::Future<Output = ()> + Send,
    ) -> Result<Arc<VmInstance>> {
        validate_vm_id(id)?;
        tokio::pin!(cancel);

        let mut vms = tokio::select! {
            guard = self.vms.write() => guard,
            _ = &mut cancel => return Err(CreateCancelled.into()),
        };
        if let Some(entry) = vms.get_mut(id) {
            entry.refs += 1;
            debug!(vm = %id, refs = entry.refs, "session attached to running VM");
            return Ok(entry.vm.clone());
        }

        let cap = self.config.max_concurrent_vms;
        if cap > 0 && vms.len() >= cap {
            return Err(CapacityError { limit: cap }.into());
        }

        let vm = tokio::select! {
            res = self.create_instance(id) => res?,
            // Dropping the create future triggers its rollback guard.
            _ = &mut cancel => return Err(CreateCancelled.into()),
        };
        vms.insert(
            id.to_string(),
            VmEntry {
                vm: vm.clone(),
                refs: 1,
            },
        );
        info!(vm = %id, ip = %vm.ip, active = vms.len(), "VM created");
        Ok(vm)
    }

    /// Look up a VM without taking a reference.
    pub async fn get(&self, id: &str) -> Option<Arc<VmInstance>> {
        self.vms.read().await.get(id).map(|e| e.vm.clone())
    }

    /// Drop one reference; the VM is torn down when the last one goes.
    pub async fn release(&self, id: &str) -> Result<()> {
        let mut vms = self.vms.write().await;
        let Some(entry) = vms.get_mut(id) else {
            bail!("VM '{id}' not found");
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            debug!(vm = %id, refs = entry.refs, "session detached");
            return Ok(());
        }

        let entry = vms.remove(id).expect("entry present");
        info!(vm = %id, "last session detached, destroying VM");
        self.teardown(&entry.vm).await;
        Ok(())
    }

    /// Forcibly tear down a VM regardless of how many sessions hold it.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let Some(entry) = self.vms.write().await.remove(id) else {
            bail!("VM '{id}' not found");
        };
        self.teardown(&entry.vm).await;
        Ok(())
    }

    /// Tear down every VM. Used at process shutdown.
    pub async fn destroy_all(&self) {
        let entries: Vec<(String, VmEntry)> = self.vms.write().await.drain().collect();
        for (id, entry) in entries {
            info!(vm = %id, "destroying VM at shutdown");
            self.teardown(&entry.vm).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.vms.read().await.len()
    }

    fn vm_dir(&self, id: &str) -> PathBuf {
        self.config.data_dir.join(format!("vm-{id}"))
    }

    /// Provision one instance. Every step arms the [`Rollback`] guard, so
    /// the partial resources are returned both on an error and when the
    /// future is dropped by a cancelled caller.
    async fn create_instance(&self, id: &str) -> Result<Arc<VmInstance>> {
        let ip = self.pool.allocate().context("allocate VM IP")?;
        let dir = self.vm_dir(id);
        let mut rollback = Rollback {
            manager: self,
            ip,
            dir: dir.clone(),
            tap: None,
            vm: None,
            committed: false,
        };

        fs::create_dir_all(&dir)
            .with_context(|| format!("create VM scratch directory {}", dir.display()))?;
        let rootfs = dir.join("rootfs.img");
        copy_rootfs(&self.config.rootfs, &rootfs)?;

        let index = fabric::host_index(self.config.vm_cidr, ip);
        let tap = fabric::tap_name(index);
        self.fabric.create_tap(&tap)?;
        rollback.tap = Some(tap.clone());

        let vm = Arc::new(VmInstance::new(InstanceConfig {
            id: id.to_string(),
            ip,
            gateway: self.pool.gateway(),
            netmask: self.pool.netmask(),
            mac: fabric::mac_address(index),
            tap,
            vcpus: self.config.vm_cpus,
            memory_mib: self.config.vm_memory,
            kernel: self.kernel.clone(),
            monitor_bin: self.monitor_bin.clone(),
            dir,
            rootfs,
        }));
        rollback.vm = Some(vm.clone());

        vm.start().await?;

        rollback.committed = true;
        Ok(vm)
    }

    async fn teardown(&self, vm: &VmInstance) {
        if let Err(e) = vm.stop().await {
            warn!(vm = %vm.id, error = %e, "error stopping VM");
        }
        self.fabric.delete_tap(vm.tap());
        self.pool.release(vm.ip);
        // Reclaim the rootfs copy; console.out stays behind for post-mortem.
        let _ = fs::remove_file(vm.rootfs());
    }
}

/// Undoes partial provisioning on drop unless `committed`. Drop-based so
/// the cleanup also runs when an in-flight create future is abandoned by a
/// cancelled session, not only on error returns.
struct Rollback<'a> {
    manager: &'a VmManager,
    ip: Ipv4Addr,
    dir: PathBuf,
    tap: Option<String>,
    vm: Option<Arc<VmInstance>>,
    committed: bool,
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        debug!(ip = %self.ip, dir = %self.dir.display(), "rolling back partial VM create");
        if let Some(vm) = &self.vm {
            vm.kill_monitor();
        }
        if let Some(tap) = &self.tap {
            self.manager.fabric.delete_tap(tap);
        }
        let _ = fs::remove_dir_all(&self.dir);
        self.manager.pool.release(self.ip);
    }
}

/// VM ids come straight from the SSH username and end up in filesystem
/// paths and interface config, so the charset is tight.
pub fn validate_vm_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("VM id cannot be empty");
    }
    if id.len() > 48 {
        bail!("VM id must be 48 characters or fewer");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("VM id may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}

fn write_artifact(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

/// Copy the shared rootfs template into the VM's scratch directory.
/// `cp --sparse=always` keeps holes in the image sparse.
fn copy_rootfs(template: &Path, dst: &Path) -> Result<()> {
    let status = std::process::Command::new("cp")
        .arg("--sparse=always")
        .arg(template)
        .arg(dst)
        .status()
        .context("spawn cp")?;
    if !status.success() {
        bail!(
            "copy rootfs template {} to {} failed",
            template.display(),
            dst.display()
        );
    }
    fs::set_permissions(dst, Permissions::from_mode(0o644)).context("chmod rootfs copy")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BRIDGE_NAME;

    fn test_manager(cap: usize) -> (tempfile::TempDir, VmManager) {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs.ext4");
        fs::write(&rootfs, b"fake rootfs content").unwrap();

        let config = Arc::new(
            Config::new(
                2222,
                None,
                "192.168.100.0/28",
                128,
                1,
                cap,
                dir.path().join("data"),
                rootfs,
                false,
            )
            .unwrap(),
        );
        let fabric = Arc::new(NetworkFabric::new(
            BRIDGE_NAME,
            config.vm_cidr,
            "192.168.100.1".parse().unwrap(),
        ));
        let manager = VmManager::new(
            config,
            fabric,
            b"fake firecracker binary",
            b"fake vmlinux image",
        )
        .unwrap();
        (dir, manager)
    }

    fn dummy_entry(manager: &VmManager, id: &str, refs: usize) -> VmEntry {
        let dir = manager.vm_dir(id);
        fs::create_dir_all(&dir).unwrap();
        let vm = Arc::new(VmInstance::new(InstanceConfig {
            id: id.to_string(),
            ip: "192.168.100.2".parse().unwrap(),
            gateway: "192.168.100.1".parse().unwrap(),
            netmask: "255.255.255.240".parse().unwrap(),
            mac: "02:FC:00:00:00:02".to_string(),
            tap: "sshvm-tap-2".to_string(),
            vcpus: 1,
            memory_mib: 128,
            kernel: manager.kernel.clone(),
            monitor_bin: manager.monitor_bin.clone(),
            dir: dir.clone(),
            rootfs: dir.join("rootfs.img"),
        }));
        VmEntry { vm, refs }
    }

    #[test]
    fn test_validate_vm_id() {
        assert!(validate_vm_id("").is_err());
        assert!(validate_vm_id(&"a".repeat(49)).is_err());
        assert!(validate_vm_id(&"a".repeat(48)).is_ok());
        assert!(validate_vm_id("a/b").is_err());
        assert!(validate_vm_id("user-123").is_ok());
        assert!(validate_vm_id("vm-test_01").is_ok());
    }

    #[test]
    fn test_new_materializes_artifacts() {
        let (dir, _manager) = test_manager(16);
        let data = dir.path().join("data");

        let monitor = fs::metadata(data.join("firecracker")).unwrap();
        assert_eq!(monitor.permissions().mode() & 0o777, 0o755);

        let kernel = fs::metadata(data.join("vmlinux")).unwrap();
        assert_eq!(kernel.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_new_rejects_invalid_cidr_pool() {
        // A /31 parses but has no allocatable hosts, so the pool must fail.
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs.ext4");
        fs::write(&rootfs, b"x").unwrap();
        // Bypass Config::new's own CIDR check to exercise the pool error.
        let mut config = Config::new(
            2222,
            None,
            "192.168.100.0/28",
            128,
            1,
            16,
            dir.path().join("data"),
            rootfs,
            false,
        )
        .unwrap();
        config.vm_cidr = "192.168.100.0/31".parse().unwrap();
        let config = Arc::new(config);
        let fabric = Arc::new(NetworkFabric::new(
            BRIDGE_NAME,
            config.vm_cidr,
            "192.168.100.1".parse().unwrap(),
        ));
        assert!(VmManager::new(config, fabric, b"fc", b"kernel").is_err());
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back() {
        // Provisioning cannot succeed here: there is no bridge and the
        // monitor blob is not a real executable. Whatever step fails first,
        // the partial resources must all be returned.
        let (dir, manager) = test_manager(16);
        let free_before = manager.pool().available();

        let err = manager.get_or_create("carol").await;
        assert!(err.is_err());

        assert!(!dir.path().join("data").join("vm-carol").exists());
        assert_eq!(manager.pool().available(), free_before);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_miss_and_hit() {
        let (_dir, manager) = test_manager(16);
        assert!(manager.get("alice").await.is_none());

        let entry = dummy_entry(&manager, "alice", 1);
        manager.vms.write().await.insert("alice".into(), entry);

        let vm = manager.get("alice").await.unwrap();
        assert_eq!(vm.id, "alice");
        // Get does not take a reference.
        assert_eq!(manager.vms.read().await.get("alice").unwrap().refs, 1);
    }

    #[tokio::test]
    async fn test_capacity_cap() {
        let (_dir, manager) = test_manager(2);
        for id in ["alice", "bob"] {
            let entry = dummy_entry(&manager, id, 1);
            manager.vms.write().await.insert(id.into(), entry);
        }

        // A new id is refused with the typed capacity error.
        let err = manager.get_or_create("carol").await.unwrap_err();
        let cap = err.downcast_ref::<CapacityError>().expect("capacity error");
        assert_eq!(cap.limit, 2);

        // An existing id still attaches and bumps the refcount.
        let vm = manager.get_or_create("alice").await.unwrap();
        assert_eq!(vm.id, "alice");
        assert_eq!(manager.vms.read().await.get("alice").unwrap().refs, 2);
        assert_eq!(manager.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_release_tears_down_at_zero() {
        let (_dir, manager) = test_manager(16);
        let entry = dummy_entry(&manager, "alice", 2);
        manager.vms.write().await.insert("alice".into(), entry);

        manager.release("alice").await.unwrap();
        assert_eq!(manager.active_count().await, 1);
        assert_eq!(manager.vms.read().await.get("alice").unwrap().refs, 1);

        manager.release("alice").await.unwrap();
        assert_eq!(manager.active_count().await, 0);

        assert!(manager.release("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_ignores_refcount() {
        let (_dir, manager) = test_manager(16);
        let entry = dummy_entry(&manager, "alice", 3);
        manager.vms.write().await.insert("alice".into(), entry);

        manager.destroy("alice").await.unwrap();
        assert_eq!(manager.active_count().await, 0);
        assert!(manager.destroy("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_get_or_create_rejects_bad_id() {
        let (_dir, manager) = test_manager(16);
        assert!(manager.get_or_create("a/b").await.is_err());
        assert!(manager.get_or_create("").await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_lock() {
        let (_dir, manager) = test_manager(16);
        // Another session's create holds the writer; a ready cancel wins.
        let guard = manager.vms.write().await;
        let err = manager
            .get_or_create_with_cancel("alice", std::future::ready(()))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<CreateCancelled>().is_some());
        drop(guard);
        assert_eq!(manager.active_count().await, 0);
    }

    #[test]
    fn test_rollback_guard_returns_resources() {
        let (dir, manager) = test_manager(16);
        let free_before = manager.pool().available();

        let ip = manager.pool().allocate().unwrap();
        let vm_dir = manager.vm_dir("alice");
        fs::create_dir_all(&vm_dir).unwrap();
        drop(Rollback {
            manager: &manager,
            ip,
            dir: vm_dir.clone(),
            tap: None,
            vm: None,
            committed: false,
        });

        assert!(!vm_dir.exists());
        assert!(!manager.pool().is_allocated(ip));
        assert_eq!(manager.pool().available(), free_before);
        drop(dir);
    }

    #[test]
    fn test_committed_rollback_guard_keeps_resources() {
        let (_dir, manager) = test_manager(16);
        let ip = manager.pool().allocate().unwrap();
        let vm_dir = manager.vm_dir("alice");
        fs::create_dir_all(&vm_dir).unwrap();
        drop(Rollback {
            manager: &manager,
            ip,
            dir: vm_dir.clone(),
            tap: None,
            vm: None,
            committed: true,
        });

        assert!(vm_dir.exists());
        assert!(manager.pool().is_allocated(ip));
    }
}
