//! `sshvm-gateway` — the SSH surface of sshvm.
//!
//! Accepts any credential, binds each session to a microVM keyed by the
//! username via [`sshvm_core::VmManager`], renders the boot progress bar,
//! and hands the session over to the transparent SSH-in-SSH proxy.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::Server as _;
use russh_keys::key::KeyPair;
use tokio::sync::Notify;
use tracing::info;

pub mod banner;
pub mod proxy;
pub mod server;

use sshvm_core::{Config, UserStats, VmManager};

/// Shared by every connection handler.
pub struct SharedState {
    pub config: Arc<Config>,
    pub manager: Arc<VmManager>,
    pub stats: Arc<UserStats>,
    pub sessions: SessionTracker,
}

/// Start the SSH front door. Runs until the future is dropped (which stops
/// accepting; live sessions keep running on their own tasks).
pub async fn serve(state: Arc<SharedState>, host_key: KeyPair) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let russh_config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_millis(300),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });

    let mut srv = server::SshFrontDoor { state };
    info!(%addr, "SSH front door listening");
    srv.run_on_address(russh_config, addr)
        .await
        .context("SSH server error")
}

// ── Host key ──────────────────────────────────────────────────────────────────

/// Load the Ed25519 host key, generating and persisting one (PEM, 0600)
/// when the file does not exist yet.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("load host key from {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    let key = KeyPair::generate_ed25519().context("generate ed25519 host key")?;
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("encode host key")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    write_private(path, &pem)?;
    info!(path = %path.display(), "generated new SSH host key");
    Ok(key)
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

// ── Session tracker ───────────────────────────────────────────────────────────

/// Counts live session pipelines so shutdown can grant them a bounded drain
/// window before tearing the VMs down.
#[derive(Clone, Default)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

impl SessionTracker {
    pub fn begin(&self) -> SessionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolve once no session pipeline is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct SessionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_generated_with_tight_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_ed25519_key");

        load_or_generate_host_key(&path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let pem = std::fs::read_to_string(&path).unwrap();
        assert!(pem.starts_with("-----BEGIN "));

        // A second call loads the persisted key instead of regenerating.
        load_or_generate_host_key(&path).unwrap();
    }

    #[test]
    fn test_session_tracker_counts() {
        let tracker = SessionTracker::default();
        assert_eq!(tracker.active(), 0);
        let a = tracker.begin();
        let b = tracker.begin();
        assert_eq!(tracker.active(), 2);
        drop(a);
        assert_eq!(tracker.active(), 1);
        drop(b);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_resolves() {
        let tracker = SessionTracker::default();
        // No sessions: resolves immediately.
        tracker.wait_idle().await;

        let guard = tracker.begin();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
