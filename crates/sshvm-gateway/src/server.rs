//! russh server surface: per-connection handler and the session pipeline
//! that binds a user to a VM and drives it to a proxied shell.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use sshvm_core::manager::{CapacityError, CreateCancelled};

use crate::banner::{self, send};
use crate::proxy::{self, ProxyInput, PtyRequest};
use crate::SharedState;

/// The server::Handle type, used to write back to the client from tasks.
pub type ServerHandle = russh::server::Handle;

/// How long the guest gets to bring up its SSH service.
const READY_DEADLINE: Duration = Duration::from_secs(15);
const READY_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const READY_PERIOD: Duration = Duration::from_millis(200);

/// How many recent logins the banner shows.
const RECENT_USERS: usize = 10;

// ── Server factory ────────────────────────────────────────────────────────────

pub struct SshFrontDoor {
    pub state: Arc<SharedState>,
}

#[async_trait::async_trait]
impl russh::server::Server for SshFrontDoor {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ConnectionHandler {
        ConnectionHandler::new(self.state.clone(), peer_addr)
    }
}

// ── Connection handler ────────────────────────────────────────────────────────

pub struct ConnectionHandler {
    state: Arc<SharedState>,
    peer_addr: Option<SocketAddr>,

    /// SSH username, used verbatim (after validation) as the VM id.
    username: String,

    /// Set in channel_open_session.
    handle: Option<ServerHandle>,
    channel_id: Option<ChannelId>,

    /// Environment collected before the shell request.
    env: Vec<(String, String)>,
    /// Stored between pty_request and shell_request.
    pty: Option<PtyRequest>,

    /// Feeds stdin and window changes into the session pipeline.
    proxy_tx: Option<mpsc::Sender<ProxyInput>>,
    launched: bool,
}

impl ConnectionHandler {
    fn new(state: Arc<SharedState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            username: String::new(),
            handle: None,
            channel_id: None,
            env: Vec::new(),
            pty: None,
            proxy_tx: None,
            launched: false,
        }
    }
}

#[async_trait::async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    // This is an open demonstrator: both handlers accept unconditionally.

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.username = user.to_string();
        info!(peer = ?self.peer_addr, %user, method = "publickey", "accepted connection");
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        self.username = user.to_string();
        info!(peer = ?self.peer_addr, %user, method = "password", "accepted connection");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.handle = Some(session.handle());
        self.channel_id = Some(channel.id());
        debug!(peer = ?self.peer_addr, channel = ?channel.id(), "session opened");
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        self.env
            .push((variable_name.to_string(), variable_value.to_string()));
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        self.pty = Some(PtyRequest {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        });
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        if self.launched {
            return Ok(());
        }
        let (Some(handle), Some(id)) = (self.handle.clone(), self.channel_id) else {
            return Ok(());
        };
        self.launched = true;

        let (tx, rx) = mpsc::channel(256);
        self.proxy_tx = Some(tx);
        tokio::spawn(run_session(
            self.state.clone(),
            handle,
            id,
            self.username.clone(),
            std::mem::take(&mut self.env),
            self.pty.clone(),
            rx,
        ));
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Only interactive shells are wired through to the guest.
        session.channel_success(channel);
        session.data(
            channel,
            CryptoVec::from(b"Interactive sessions only: exec is not supported.\r\n".to_vec()),
        );
        session.exit_status_request(channel, 1);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = &self.proxy_tx {
            // Awaiting gives natural backpressure for bulk pastes; a closed
            // receiver just means the pipeline already ended.
            let _ = tx.send(ProxyInput::Data(data.to_vec())).await;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = &self.proxy_tx {
            let _ = tx
                .send(ProxyInput::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                })
                .await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.proxy_tx = None;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.proxy_tx = None;
        debug!(peer = ?self.peer_addr, "channel closed");
        Ok(())
    }
}

// ── Session pipeline ──────────────────────────────────────────────────────────

/// Everything that happens between "shell requested" and "session over":
/// banner, VM binding, progress bar, readiness probe, proxy, release.
/// The one VM reference this task may acquire is released on every exit
/// path, exactly once.
async fn run_session(
    state: Arc<SharedState>,
    handle: ServerHandle,
    id: ChannelId,
    username: String,
    env: Vec<(String, String)>,
    pty: Option<PtyRequest>,
    mut input: mpsc::Receiver<ProxyInput>,
) {
    let _guard = state.sessions.begin();

    let previous_login = state.stats.record_connection(&username);
    let fresh_vm = state.manager.get(&username).await.is_none();
    let recent = state.stats.recent_users(&username, RECENT_USERS);
    let _ = send(
        &handle,
        id,
        banner::welcome_banner(&username, previous_login, &recent, fresh_vm),
    )
    .await;

    let (ready_tx, ready_rx) = oneshot::channel();
    let (failed_tx, failed_rx) = oneshot::channel();
    let progress = tokio::spawn(banner::render_progress(
        handle.clone(),
        id,
        ready_rx,
        failed_rx,
    ));

    // The create is abandoned (and its partial state rolled back) as soon
    // as the client goes away.
    let created = state
        .manager
        .get_or_create_with_cancel(&username, session_closed(&mut input))
        .await;
    let vm = match created {
        Ok(vm) => vm,
        Err(e) => {
            let _ = failed_tx.send(());
            let _ = progress.await;
            if e.downcast_ref::<CreateCancelled>().is_some() {
                info!(user = %username, "session closed during VM create");
            } else if let Some(cap) = e.downcast_ref::<CapacityError>() {
                error!(user = %username, limit = cap.limit, "server at capacity");
                let _ = send(
                    &handle,
                    id,
                    format!(
                        "\r\n\x1b[31mServer is at capacity! Maximum of {} concurrent VMs are allowed.\x1b[0m\r\n\
                         \x1b[31mPlease try again later when some VMs are freed up.\x1b[0m\r\n",
                        cap.limit
                    ),
                )
                .await;
            } else {
                error!(user = %username, error = %e, "failed to provision VM");
                let _ = send(
                    &handle,
                    id,
                    format!("\r\n\x1b[31mFailed to provision VM: {e:#}\x1b[0m\r\n"),
                )
                .await;
            }
            finish(&handle, id, 1).await;
            return;
        }
    };

    // From here this session holds exactly one reference on the VM.
    let vm_addr = vm.ssh_addr();
    match wait_for_guest_ssh(&vm_addr, &mut input).await {
        Ok(()) => {
            let _ = ready_tx.send(());
            let _ = progress.await;
        }
        Err(e) => {
            let _ = failed_tx.send(());
            let _ = progress.await;
            error!(user = %username, vm = %vm.id, error = %e, "guest SSH never became ready");
            let _ = send(
                &handle,
                id,
                format!("\r\n\x1b[31mConnection to VM failed: {e:#}\x1b[0m\r\n"),
            )
            .await;
            release(&state, &username).await;
            finish(&handle, id, 1).await;
            return;
        }
    }

    info!(user = %username, vm = %vm.id, ip = %vm.ip, "proxying session to guest");
    if let Err(e) = proxy::run(handle.clone(), id, &vm_addr, &env, pty.as_ref(), &mut input).await {
        error!(user = %username, error = %e, "SSH proxy error");
        let _ = send(
            &handle,
            id,
            format!("\r\n\x1b[31mConnection to VM failed: {e:#}\x1b[0m\r\n"),
        )
        .await;
    }

    release(&state, &username).await;
    finish(&handle, id, 0).await;
    info!(user = %username, "session ended");
}

async fn release(state: &SharedState, id: &str) {
    if let Err(e) = state.manager.release(id).await {
        error!(vm = %id, error = %e, "error releasing VM");
    }
}

async fn finish(handle: &ServerHandle, id: ChannelId, code: u32) {
    let _ = handle.exit_status_request(id, code).await;
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}

/// Resolves once the outer session is gone (every sender dropped).
/// Keystrokes typed in the meantime are discarded, as during boot.
async fn session_closed(input: &mut mpsc::Receiver<ProxyInput>) {
    while input.recv().await.is_some() {}
}

/// Poll the guest SSH port until it accepts a TCP connection. A closed
/// input channel means the client went away, which cancels the wait.
async fn wait_for_guest_ssh(addr: &str, input: &mut mpsc::Receiver<ProxyInput>) -> Result<()> {
    let deadline = tokio::time::Instant::now() + READY_DEADLINE;
    let mut ticker = tokio::time::interval(READY_PERIOD);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tokio::time::Instant::now() >= deadline {
                    bail!("timed out waiting for guest SSH at {addr}");
                }
                if let Ok(Ok(conn)) =
                    tokio::time::timeout(READY_DIAL_TIMEOUT, TcpStream::connect(addr)).await
                {
                    drop(conn);
                    debug!(%addr, "guest SSH is ready");
                    return Ok(());
                }
            }
            event = input.recv() => {
                // Keystrokes typed during boot are dropped; a closed channel
                // means the client disconnected.
                if event.is_none() {
                    bail!("session closed during provisioning");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_guest_ssh_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (_tx, mut rx) = mpsc::channel::<ProxyInput>(1);
        wait_for_guest_ssh(&addr, &mut rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_guest_ssh_cancelled_on_disconnect() {
        // Nothing listens on this address; the probe keeps failing until the
        // input side is dropped.
        let (tx, mut rx) = mpsc::channel::<ProxyInput>(1);
        drop(tx);
        let err = wait_for_guest_ssh("127.0.0.1:1", &mut rx).await.unwrap_err();
        assert!(err.to_string().contains("session closed"));
    }
}
