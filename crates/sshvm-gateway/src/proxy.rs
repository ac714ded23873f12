//! Transparent SSH-in-SSH proxy between an accepted session and a guest.
//!
//! The inner channel is owned by a single pump that multiplexes guest
//! output (`ChannelMsg` events) against input arriving from the outer
//! session over an mpsc, so window changes can be forwarded after the
//! shell has started.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::client;
use russh::{ChannelId, ChannelMsg, CryptoVec};
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::ServerHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Input flowing from the outer session into the proxy pump.
pub enum ProxyInput {
    Data(Vec<u8>),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
}

/// Pty parameters captured from the outer session, replayed on the inner one.
#[derive(Clone)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(russh::Pty, u32)>,
}

struct GuestClientHandler;

#[async_trait::async_trait]
impl client::Handler for GuestClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Guests sit on the private VM bridge and regenerate their host key
        // on every boot; there is nothing to pin.
        Ok(true)
    }
}

/// Dial the guest SSH service as `root` with empty credentials.
async fn dial(addr: &str) -> Result<client::Handle<GuestClientHandler>> {
    let config = Arc::new(client::Config::default());
    let mut session = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(config, addr, GuestClientHandler),
    )
    .await
    .map_err(|_| anyhow::anyhow!("timed out connecting to guest SSH at {addr}"))?
    .with_context(|| format!("connect to guest SSH at {addr}"))?;

    if session
        .authenticate_password("root", "")
        .await
        .context("password auth to guest")?
    {
        return Ok(session);
    }

    // Some guest sshd setups only offer keyboard-interactive; answer every
    // prompt with an empty string.
    let mut response = session
        .authenticate_keyboard_interactive_start("root", None)
        .await
        .context("keyboard-interactive auth to guest")?;
    loop {
        use client::KeyboardInteractiveAuthResponse::*;
        match response {
            Success => return Ok(session),
            Failure => bail!("guest SSH rejected root login"),
            InfoRequest { prompts, .. } => {
                let answers = vec![String::new(); prompts.len()];
                response = session
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .context("keyboard-interactive responses")?;
            }
        }
    }
}

/// Run the proxy until the guest session terminates or the outer session
/// goes away (`input` closed). Errors from the setup steps surface to the
/// caller, which prints them without killing the outer session.
pub async fn run(
    handle: ServerHandle,
    id: ChannelId,
    vm_addr: &str,
    env: &[(String, String)],
    pty: Option<&PtyRequest>,
    input: &mut mpsc::Receiver<ProxyInput>,
) -> Result<()> {
    let mut session = dial(vm_addr).await?;
    let mut channel = session
        .channel_open_session()
        .await
        .context("open session channel on guest")?;

    for (name, value) in env {
        // The guest sshd decides which variables it accepts.
        let _ = channel.set_env(false, name.as_str(), value.as_str()).await;
    }

    if let Some(pty) = pty {
        channel
            .request_pty(
                true,
                &pty.term,
                pty.col_width,
                pty.row_height,
                pty.pix_width,
                pty.pix_height,
                &pty.modes,
            )
            .await
            .context("pty request on guest")?;
    }

    channel
        .request_shell(true)
        .await
        .context("shell request on guest")?;

    loop {
        tokio::select! {
            msg = channel.wait() => {
                let Some(msg) = msg else { break };
                match msg {
                    ChannelMsg::Data { data } => {
                        if handle.data(id, CryptoVec::from(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::ExtendedData { data, ext } => {
                        if handle
                            .extended_data(id, ext, CryptoVec::from(data.to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        let _ = handle.exit_status_request(id, exit_status).await;
                    }
                    ChannelMsg::Eof => {
                        let _ = handle.eof(id).await;
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            event = input.recv() => {
                match event {
                    Some(ProxyInput::Data(bytes)) => {
                        if channel.data(&bytes[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(ProxyInput::WindowChange { col_width, row_height, pix_width, pix_height }) => {
                        let _ = channel
                            .window_change(col_width, row_height, pix_width, pix_height)
                            .await;
                    }
                    None => {
                        debug!("outer session closed, shutting down guest channel");
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
