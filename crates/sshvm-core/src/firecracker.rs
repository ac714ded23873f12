//! Minimal client for the Firecracker API served over a per-VM UNIX socket.
//!
//! The monitor speaks plain HTTP/1.1 with small JSON bodies, so a
//! hand-rolled request over a `UnixStream` is all that is needed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub struct MonitorApi {
    socket: PathBuf,
}

impl MonitorApi {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Wait for the monitor to create its API socket and accept connections.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.socket.exists() && UnixStream::connect(&self.socket).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "timed out waiting for monitor API socket {}",
                    self.socket.display()
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// PUT a JSON body and require a 2xx response.
    pub async fn put(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(body)?;
        let request = build_request("PUT", path, &payload);

        let mut stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("connect to monitor API {}", self.socket.display()))?;
        stream
            .write_all(request.as_bytes())
            .await
            .context("write monitor API request")?;

        let response = read_response_head(&mut stream).await?;
        let status = parse_status(&response)?;
        if !(200..300).contains(&status) {
            bail!("PUT {path} returned {status}: {}", response.trim_end());
        }
        Ok(())
    }
}

fn build_request(method: &str, path: &str, body: &str) -> String {
    format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

/// Read until the end of the response headers (or EOF). The monitor keeps
/// the connection alive, so reading to EOF would hang; the status line is
/// all we act on.
async fn read_response_head(stream: &mut UnixStream) -> Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("read monitor API response")?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
    }
    if buf.is_empty() {
        bail!("monitor API closed the connection without a response");
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_status(response: &str) -> Result<u16> {
    let status_line = response.lines().next().unwrap_or_default();
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .with_context(|| format!("malformed monitor API status line {status_line:?}"))
}
