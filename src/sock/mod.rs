// src/sock/mod.rs

//! Per-run control socket.
//!
//! Each running agent serves a tiny HTTP/1.1 endpoint on a Unix stream
//! socket whose path is derived from the DAG location:
//!
//! - `GET /status` → JSON status snapshot (`status` forced to running)
//! - `POST /stop`  → `"OK"`, then an asynchronous graceful stop
//! - anything else → `404 Not found`
//!
//! The server owns the socket file and removes it on drop.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::{CrondagError, Result};
use crate::history::model::Status;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// What the agent exposes to the socket server.
pub trait SocketHandler: Send + Sync + 'static {
    /// JSON status snapshot for `GET /status`.
    fn status_json(&self) -> Result<String>;

    /// Begin an asynchronous graceful stop (`POST /stop`).
    fn request_stop(&self);
}

/// Control socket server for one run.
pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketServer {
    /// Bind the socket, replacing a stale file left by a dead agent.
    ///
    /// If something is actually listening on the path, binding fails: that
    /// is the same DAG already running.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(_) => {
                    return Err(CrondagError::SocketBind {
                        path: path.display().to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::AddrInUse,
                            "socket is in use by a live agent",
                        ),
                    });
                }
                Err(_) => {
                    debug!(path = %path.display(), "removing stale control socket");
                    let _ = fs::remove_file(path);
                }
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| CrondagError::SocketBind {
            path: path.display().to_string(),
            source: e,
        })?;

        info!(path = %path.display(), "control socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn serve(
        &self,
        handler: Arc<dyn SocketHandler>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(path = %self.path.display(), "control socket shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    debug!(error = %e, "control socket connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "control socket accept failed");
                        }
                    }
                }
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

async fn handle_connection(mut stream: UnixStream, handler: Arc<dyn SocketHandler>) -> Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain headers; the protocol has no request bodies.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    debug!(method, path, "control socket request");

    match (method, path.trim_end_matches('/')) {
        ("GET", "/status") => match handler.status_json() {
            Ok(body) => {
                write_response(&mut write_half, 200, "OK", "application/json", &body).await?
            }
            Err(e) => {
                write_response(
                    &mut write_half,
                    500,
                    "Internal Server Error",
                    "text/plain",
                    &e.to_string(),
                )
                .await?
            }
        },
        ("POST", "/stop") => {
            write_response(&mut write_half, 200, "OK", "text/plain", "OK").await?;
            handler.request_stop();
        }
        _ => {
            write_response(&mut write_half, 404, "Not Found", "text/plain", "Not found").await?;
        }
    }

    write_half.shutdown().await?;
    Ok(())
}

async fn write_response(
    stream: &mut (impl AsyncWriteExt + Unpin),
    code: u16,
    reason: &str,
    content_type: &str,
    body: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Blocking client for another process's control socket.
///
/// Used from the CLI and the cron loop; call from `spawn_blocking` when on
/// the async runtime.
pub struct SocketClient {
    path: PathBuf,
}

impl SocketClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Whether a live agent is listening.
    pub fn is_alive(&self) -> bool {
        std::os::unix::net::UnixStream::connect(&self.path).is_ok()
    }

    /// Fetch the live status snapshot.
    pub fn get_status(&self) -> Result<Status> {
        let body = self.request("GET", "/status")?;
        Status::from_json(&body)
    }

    /// Ask the agent to stop; returns as soon as the request is accepted.
    pub fn post_stop(&self) -> Result<()> {
        self.request("POST", "/stop").map(|_| ())
    }

    fn request(&self, method: &str, path: &str) -> Result<String> {
        let mut stream = std::os::unix::net::UnixStream::connect(&self.path)?;
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

        write!(
            stream,
            "{method} {path} HTTP/1.1\r\nhost: crondag\r\nconnection: close\r\n\r\n"
        )?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        let (head, body) = response
            .split_once("\r\n\r\n")
            .ok_or_else(|| anyhow::anyhow!("malformed control socket response"))?;

        let status_line = head.lines().next().unwrap_or_default();
        let code: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);

        if !(200..300).contains(&code) {
            return Err(CrondagError::Other(anyhow::anyhow!(
                "control socket returned {code}: {body}"
            )));
        }

        Ok(body.to_string())
    }
}
