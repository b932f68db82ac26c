//! Control socket for talking to a running supervisor.
//!
//! One-shot CLI subcommands connect to a Unix stream socket, write a
//! single JSON-encoded command line, and read back a single response
//! line. On the supervisor side each accepted connection is a producer:
//! it enqueues the request on the event channel together with a reply
//! channel and never touches the registry itself.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::Event;

/// Commands accepted over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Switch to another runlevel
    SwitchRunlevel { level: u8 },
    /// Start a service by name
    StartService { name: String },
    /// Stop a service by name
    StopService { name: String },
    /// Report whether a service is running
    ServiceStatus { name: String },
    /// Liveness probe
    Ping,
}

/// Responses written back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command succeeded
    Ok { message: String },
    /// Command failed
    Error { message: String },
    /// Service status report
    Status {
        name: String,
        state: String,
        pid: Option<u32>,
    },
    /// Ping reply
    Pong,
}

/// A decoded command plus the channel its response travels back on.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<ControlResponse>,
}

/// Listening side, owned by the supervisor process.
pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the control socket, replacing any stale socket file.
    pub fn bind(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o660);
            std::fs::set_permissions(&socket_path, permissions)?;
        }

        info!(path = %socket_path.display(), "control socket listening");
        Ok(Self {
            socket_path,
            listener,
        })
    }

    /// Accept connections forever, forwarding each request to the
    /// supervisor's event queue.
    pub async fn serve(self, events: mpsc::Sender<Event>) {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    continue;
                }
            };

            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, events).await {
                    debug!(error = %e, "control connection failed");
                }
            });
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "failed to remove control socket");
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, events: mpsc::Sender<Event>) -> Result<()> {
    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let command: ControlCommand = serde_json::from_str(line.trim())?;
    debug!(command = ?command, "received control command");

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = ControlRequest {
        command,
        reply: reply_tx,
    };

    let response = if events.send(Event::Control(request)).await.is_ok() {
        reply_rx.await.unwrap_or(ControlResponse::Error {
            message: "supervisor is shutting down".to_string(),
        })
    } else {
        ControlResponse::Error {
            message: "supervisor is not accepting requests".to_string(),
        }
    };

    let json = serde_json::to_string(&response)?;
    stream.write_all(json.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}

/// Client side, used by the one-shot CLI subcommands.
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send one command and wait for the response.
    pub async fn send(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|_| {
            Error::ControlUnavailable(self.socket_path.display().to_string())
        })?;

        let json = serde_json::to_string(&command)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(line.trim())?)
    }
}
