//! Administrative command channel.
//!
//! A Unix stream socket speaking one command per line:
//!
//! ```text
//! exit   -> ok            (requests shutdown)
//! dump   -> {...}         (last published status, one JSON line)
//! other  -> error: ...
//! ```

use crate::error::{DaemonError, DaemonResult};
use rtsync_engine::StatusBoard;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop the daemon.
    Exit,
    /// Report engine status.
    Dump,
}

impl Command {
    /// Parses one request line.
    pub fn parse(line: &str) -> Result<Self, String> {
        match line.trim() {
            "exit" => Ok(Self::Exit),
            "dump" => Ok(Self::Dump),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command {other:?}")),
        }
    }
}

/// Shared state the command handlers act on.
#[derive(Debug, Clone)]
pub struct ControlContext {
    board: StatusBoard,
    shutdown: Arc<watch::Sender<()>>,
}

impl ControlContext {
    /// Creates a context over the status board and the shutdown signal.
    pub fn new(board: StatusBoard, shutdown: Arc<watch::Sender<()>>) -> Self {
        Self { board, shutdown }
    }

    /// Executes one request line and returns the reply line.
    pub fn handle_line(&self, line: &str) -> String {
        match Command::parse(line) {
            Ok(Command::Exit) => {
                info!("exit requested over control socket");
                self.shutdown.send_replace(());
                "ok".to_string()
            }
            Ok(Command::Dump) => {
                let view = self.board.read();
                serde_json::to_string(&*view).unwrap_or_else(|e| format!("error: {e}"))
            }
            Err(message) => format!("error: {message}"),
        }
    }
}

/// Binds the control socket, replacing a stale one left by a dead process.
pub fn bind(path: &Path) -> DaemonResult<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|source| DaemonError::ControlSocket {
            path: path.to_path_buf(),
            source,
        })?;
    }
    UnixListener::bind(path).map_err(|source| DaemonError::ControlSocket {
        path: path.to_path_buf(),
        source,
    })
}

/// Accepts control connections until shutdown is signalled.
pub async fn serve(listener: UnixListener, context: ControlContext) {
    let mut shutdown = context.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let context = context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session(stream, &context).await {
                            debug!(error = %e, "control session ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "control accept failed"),
            },
        }
    }
    debug!("control server stopped");
}

async fn session(stream: UnixStream, context: &ControlContext) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let mut reply = context.handle_line(&line);
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

/// Removes the socket file on drop.
#[derive(Debug)]
pub struct SocketGuard(pub PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
