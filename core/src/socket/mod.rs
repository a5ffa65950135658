//! Unix-domain socket IPC: one socket per process.
//!
//! The listener lives on its own task and only accepts; connections are
//! handed to the manager, which reads the request under a short deadline so
//! a stalled client cannot wedge the selector.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error};

use crate::Result;
use crate::events;

/// A bound socket plus its accept task.
#[derive(Debug)]
pub struct SocketServer {
    path: PathBuf,
    accept_task: tokio::task::JoinHandle<()>,
}

/// Binds `<socket_dir>/aw-man<pid>.sock` and feeds accepted connections to
/// the manager through `conns`.
pub fn serve(socket_dir: &Path, conns: flume::Sender<UnixStream>) -> Result<SocketServer> {
    let path = socket_dir.join(format!("aw-man{}.sock", std::process::id()));
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("unable to create socket {}", path.display()))?;
    debug!("listening on {}", path.display());

    let accept_task = tokio::spawn(async move {
        let mut shutdown = events::shutdown_waiter();
        loop {
            let conn = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                conn = listener.accept() => conn,
            };
            match conn {
                Ok((stream, _)) => {
                    if conns.send_async(stream).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!("socket accept error: {err}");
                    break;
                }
            }
        }
    });

    Ok(SocketServer { path, accept_task })
}

impl SocketServer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting and removes the socket file.
    pub fn close(self) {
        self.accept_task.abort();
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("error removing socket {}: {err}", self.path.display());
            }
        }
    }
}
