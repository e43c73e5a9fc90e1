use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use super::connection;
use super::DirectoryHandle;

/// Binds the control socket, replacing a stale socket file left by an
/// earlier run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => bail!("Control socket {} is already in use", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(_) => {
            let metadata = std::fs::symlink_metadata(path)
                .with_context(|| format!("Failed to inspect {}", path.display()))?;
            if !metadata.file_type().is_socket() {
                bail!("{} exists and is not a socket", path.display());
            }
            tracing::info!("Removing stale control socket {}", path.display());
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
    tracing::info!("Control socket listening on {}", path.display());
    Ok(listener)
}

pub async fn run(listener: UnixListener, handle: DirectoryHandle, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tracing::debug!("Accepted control connection");
                        tokio::spawn(connection::serve(stream, handle.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept control connection: {}", e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Control listener shutting down");
                break;
            }
        }
    }
}
