//! Unix domain socket setup for the control channel.
//!
//! Socket path default: `{temp_dir}/ctlroute/control.sock`

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

/// Default location of the control socket.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("ctlroute").join("control.sock")
}

/// Removes the socket file when dropped.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed control socket");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove control socket");
        }
    }
}

/// Bind the control socket, creating its directory and replacing a stale
/// socket file.
///
/// Fails with `AddrInUse` if another process is still accepting on `path`.
/// Must be called from within a tokio runtime.
pub fn bind_socket(path: &Path) -> io::Result<(UnixListener, SocketGuard)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is served by another process", path.display()),
            ));
        }
        tracing::debug!(path = %path.display(), "Removing stale control socket");
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    tracing::trace!(path = %path.display(), "Bound control socket");

    Ok((
        listener,
        SocketGuard {
            path: path.to_path_buf(),
        },
    ))
}
