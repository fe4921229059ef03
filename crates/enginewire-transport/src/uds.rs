use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// Mode applied to every socket file we create.
pub const SOCKET_MODE: u32 = 0o600;

/// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on the BSDs and macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Where the socket for a pipe name lives.
///
/// `$XDG_RUNTIME_DIR` when it is set and exists, otherwise the temp directory.
pub fn socket_path(name: &str) -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir);
    base.join(format!("enginewire-{name}.sock"))
}

/// A listening Unix domain socket that removes its file on drop.
pub struct UdsListener {
    listener: UnixListener,
    path: PathBuf,
    identity: (u64, u64),
}

impl UdsListener {
    /// Bind the socket for a pipe name under the runtime directory.
    pub fn bind(name: &str) -> Result<Self> {
        Self::bind_path(socket_path(name))
    }

    /// Bind at an explicit path.
    ///
    /// An existing socket at `path` is treated as stale and replaced; any
    /// other kind of file is left alone and the bind fails.
    pub fn bind_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let endpoint = Endpoint::Pipe {
            name: path.display().to_string(),
        };
        let bind_err = |source| TransportError::Bind {
            endpoint: endpoint.clone(),
            source,
        };

        let len = path.as_os_str().len();
        if len >= MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: MAX_PATH_LEN,
            });
        }

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");
        Ok(Self {
            listener,
            path,
            identity: (metadata.dev(), metadata.ino()),
        })
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, _) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted unix connection");
        Ok(IpcStream::from_unix(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn connect(name: &str) -> std::io::Result<IpcStream> {
    let stream = UnixStream::connect(socket_path(name))?;
    Ok(IpcStream::from_unix(stream))
}

impl Drop for UdsListener {
    fn drop(&mut self) {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return;
        };
        if metadata.file_type().is_socket() && (metadata.dev(), metadata.ino()) == self.identity {
            debug!(path = ?self.path, "removing socket file");
            let _ = std::fs::remove_file(&self.path);
        } else {
            debug!(path = ?self.path, "socket path was replaced; leaving it");
        }
    }
}
