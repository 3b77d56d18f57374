// Device node
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs,
    io::{self, Read, Write},
    net::Shutdown,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::Arc,
    thread::{spawn, JoinHandle},
};

use log::{debug, info, warn};
use thiserror::Error as ThisError;

use crate::{device::GpioIrqDevice, gpio::GpioDevice, sync::CancelToken};

/// Largest write handed to the device in one call.
const WRITE_CHUNK: usize = 4096;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
/// Errors related to the device node
pub(crate) enum Error {
    #[error("Could not create device node {0:?}: {1}")]
    CreateFailed(PathBuf, io::Error),
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(io::Error),
}

/// Write endpoint of the test device, a Unix stream socket.
///
/// Every chunk a client sends is one write call. The reply is a line with
/// the number of bytes consumed, or a negative errno. Clients wait for the
/// reply before sending the next command, back to back data may be read as
/// one chunk.
pub(crate) struct DeviceNode {
    path: PathBuf,
    listener: UnixListener,
    cancel: CancelToken,
}

/// Stops a serving [`DeviceNode`] from another thread.
#[derive(Clone, Debug)]
pub(crate) struct NodeShutdown {
    path: PathBuf,
    cancel: CancelToken,
}

impl NodeShutdown {
    /// Interrupts blocked writers and makes `serve()` return.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();

        // Wake up the accept loop.
        if let Err(e) = UnixStream::connect(&self.path) {
            debug!("device node {:?} not reachable: {}", self.path, e);
        }
    }
}

// Connection thread and a handle on its stream, to close it on shutdown.
type Connection = (UnixStream, JoinHandle<()>);

impl DeviceNode {
    /// Binds the socket at `path`, replacing any leftover file from an
    /// earlier run.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => debug!("removed stale device node {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::CreateFailed(path.to_path_buf(), e)),
        }

        let listener =
            UnixListener::bind(path).map_err(|e| Error::CreateFailed(path.to_path_buf(), e))?;

        info!("device node {:?} created", path);

        Ok(DeviceNode {
            path: path.to_path_buf(),
            listener,
            cancel: CancelToken::new(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Token raised when the node shuts down, interrupting blocked writers.
    #[cfg(test)]
    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn shutdown_handle(&self) -> NodeShutdown {
        NodeShutdown {
            path: self.path.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Serves writes to `device` until the node is shut down.
    ///
    /// Returns once every connection is closed, the node holds no reference
    /// to `device` afterwards.
    pub(crate) fn serve<D: GpioDevice>(&self, device: Arc<GpioIrqDevice<D>>) -> Result<()> {
        let mut connections: Vec<Connection> = Vec::new();

        for stream in self.listener.incoming() {
            if self.cancel.is_cancelled() {
                break;
            }

            let accepted = stream.and_then(|stream| Ok((stream.try_clone()?, stream)));
            let (peer, stream) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    close_connections(connections);
                    return Err(Error::AcceptFailed(e));
                }
            };

            let device = device.clone();
            let cancel = self.cancel.clone();

            let handle = spawn(move || {
                if let Err(e) = serve_connection(&device, stream, &cancel) {
                    warn!("connection closed: {}", e);
                }
            });

            connections.retain(|(_, handle)| !handle.is_finished());
            connections.push((peer, handle));
        }

        close_connections(connections);
        info!("device node {:?} stopped", self.path);
        Ok(())
    }
}

impl Drop for DeviceNode {
    fn drop(&mut self) {
        self.cancel.cancel();

        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove device node {:?}: {}", self.path, e);
        }
    }
}

fn close_connections(connections: Vec<Connection>) {
    for (peer, handle) in connections {
        // Idle readers see end of stream, a reply in flight is still sent.
        if let Err(e) = peer.shutdown(Shutdown::Read) {
            debug!("connection already closed: {}", e);
        }

        if handle.join().is_err() {
            warn!("connection thread panicked");
        }
    }
}

fn serve_connection<D: GpioDevice>(
    device: &GpioIrqDevice<D>,
    mut stream: UnixStream,
    cancel: &CancelToken,
) -> io::Result<()> {
    let mut buf = [0u8; WRITE_CHUNK];

    loop {
        let len = stream.read(&mut buf)?;
        if cancel.is_cancelled() {
            debug!("device node shut down, closing connection");
            return Ok(());
        }

        if len == 0 {
            debug!("client disconnected");
            return Ok(());
        }

        let status = match device.handle_write(&buf[..len], cancel) {
            Ok(count) => count as i64,
            Err(e) => {
                warn!("write failed: {}", e);
                -i64::from(e.errno())
            }
        };

        writeln!(stream, "{status}")?;
    }
}
