//! Listeners the agent accepts host connections on.

use nix::sys::socket::{
    accept, bind, listen, socket, AddressFamily, SockFlag, SockType, VsockAddr,
};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};

/// Accept any CID.
const VMADDR_CID_ANY: u32 = u32::MAX;

/// A connected host stream.
pub enum Stream {
    /// vsock connection.
    Vsock(std::fs::File),
    /// Unix socket connection (development and tests).
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Vsock(f) => f.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Vsock(f) => f.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Vsock(f) => f.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Listener on vsock or a Unix socket.
pub enum Listener {
    /// Listening vsock socket.
    Vsock(OwnedFd),
    /// Listening Unix socket.
    Unix(UnixListener),
}

impl Listener {
    /// Accept the next connection.
    pub fn accept(&self) -> std::io::Result<Stream> {
        match self {
            Listener::Vsock(fd) => {
                let conn = accept(fd.as_raw_fd()).map_err(std::io::Error::from)?;
                // SAFETY: accept returned a fresh descriptor that we now own.
                Ok(Stream::Vsock(unsafe { std::fs::File::from_raw_fd(conn) }))
            }
            Listener::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
        }
    }
}

/// Listen on a vsock port.
pub fn listen_vsock(port: u32) -> std::io::Result<Listener> {
    let fd = socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(std::io::Error::from)?;

    let addr = VsockAddr::new(VMADDR_CID_ANY, port);
    bind(fd.as_raw_fd(), &addr).map_err(std::io::Error::from)?;
    listen(&fd, 16).map_err(std::io::Error::from)?;

    Ok(Listener::Vsock(fd))
}

/// Listen on a Unix socket path, replacing a stale socket file.
pub fn listen_unix(path: &std::path::Path) -> std::io::Result<Listener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path).map(Listener::Unix)
}
