//! Connection lifecycle: client-side open, close, poison, peer credentials

use crate::addr::{populate_local_address, set_close_on_exec, set_nonblocking};
use crate::codec;
use crate::error::{Error, Result};
use crate::flags::OpenFlags;
use std::io;
use std::os::unix::io::RawFd;
use tracing::warn;

/// An owning wrapper around a single local-stream socket file descriptor.
///
/// Dropping a `Connection` always closes its file descriptor. A connection owned
/// outright by a worker thread (as opposed to one handed back to a caller) needs no
/// separate storage-ownership flag here: ordinary Rust ownership already expresses
/// the distinction.
pub struct Connection {
    fd: RawFd,
    poisoned: bool,
    open_flags: OpenFlags,
}

impl Connection {
    pub(crate) fn from_raw_fd(fd: RawFd, open_flags: OpenFlags) -> Self {
        Connection { fd, poisoned: false, open_flags }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether this connection's socket was opened in non-blocking mode.
    pub fn is_nonblocking(&self) -> bool {
        self.open_flags.nonblock()
    }

    /// Whether [`poison`] has been called on this connection.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// Opens a connection to `service`. `host` must be `None` in this revision; any other
/// value is [`Error::Invalid`].
pub fn open(host: Option<&str>, service: &str, flags: u32) -> Result<Connection> {
    if host.is_some() {
        return Err(Error::invalid("host must be absent in this revision"));
    }
    let open_flags = OpenFlags::from_bits(flags)?;
    if !open_flags.local() {
        return Err(Error::invalid("only LOCAL addresses are supported"));
    }

    let local = populate_local_address(service)?;

    let fd = unsafe { libc::socket(libc::AF_LOCAL, libc::SOCK_STREAM, 0) };
    if fd == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    let mut conn = Connection::from_raw_fd(fd, open_flags);

    if let Err(e) = set_close_on_exec(fd) {
        return Err(e);
    }
    if open_flags.nonblock() {
        set_nonblocking(fd)?;
    }

    let ret = unsafe {
        libc::connect(
            fd,
            &local.addr as *const libc::sockaddr_un as *const libc::sockaddr,
            local.len,
        )
    };
    if ret == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }

    // Opening handshake: protocol version 1, reserved byte 0.
    match codec::write_full(&conn, &[0x01, 0x00]) {
        Ok(n) if n == 2 => Ok(conn),
        Ok(_) => {
            warn!(target: "dispatch::conn", "short handshake write");
            conn.poisoned = true;
            Err(Error::protocol("short handshake write"))
        }
        Err(e) => {
            warn!(target: "dispatch::conn", error = %e, "handshake write failed");
            conn.poisoned = true;
            Err(e)
        }
    }
}

/// Closes `conn`. A no-op on `None`, so callers can close unconditionally without
/// tracking whether a connection was ever established.
pub fn close(conn: Option<Connection>) {
    drop(conn);
}

/// Marks `conn` poisoned. A placeholder for a future connection cache: it has no
/// observable effect in this revision beyond [`Connection::is_poisoned`], and always
/// succeeds.
pub fn poison(conn: &mut Connection) {
    conn.poisoned = true;
}

/// Peer identity, as obtained from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInfo {
    /// Credentials for a local-socket peer.
    Local { pid: i32, uid: u32, gid: u32 },
    /// The platform does not expose a peer-credential mechanism.
    Unavailable,
}

/// Retrieves peer credentials for `conn`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peerinfo(conn: &Connection) -> Result<PeerInfo> {
    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            conn.fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    Ok(PeerInfo::Local {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

/// Retrieves peer credentials for `conn`. Always `Ok(PeerInfo::Unavailable)` on
/// platforms without a peer-credential socket option.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn peerinfo(_conn: &Connection) -> Result<PeerInfo> {
    Ok(PeerInfo::Unavailable)
}
