//! Local-socket address construction and fd flag helpers

use crate::error::{Error, Result};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// A populated `sockaddr_un` together with the length to pass to `bind`/`connect`.
pub struct LocalAddress {
    pub addr: libc::sockaddr_un,
    pub len: libc::socklen_t,
}

/// Builds a `sockaddr_un` from a service string.
///
/// `service` must be at least 2 bytes and begin with `/` (filesystem socket) or `@`
/// (abstract namespace, Linux/Android only). Anything else is [`Error::Invalid`]; a
/// service that doesn't fit `sun_path` is [`Error::Range`].
pub fn populate_local_address(service: &str) -> Result<LocalAddress> {
    if service.len() < 2 {
        return Err(Error::invalid("service string too short"));
    }

    let bytes = service.as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_LOCAL as libc::sa_family_t;
    let path_cap = addr.sun_path.len();

    let base = mem::size_of::<libc::sa_family_t>();

    match bytes[0] {
        b'/' => {
            if bytes.len() + 1 > path_cap {
                return Err(Error::range("filesystem socket path does not fit sun_path"));
            }
            copy_into_sun_path(&mut addr, 0, bytes);
            // sun_path[bytes.len()] stays NUL from the zeroed struct.
            let len = base + bytes.len() + 1;
            Ok(LocalAddress { addr, len: len as libc::socklen_t })
        }
        b'@' => {
            if !abstract_namespace_supported() {
                return Err(Error::invalid(
                    "abstract-namespace sockets are not supported on this platform",
                ));
            }
            let rest = &bytes[1..];
            if 1 + rest.len() > path_cap {
                return Err(Error::range("abstract socket name does not fit sun_path"));
            }
            // Leading NUL signals the abstract namespace; sun_path[0] already 0.
            copy_into_sun_path(&mut addr, 1, rest);
            let len = base + 1 + rest.len();
            Ok(LocalAddress { addr, len: len as libc::socklen_t })
        }
        _ => Err(Error::invalid("service must begin with '/' or '@'")),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_namespace_supported() -> bool {
    true
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_namespace_supported() -> bool {
    false
}

fn copy_into_sun_path(addr: &mut libc::sockaddr_un, offset: usize, bytes: &[u8]) {
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[offset + i] = *b as libc::c_char;
    }
}

/// Sets `FD_CLOEXEC` on `fd`, preserving all other descriptor flags.
pub fn set_close_on_exec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if ret == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    Ok(())
}

/// Sets `O_NONBLOCK` on `fd`, preserving all other status flags.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_short_service() {
        assert!(matches!(populate_local_address(""), Err(Error::Invalid(_))));
        assert!(matches!(populate_local_address("x"), Err(Error::Invalid(_))));
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert!(matches!(
            populate_local_address("relative/path"),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn accepts_filesystem_path() {
        let addr = populate_local_address("/tmp/sock").expect("should populate");
        assert_eq!(addr.addr.sun_family, libc::AF_LOCAL as libc::sa_family_t);
    }

    #[test]
    fn rejects_oversized_abstract_name() {
        let long = format!("@{}", "a".repeat(200));
        assert!(matches!(
            populate_local_address(&long),
            Err(Error::Range(_)) | Err(Error::Invalid(_))
        ));
    }
}
