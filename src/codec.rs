//! Length-prefixed wire codec: full read/write, integers, strings, buffers, fds

use crate::conn::Connection;
use crate::error::{Error, Result};
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::os::unix::io::RawFd;

/// Raw three-way read/write result: `Ok(0)` is EOF at a frame boundary, `Ok(n)` with
/// `n > 0` is success, anything else is `Err`.
pub(crate) type Raw = Result<usize>;

/// Reads until `buf` is full, EOF is seen, or an unrecoverable error occurs. Never
/// returns a short count: `Ok(0)` means EOF at the very start of the read, `Ok(n)`
/// with `0 < n < buf.len()` never happens.
pub fn read_full(conn: &Connection, buf: &mut [u8]) -> Raw {
    let mut done = 0;
    while done < buf.len() {
        let n = loop {
            let ret = unsafe {
                libc::read(
                    conn.fd(),
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                )
            };
            if ret == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::System(err));
            }
            break ret as usize;
        };
        if n == 0 {
            return if done == 0 {
                Ok(0)
            } else {
                Err(Error::protocol("short read mid-frame"))
            };
        }
        done += n;
    }
    Ok(done)
}

/// Writes all of `buf`, retrying on `EINTR`. Never returns a short count.
pub fn write_full(conn: &Connection, buf: &[u8]) -> Raw {
    let mut done = 0;
    while done < buf.len() {
        let n = loop {
            let ret = unsafe {
                libc::write(
                    conn.fd(),
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                )
            };
            if ret == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::System(err));
            }
            break ret as usize;
        };
        if n == 0 {
            return Ok(done);
        }
        done += n;
    }
    Ok(done)
}

// ---------------------------------------------------------------------------
// Variable-length prefix (RFC 4880-style 1/2/5 byte encoding)
// ---------------------------------------------------------------------------

/// Decoded length-prefix: either an ordinary length or a "special" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prefix {
    Length(u32),
    Special(u8),
}

pub(crate) fn read_prefix(conn: &Connection) -> Result<Option<Prefix>> {
    let mut a = [0u8; 1];
    match read_full(conn, &mut a)? {
        0 => return Ok(None),
        _ => {}
    }
    let a = a[0];

    if a < 192 {
        Ok(Some(Prefix::Length(a as u32)))
    } else if a < 224 {
        let mut b = [0u8; 1];
        if read_full(conn, &mut b)? == 0 {
            return Err(Error::protocol("truncated two-byte length prefix"));
        }
        let length = (a as u32 - 192) * 256 + b[0] as u32 + 192;
        Ok(Some(Prefix::Length(length)))
    } else if a < 255 {
        Ok(Some(Prefix::Special(a & 0x1F)))
    } else {
        let mut rest = [0u8; 4];
        if read_full(conn, &mut rest)? == 0 {
            return Err(Error::protocol("truncated five-byte length prefix"));
        }
        Ok(Some(Prefix::Length(u32::from_be_bytes(rest))))
    }
}

/// Picks the shortest valid encoding for `prefix`; returns the bytes to send.
pub(crate) fn encode_prefix(prefix: Prefix) -> ([u8; 5], usize) {
    let mut bytes = [0u8; 5];
    let len = match prefix {
        Prefix::Special(marker) => {
            bytes[0] = 0xE0 | (marker & 0x1F);
            1
        }
        Prefix::Length(length) if length > 8383 => {
            bytes[0] = 0xFF;
            bytes[1..5].copy_from_slice(&length.to_be_bytes());
            5
        }
        Prefix::Length(length) if length > 191 => {
            bytes[0] = (192 + ((length - 192) >> 8)) as u8;
            bytes[1] = (length - 192) as u8;
            2
        }
        Prefix::Length(length) => {
            bytes[0] = length as u8;
            1
        }
    };
    (bytes, len)
}

pub(crate) fn write_prefix(conn: &Connection, prefix: Prefix) -> Raw {
    let (bytes, len) = encode_prefix(prefix);
    write_full(conn, &bytes[..len])
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

const ABSENT_STRING_MARKER: u8 = 1;

/// Reads a length-prefixed string. `Ok(None)` means the peer wrote the distinguished
/// absent-string marker; `Err(Error::Eof)` means the peer closed at a frame boundary.
pub fn read_string(conn: &Connection) -> Result<Option<String>> {
    match read_prefix(conn)? {
        None => Err(Error::Eof),
        Some(Prefix::Special(ABSENT_STRING_MARKER)) => Ok(None),
        Some(Prefix::Special(m)) => Err(Error::protocol(format!("unexpected string marker {m}"))),
        Some(Prefix::Length(length)) => {
            let mut buf = vec![0u8; length as usize];
            if length > 0 {
                match read_full(conn, &mut buf)? {
                    0 => return Err(Error::Eof),
                    n if n == buf.len() => {}
                    _ => return Err(Error::protocol("short string payload")),
                }
            }
            String::from_utf8(buf)
                .map(Some)
                .map_err(|e| Error::protocol(format!("string is not valid utf-8: {e}")))
        }
    }
}

/// Writes `string`, or the absent-string marker when `string` is `None`.
pub fn write_string(conn: &Connection, string: Option<&str>) -> Raw {
    match string {
        None => write_prefix(conn, Prefix::Special(ABSENT_STRING_MARKER)),
        Some(s) => {
            let bytes = s.as_bytes();
            write_prefix(conn, Prefix::Length(bytes.len() as u32))?;
            if bytes.is_empty() {
                Ok(1)
            } else {
                write_full(conn, bytes)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Reads just the length prefix of an upcoming buffer, so the caller can size or
/// reuse storage before reading the payload with [`read_buffer`].
pub fn read_buffer_length(conn: &Connection) -> Result<usize> {
    match read_prefix(conn)? {
        None => Err(Error::Eof),
        Some(Prefix::Length(length)) => Ok(length as usize),
        Some(Prefix::Special(m)) => Err(Error::protocol(format!("unexpected buffer marker {m}"))),
    }
}

/// Reads exactly `buf.len()` bytes of buffer payload (the length itself having
/// already been read with [`read_buffer_length`]).
pub fn read_buffer(conn: &Connection, buf: &mut [u8]) -> Raw {
    if buf.is_empty() {
        return Ok(1);
    }
    read_full(conn, buf)
}

/// Writes a buffer's length prefix.
pub fn write_buffer_length(conn: &Connection, length: usize) -> Raw {
    write_prefix(conn, Prefix::Length(length as u32))
}

/// Writes a buffer's payload (the length having already been written with
/// [`write_buffer_length`]).
pub fn write_buffer(conn: &Connection, buf: &[u8]) -> Raw {
    if buf.is_empty() {
        Ok(1)
    } else {
        write_full(conn, buf)
    }
}

// ---------------------------------------------------------------------------
// Fixed-width integers
// ---------------------------------------------------------------------------

macro_rules! fixed_width {
    ($read:ident, $write:ident, $ty:ty, $width:expr) => {
        #[doc = concat!("Reads a big-endian `", stringify!($ty), "`.")]
        pub fn $read(conn: &Connection) -> Result<$ty> {
            let mut buf = [0u8; $width];
            match read_full(conn, &mut buf)? {
                0 => Err(Error::Eof),
                n if n == $width => Ok(<$ty>::from_be_bytes(buf)),
                _ => Err(Error::protocol(concat!(
                    "short read for ",
                    stringify!($ty)
                ))),
            }
        }

        #[doc = concat!("Writes a big-endian `", stringify!($ty), "`.")]
        pub fn $write(conn: &Connection, val: $ty) -> Raw {
            write_full(conn, &val.to_be_bytes())
        }
    };
}

/// Reads a single byte.
pub fn read_u8(conn: &Connection) -> Result<u8> {
    let mut buf = [0u8; 1];
    match read_full(conn, &mut buf)? {
        0 => Err(Error::Eof),
        _ => Ok(buf[0]),
    }
}

/// Writes a single byte.
pub fn write_u8(conn: &Connection, val: u8) -> Raw {
    write_full(conn, &[val])
}

fixed_width!(read_u16, write_u16, u16, 2);
fixed_width!(read_i32, write_i32, i32, 4);
fixed_width!(read_u32, write_u32, u32, 4);
fixed_width!(read_i64, write_i64, i64, 8);
fixed_width!(read_u64, write_u64, u64, 8);

/// Alias for the message-type surface: `read_u16`.
pub fn read_type(conn: &Connection) -> Result<u16> {
    read_u16(conn)
}

/// Alias for the message-type surface: `write_u16`.
pub fn write_type(conn: &Connection, ty: u16) -> Raw {
    write_u16(conn, ty)
}

// ---------------------------------------------------------------------------
// Ancillary file descriptor passing
// ---------------------------------------------------------------------------

/// Sends `fd` as `SCM_RIGHTS` ancillary data alongside a single payload byte.
pub fn write_fd(conn: &Connection, fd: RawFd) -> Raw {
    let payload = [b'i'];
    let iov = [IoSlice::new(&payload)];

    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(
            &fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            mem::size_of::<RawFd>(),
        );
    }

    let ret = unsafe { libc::sendmsg(conn.fd(), &msg, 0) };
    if ret == -1 {
        Err(Error::System(io::Error::last_os_error()))
    } else {
        Ok(ret as usize)
    }
}

/// Receives a file descriptor sent with [`write_fd`]. The returned fd has
/// close-on-exec set atomically (`MSG_CMSG_CLOEXEC`). A message with no matching
/// `SCM_RIGHTS` header is [`Error::Protocol`].
pub fn read_fd(conn: &Connection) -> Result<RawFd> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];

    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let ret = unsafe { libc::recvmsg(conn.fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if ret == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    if ret == 0 {
        return Err(Error::Eof);
    }

    if (msg.msg_controllen as usize) < mem::size_of::<libc::cmsghdr>() {
        return Err(Error::protocol("missing ancillary data for fd transfer"));
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                && (*cmsg).cmsg_len as usize == libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize
            {
                let mut fd: RawFd = -1;
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut fd as *mut RawFd as *mut u8,
                    mem::size_of::<RawFd>(),
                );
                return Ok(fd);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Err(Error::protocol("no SCM_RIGHTS header in received message"))
}
