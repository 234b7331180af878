//! File descriptor transfer via SCM_RIGHTS, exercised end to end over a real
//! listener/client pair.

use dispatch::LOCAL;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;

const TYPE_SEND_FD: u16 = 1;

#[test]
fn fd_sent_by_the_handler_is_usable_by_the_client() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fdpass.sock");
    let path_str = path.to_str().unwrap().to_string();

    // A pipe whose write end we hand across the socket; the client reads from
    // the read end directly and we write a known payload into the write end
    // after handing it off, to make sure it is the *same* open file description.
    let (read_end, write_end) = {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    };

    let handler: dispatch::Handler = std::sync::Arc::new(move |_ty, conn| {
        dispatch::write_fd(&conn, read_end)
            .map(|_| ())
            .map_err(|e| e.to_string())
    });
    dispatch::listen(None, &path_str, LOCAL, vec![(TYPE_SEND_FD, handler)]).expect("listen");

    let conn = dispatch::open(None, &path_str, LOCAL).expect("open");
    dispatch::write_type(&conn, TYPE_SEND_FD).expect("write type");
    let received_fd = dispatch::read_fd(&conn).expect("read fd");

    let mut write_file = unsafe { std::fs::File::from_raw_fd(write_end) };
    write_file.write_all(b"hello").expect("write to pipe");
    drop(write_file);

    let mut received_file = unsafe { std::fs::File::from_raw_fd(received_fd) };
    let mut buf = Vec::new();
    received_file.read_to_end(&mut buf).expect("read from received fd");
    assert_eq!(buf, b"hello");

    assert!(received_fd != read_end, "received fd must be a distinct descriptor");
}

#[test]
fn received_fd_is_close_on_exec() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fdpass-cloexec.sock");
    let path_str = path.to_str().unwrap().to_string();

    let (a, b) = {
        let pair = UnixStream::pair().expect("socketpair");
        (pair.0, pair.1)
    };
    let handler: dispatch::Handler = std::sync::Arc::new(move |_ty, conn| {
        dispatch::write_fd(&conn, a.as_raw_fd())
            .map(|_| ())
            .map_err(|e| e.to_string())
    });
    dispatch::listen(None, &path_str, LOCAL, vec![(TYPE_SEND_FD, handler)]).expect("listen");
    drop(b);

    let conn = dispatch::open(None, &path_str, LOCAL).expect("open");
    dispatch::write_type(&conn, TYPE_SEND_FD).expect("write type");
    let received_fd = dispatch::read_fd(&conn).expect("read fd");

    let flags = unsafe { libc::fcntl(received_fd, libc::F_GETFD) };
    assert!(flags & libc::FD_CLOEXEC != 0);

    unsafe {
        libc::close(received_fd);
    }
}
