//! Verifies the client's opening handshake is exactly two bytes: {0x01, 0x00}.

use std::io::Read;
use std::os::unix::net::UnixListener;
use std::thread;

#[test]
fn handshake_is_exactly_two_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("handshake.sock");

    let listener = UnixListener::bind(&path).expect("bind raw listener");
    let path_str = path.to_str().unwrap().to_string();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).expect("read handshake");
        buf
    });

    let _conn = dispatch::open(None, &path_str, dispatch::LOCAL).expect("client open");

    let received = server.join().expect("server thread");
    assert_eq!(received, [0x01, 0x00]);
}

#[test]
fn dropped_server_during_handshake_fails_open_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("drop.sock");
    let path_str = path.to_str().unwrap().to_string();

    let listener = UnixListener::bind(&path).expect("bind raw listener");
    let accepted = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        // Immediately drop the accepted connection without reading anything, so the
        // client's handshake write may fail with a broken pipe/reset.
        drop(stream);
    });
    accepted.join().expect("server thread");

    // The client's connect+handshake races the listening backlog teardown; either
    // outcome (success or a protocol/system error) is acceptable as long as it does
    // not panic and does not hang.
    let _ = dispatch::open(None, &path_str, dispatch::LOCAL);
}

#[test]
fn service_validation() {
    assert!(matches!(
        dispatch::open(None, "", dispatch::LOCAL),
        Err(dispatch::Error::Invalid(_))
    ));
    assert!(matches!(
        dispatch::open(None, "x", dispatch::LOCAL),
        Err(dispatch::Error::Invalid(_))
    ));
    assert!(matches!(
        dispatch::open(None, "relative/path", dispatch::LOCAL),
        Err(dispatch::Error::Invalid(_))
    ));
}
