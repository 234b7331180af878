//! Accept loop, handler dispatch, bounded worker pool, panic protocol

use crate::addr::{populate_local_address, set_close_on_exec};
use crate::codec;
use crate::config::{self, Config};
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::flags::OpenFlags;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

/// The outcome of a handler invocation. Informational only: the engine does not
/// translate a `Err` into any user-visible behavior beyond closing the connection
/// and logging it at `trace`.
pub type HandlerResult = std::result::Result<(), String>;

/// Application callback bound to a message type, invoked once per accepted
/// connection after the type has been read.
pub type Handler = Arc<dyn Fn(u16, Connection) -> HandlerResult + Send + Sync>;

/// Message type reserved and never sent on the wire.
pub const TYPE_RESERVED: u16 = 0;
/// Server replies with a single zero byte; served by a built-in handler unless the
/// caller registers its own.
pub const TYPE_PING: u16 = 65534;
/// Invoked only by the panic protocol, never reachable from the network.
pub const TYPE_PANIC: u16 = 65535;

struct HandlerEntry {
    ty: u16,
    handler: Handler,
}

/// A bounded semaphore: counter + condition variable guarded by a mutex, used for
/// worker admission control.
struct Semaphore {
    state: Mutex<SemaphoreState>,
    available: Condvar,
}

struct SemaphoreState {
    active: usize,
    max: usize,
}

impl Semaphore {
    fn new(max: usize) -> Self {
        Semaphore {
            state: Mutex::new(SemaphoreState { active: 0, max }),
            available: Condvar::new(),
        }
    }

    /// Blocks while `active >= max`, then increments `active`.
    fn acquire(&self) {
        let mut state = self.state.lock();
        while state.active >= state.max {
            self.available.wait(&mut state);
        }
        state.active += 1;
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        self.available.notify_one();
    }

    fn snapshot(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.active, state.max)
    }
}

/// A registered, validated handler table plus the bounded-concurrency admission
/// control shared by every connection accepted on one listener.
struct Engine {
    handlers: Vec<HandlerEntry>,
    semaphore: Semaphore,
    accept_failures: AtomicU32,
}

impl Engine {
    fn lookup(&self, ty: u16) -> Option<Handler> {
        self.handlers
            .iter()
            .find(|e| e.ty == ty)
            .map(|e| Arc::clone(&e.handler))
    }
}

/// Starts listening on `service`. Validates `host`/`flags` as [`crate::conn::open`]
/// does. If [`crate::flags::NORETURN`] is set, the calling thread becomes the accept
/// loop and this function never returns on success; otherwise a background thread
/// runs the accept loop and this function returns immediately.
pub fn listen(
    host: Option<&str>,
    service: &str,
    flags: u32,
    handlers: Vec<(u16, Handler)>,
) -> Result<()> {
    if host.is_some() {
        return Err(Error::invalid("host must be absent in this revision"));
    }
    let open_flags = OpenFlags::from_bits(flags)?;
    if !open_flags.local() {
        return Err(Error::invalid("only LOCAL addresses are supported"));
    }

    let mut entries = Vec::with_capacity(handlers.len());
    for (ty, handler) in handlers {
        if ty == TYPE_RESERVED {
            return Err(Error::invalid("message type 0 is reserved"));
        }
        entries.push(HandlerEntry { ty, handler });
    }

    let local = populate_local_address(service)?;

    let sock = unsafe { libc::socket(libc::AF_LOCAL, libc::SOCK_STREAM, 0) };
    if sock == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }

    // Ensure the listening socket is closed on any early return.
    let guard = FdGuard(sock);

    set_close_on_exec(sock)?;

    if service.as_bytes()[0] == b'/' {
        unsafe {
            // Best-effort: a stale node may simply not exist.
            let cpath = std::ffi::CString::new(service).map_err(|_| {
                Error::invalid("service path contains an interior NUL")
            })?;
            libc::unlink(cpath.as_ptr());
        }
    }

    let ret = unsafe {
        libc::bind(
            sock,
            &local.addr as *const libc::sockaddr_un as *const libc::sockaddr,
            local.len,
        )
    };
    if ret == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }

    let ret = unsafe { libc::listen(sock, 100) };
    if ret == -1 {
        return Err(Error::System(io::Error::last_os_error()));
    }

    let cfg = config::current();
    let engine = Arc::new(Engine {
        handlers: entries,
        semaphore: Semaphore::new(cfg.max_concurrency),
        accept_failures: AtomicU32::new(0),
    });

    let listen_fd = guard.take();

    if open_flags.noreturn() {
        accept_loop(listen_fd, engine, cfg);
        Ok(())
    } else {
        thread::Builder::new()
            .name("dispatch-accept".into())
            .spawn(move || accept_loop(listen_fd, engine, cfg))
            .map_err(Error::System)?;
        Ok(())
    }
}

/// Closes a raw fd on drop unless [`FdGuard::take`] has been called.
struct FdGuard(RawFd);

impl FdGuard {
    fn take(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn accept_loop(listen_fd: RawFd, engine: Arc<Engine>, cfg: Arc<Config>) -> ! {
    loop {
        let accepted = loop {
            let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd != -1 {
                break fd;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            let n = engine.accept_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if cfg.panic_on_failed_accept {
                panic_protocol(&engine, "accept", &err.to_string());
            }
            if cfg.log_on_failed_accept != 0 && n % cfg.log_on_failed_accept == 0 {
                warn!(target: "dispatch::accept", error = %err, failure_no = n, "accept failed");
            }
            continue;
        };

        if let Err(e) = set_close_on_exec(accepted) {
            panic_protocol(&engine, "cloexec(accepted)", &e.to_string());
        }

        engine.semaphore.acquire();

        let conn = Connection::from_raw_fd(accepted, OpenFlags::default());

        let mut header = [0u8; 4];
        match codec::read_full(&conn, &mut header) {
            Ok(0) => {
                // EOF before a single header byte: close and reloop, slot released.
                trace!(target: "dispatch::accept", "peer closed before sending a header");
                drop(conn);
                engine.semaphore.release();
                continue;
            }
            Err(Error::Protocol(_)) => {
                // A short read mid-header (neither a clean 0-byte EOF nor a full 4
                // bytes) is an unrecoverable protocol failure, not a disconnect.
                panic_protocol(&engine, "msg_read", "short read of message header");
            }
            Err(e) => {
                panic_protocol(&engine, "msg_read", &e.to_string());
            }
            Ok(_) => {}
        }

        let ty = u16::from_be_bytes([header[2], header[3]]);

        let handler = match engine.lookup(ty) {
            Some(h) => h,
            None if ty == TYPE_PING => Arc::new(ping_handler) as Handler,
            None => {
                drop(conn);
                panic_protocol(&engine, "dispatch", &format!("unable to handle type {ty}"));
            }
        };

        let stacksize = cfg.stacksize;
        let engine_for_worker = Arc::clone(&engine);
        let mut builder = thread::Builder::new().name(format!("dispatch-worker-{ty}"));
        if stacksize != 0 {
            builder = builder.stack_size(stacksize);
        }
        let spawned = builder.spawn(move || worker_main(handler, ty, conn, engine_for_worker));
        if spawned.is_err() {
            panic_protocol(&engine, "thread::spawn", "failed to spawn worker thread");
        }
    }
}

fn worker_main(handler: Handler, ty: u16, conn: Connection, engine: Arc<Engine>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(ty, conn)));
    match result {
        Ok(Ok(())) => trace!(target: "dispatch::worker", ty, "handler completed"),
        Ok(Err(msg)) => trace!(target: "dispatch::worker", ty, error = %msg, "handler returned failure"),
        Err(_) => warn!(target: "dispatch::worker", ty, "handler panicked"),
    }
    engine.semaphore.release();
}

fn ping_handler(_ty: u16, conn: Connection) -> HandlerResult {
    codec::write_u8(&conn, 0).map(|_| ()).map_err(|e| e.to_string())
}

fn panic_protocol(engine: &Engine, location: &str, detail: &str) -> ! {
    let (active, max) = engine.semaphore.snapshot();
    error!(
        target: "dispatch::panic",
        location,
        active,
        max,
        detail,
        "dispatch engine entering panic protocol"
    );
    eprintln!("dispatch: panic at {location}: {detail} (active={active} max={max})");

    if let Some(panic_handler) = engine.lookup(TYPE_PANIC) {
        // No real peer connection is available for the panic hook, only a chance to
        // run side effects (flush logs, notify, etc); panics inside the hook are
        // swallowed rather than re-entering the panic protocol. The dummy fd of -1
        // passed to the handler must not be used for I/O.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            let dummy = Connection::from_raw_fd(-1, OpenFlags::default());
            let _ = panic_handler(TYPE_PANIC, dummy);
        }));
    } else {
        dump_proc_self_status();
    }

    std::process::abort();
}

#[cfg(target_os = "linux")]
fn dump_proc_self_status() {
    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        eprintln!("{status}");
    }
}

#[cfg(not(target_os = "linux"))]
fn dump_proc_self_status() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_rejects_host() {
        assert!(matches!(
            listen(Some("h"), "/tmp/sock", crate::flags::LOCAL, vec![]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn listen_rejects_reserved_type() {
        let handler: Handler = Arc::new(|_, _| Ok(()));
        assert!(matches!(
            listen(None, "/tmp/does-not-matter-for-this-check", crate::flags::LOCAL, vec![(0, handler)]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn semaphore_enforces_bound() {
        let sem = Semaphore::new(1);
        sem.acquire();
        assert_eq!(sem.snapshot(), (1, 1));
        sem.release();
        assert_eq!(sem.snapshot(), (0, 1));
    }
}
