//! Bounded-concurrency admission control. Needs its own process because the
//! process-wide `Config` is single-assignment.

use dispatch::{Config, LOCAL};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn at_most_one_worker_runs_at_a_time() {
    dispatch::init(Config {
        max_concurrency: 1,
        ..Config::default()
    })
    .expect("init");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("concurrency.sock");
    let path_str = path.to_str().unwrap().to_string();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let concurrent_for_handler = Arc::clone(&concurrent);
    let max_seen_for_handler = Arc::clone(&max_seen);
    let handler: dispatch::Handler = Arc::new(move |_ty, _conn| {
        let now = concurrent_for_handler.fetch_add(1, Ordering::SeqCst) + 1;
        max_seen_for_handler.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        concurrent_for_handler.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    });

    dispatch::listen(None, &path_str, LOCAL, vec![(1, handler)]).expect("listen");

    let mut clients = Vec::new();
    for _ in 0..4 {
        let path_str = path_str.clone();
        clients.push(std::thread::spawn(move || {
            let conn = dispatch::open(None, &path_str, LOCAL).expect("open");
            dispatch::write_type(&conn, 1).expect("write type");
        }));
    }
    for c in clients {
        c.join().expect("client thread");
    }

    // Give the last worker time to finish and decrement the counter.
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}
