//! End-to-end scenarios for the fiber runtime: hooked sleep, hooked socket
//! timeouts, connect racing accept, cancel-all on close, and the
//! caller-thread scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strand::{hook, Address, Fiber, FdRegistry, IoManager, Scheduler, Socket};

fn wait_until(ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Hooked sleep suspends the fiber, not the worker: with one worker, a
/// sleeper scheduled first still lets the next task run immediately.
#[test]
fn sleep_yields_instead_of_blocking() {
    let iom = IoManager::new(1, false, "e1").unwrap();
    let log = Arc::new(Mutex::new(String::new()));
    let start = Instant::now();

    let l1 = log.clone();
    iom.schedule(move || {
        hook::sleep_ms(300);
        l1.lock().unwrap().push('A');
    });
    let l2 = log.clone();
    iom.schedule(move || {
        l2.lock().unwrap().push('B');
    });

    assert!(wait_until(5000, || log.lock().unwrap().len() == 2));
    let elapsed = start.elapsed();
    assert_eq!(*log.lock().unwrap(), "BA");
    assert!(elapsed >= Duration::from_millis(280), "elapsed {:?}", elapsed);
    assert!(
        elapsed < Duration::from_millis(1500),
        "one worker must not serialize the sleeps: {:?}",
        elapsed
    );
    iom.stop();
}

/// SO_RCVTIMEO on a hooked socket turns into -1/ETIMEDOUT after roughly
/// the configured delay, while the worker services other fibers.
#[test]
fn recv_times_out_without_blocking_worker() {
    let iom = IoManager::new(1, false, "e2").unwrap();

    // A listener that never sends anything; the kernel completes the
    // handshake from the backlog.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (tx, rx) = mpsc::channel();
    let side_work = Arc::new(AtomicUsize::new(0));

    let sw = side_work.clone();
    iom.schedule(move || {
        let addr = Address::loopback(port);
        let sock = Socket::tcp(&addr);
        sock.connect(&addr, Some(1000)).expect("connect");
        sock.set_recv_timeout(400);

        let started = Instant::now();
        let mut buf = [0u8; 64];
        let err = sock.recv(&mut buf, 0).expect_err("idle peer must time out");
        tx.send((err, started.elapsed(), sw.load(Ordering::SeqCst)))
            .unwrap();
    });

    // Runs while the first fiber is parked in recv
    let sw2 = side_work.clone();
    iom.schedule(move || {
        sw2.fetch_add(1, Ordering::SeqCst);
    });

    let (err, waited, side_seen) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    assert!(waited >= Duration::from_millis(380), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(2000), "waited {:?}", waited);
    assert_eq!(side_seen, 1, "the worker must have run the other fiber");
    iom.stop();
}

/// Hooked connect with a timeout wins the race against a slightly late
/// accept; SO_ERROR reads back clean.
#[test]
fn connect_races_accept() {
    let iom = IoManager::new(2, false, "e3").unwrap();

    let listener = Arc::new(Socket::tcp(&Address::loopback(0)));
    listener.bind(&Address::loopback(0)).unwrap();
    listener.listen(16).unwrap();
    // Built on a non-hooked thread: register it so the fiber's accept
    // parks on the reactor instead of blocking its worker.
    FdRegistry::instance().get(listener.raw_fd(), true);
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = mpsc::channel();

    let tx1 = tx.clone();
    let caddr = addr.clone();
    iom.schedule(move || {
        let sock = Socket::tcp(&caddr);
        let rt = sock.connect(&caddr, Some(1000));
        let soerr = sock.take_error().unwrap_or(-1);
        tx1.send(("connect", rt.is_ok(), soerr)).unwrap();
    });

    let l2 = listener.clone();
    iom.schedule(move || {
        hook::sleep_ms(5);
        let accepted = l2.accept();
        tx.send(("accept", accepted.is_ok(), 0)).unwrap();
    });

    let mut results = Vec::new();
    for _ in 0..2 {
        results.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    for (who, ok, soerr) in results {
        assert!(ok, "{} failed", who);
        assert_eq!(soerr, 0, "{} left SO_ERROR set", who);
    }
    iom.stop();
}

/// Hooked close cancels both directions: each parked fiber resumes exactly
/// once, the pending count returns to its prior value, and the fd is dead.
#[test]
fn close_cancels_all_registrations() {
    // One worker serializes register/yield against the closing task.
    let iom = IoManager::new(1, false, "e4").unwrap();

    let (tx_fd, rx_fd) = mpsc::channel();
    let resumed = Arc::new(AtomicUsize::new(0));

    // Set up a socketpair whose send buffer is already full, so WRITE
    // interest cannot fire by itself.
    iom.schedule(move || {
        let mut fds = [0 as libc::c_int; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        // Registry entries force both ends non-blocking
        FdRegistry::instance().get(fds[0], true).unwrap();
        FdRegistry::instance().get(fds[1], true).unwrap();

        let small: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                fds[0],
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &small as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let junk = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::send(
                    fds[0],
                    junk.as_ptr() as *const libc::c_void,
                    junk.len(),
                    0,
                )
            };
            if n < 0 {
                break; // EAGAIN: buffer full
            }
        }
        tx_fd.send(fds).unwrap();
    });

    let fds = rx_fd.recv_timeout(Duration::from_secs(5)).unwrap();
    let fd = fds[0];
    let pending_before = iom.pending_events();

    let r1 = resumed.clone();
    let iom1 = iom.clone();
    iom.schedule(move || {
        iom1.add_event(fd, strand::Event::Read).unwrap();
        Fiber::yield_now();
        r1.fetch_add(1, Ordering::SeqCst);
    });
    let r2 = resumed.clone();
    let iom2 = iom.clone();
    iom.schedule(move || {
        iom2.add_event(fd, strand::Event::Write).unwrap();
        Fiber::yield_now();
        r2.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(5000, || iom.pending_events() == pending_before + 2));

    iom.schedule(move || {
        hook::close(fd);
    });

    assert!(wait_until(5000, || resumed.load(Ordering::SeqCst) == 2));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(resumed.load(Ordering::SeqCst), 2, "each waiter resumes once");
    assert_eq!(iom.pending_events(), pending_before);

    // The runtime has forgotten the fd entirely: no registry record, no
    // registrations left to cancel. (A raw write would draw EBADF, but the
    // number may already be reused by a concurrent test.)
    assert!(FdRegistry::instance().get(fd, false).is_none());
    assert!(!iom.cancel_all(fd), "no registrations may survive the close");

    hook::close(fds[1]);
    iom.stop();
}

/// A caller-thread scheduler drains everything inside stop() and leaves no
/// threads behind.
#[test]
fn caller_thread_scheduler_drains() {
    let sched = Scheduler::new(1, true, "e6");
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..32 {
        let d = done.clone();
        sched.schedule(move || {
            let me = Fiber::current();
            Scheduler::with_current(|s| s.schedule_fiber(me)).unwrap();
            Fiber::yield_now();
            d.fetch_add(1, Ordering::SeqCst);
        });
    }

    sched.stop();
    assert_eq!(done.load(Ordering::SeqCst), 32);
}
