//! Smoke demo: fibers, hooked sleep, timers.
//!
//! ```text
//! cargo run -p basic
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strand::{hook, Fiber, IoManager, Scheduler};

fn main() {
    // Side fibers on the main thread, no scheduler involved
    let f = Fiber::new(
        || {
            println!("side fiber: first slice");
            Fiber::yield_now();
            println!("side fiber: second slice");
        },
        0,
        false,
    )
    .unwrap();
    f.resume();
    println!("main: between slices");
    f.resume();

    // An io manager: sleeps suspend fibers, not workers
    let iom = IoManager::new(2, false, "demo").unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for i in 0..4u64 {
        let done = done.clone();
        iom.schedule(move || {
            hook::sleep_ms(100 * (i + 1));
            println!("fiber {} woke after {} ms", i, 100 * (i + 1));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    iom.add_timer(250, || println!("timer: halfway"), false);

    while done.load(Ordering::SeqCst) < 4 {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    iom.stop();

    // Caller-thread scheduler: everything drains inside stop()
    let sched = Scheduler::new(1, true, "caller");
    for i in 0..3 {
        sched.schedule(move || println!("caller-thread task {}", i));
    }
    sched.stop();
    println!("done");
}
