//! One periodic task and one one-shot task, the smallest useful shape of
//! the library. Runs the periodic task for two seconds, then tears down.
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use rtask::{Error, StackSize, StartTime, Task};

static RESULT: AtomicI32 = AtomicI32::new(0);
static RELEASES: AtomicU32 = AtomicU32::new(0);

fn periodic_body() {
    let mut count = 0u32;
    loop {
        match rtask::wait_next_period(None) {
            Ok(()) | Err(Error::TimedOut) => {}
            Err(_) => break,
        }
        if count % 1000 == 0 {
            println!("PERIODIC TASK: {}", count);
        }
        count += 1;
        RELEASES.store(count, Ordering::Relaxed);
    }
}

fn oneshot_body() {
    println!("ONESHOT TASK");
    RESULT.store(55, Ordering::Release);
}

/// Create and start a FIFO task, falling back to the time-sharing class
/// when the process lacks `CAP_SYS_NICE`.
fn spawn(name: &str, priority: i32, period_ns: Option<u64>, entry: fn()) -> Task {
    let start = |task: &Task| -> rtask::Result<()> {
        if let Some(period_ns) = period_ns {
            rtask::set_task_period(Some(task), StartTime::Now, period_ns)?;
        }
        rtask::start_task(task, entry)
    };

    let task = rtask::create_rt(name, StackSize::Default, priority).unwrap();
    match start(&task) {
        Ok(()) => task,
        Err(e) if e.is_os(libc::EPERM) => {
            log::warn!("no real-time scheduling privilege, running {} time-shared", name);
            let task = rtask::create_nrt(name, StackSize::Default).unwrap();
            start(&task).unwrap();
            task
        }
        Err(e) => panic!("start_task({}): {}", name, e),
    }
}

fn main() {
    rtask::init();
    rtask::logger::set_verbose(true);

    if let Err(e) = rtask::lock_all_memory() {
        log::warn!("mlockall: {}", e);
    }

    let periodic = spawn("PERIODIC", 99, Some(1_000_000), periodic_body);
    let _oneshot = spawn("ONESHOT", 80, None, oneshot_body);

    std::thread::sleep(Duration::from_secs(2));

    rtask::delete_task(Some(&periodic)).unwrap();
    println!(
        "releases: {}  oneshot result: {}",
        RELEASES.load(Ordering::Relaxed),
        RESULT.load(Ordering::Acquire)
    );

    rtask::teardown();
}
