//! End-to-end lifecycle coverage: creation validation, one-shot execution,
//! suspension, resumption, and deletion.
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rtask::{
    create_nrt, create_rt, delete_task, get_self, get_task_info, resume_task, set_cpu_affinity,
    spawn_nrt, start_task, suspend_task, Error, StackSize, Task, TaskState,
};

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let end = Instant::now() + timeout;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Start a FIFO task at `priority`, falling back to the time-sharing
/// variant when the process lacks `CAP_SYS_NICE`.
fn spawn_any(name: &str, priority: i32, entry: impl FnOnce() + Send + Clone + 'static) -> Task {
    let task = create_rt(name, StackSize::Default, priority).unwrap();
    match start_task(&task, entry.clone()) {
        Ok(()) => task,
        Err(e) if e.is_os(libc::EPERM) => {
            let task = create_nrt(name, StackSize::Default).unwrap();
            start_task(&task, entry).unwrap();
            task
        }
        Err(e) => panic!("start_task: {}", e),
    }
}

#[test]
fn overlong_name_is_rejected() {
    // 34 bytes, over the 31-byte limit
    let name = "ABCDEFGHIJKLMNOPQABCDEFGHIJKLMNOPQ";
    assert_eq!(
        create_rt(name, StackSize::Default, 99).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        create_nrt(name, StackSize::Default).unwrap_err(),
        Error::InvalidArgument
    );
}

#[test]
fn empty_name_is_rejected() {
    assert_eq!(
        create_rt("", StackSize::Default, 50).unwrap_err(),
        Error::InvalidArgument
    );
}

#[test]
fn priority_limits_are_enforced() {
    assert_eq!(
        create_rt("ABCD", StackSize::Default, 100).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        create_rt("ABCD", StackSize::Default, 0).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        create_rt("ABCD", StackSize::Default, -3).unwrap_err(),
        Error::InvalidArgument
    );

    let task = create_rt("ABCD", StackSize::Default, 99).unwrap();
    let info = get_task_info(Some(&task)).unwrap();
    assert_eq!(info.priority, 99);
    assert!(info.real_time);
}

#[test]
fn creation_leaves_task_ready() {
    let task = create_rt("READY", StackSize::Default, 12).unwrap();
    let info = get_task_info(Some(&task)).unwrap();
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.name, "READY");
    assert!(!info.periodic);
    assert_eq!(info.pid, 0);
}

#[test]
fn oneshot_task_runs_to_completion() {
    let value = Arc::new(AtomicI32::new(0));
    let value2 = Arc::clone(&value);
    let task = spawn_any("ONESHOT", 99, move || {
        value2.store(55, Ordering::Release);
    });

    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
    assert_eq!(value.load(Ordering::Acquire), 55);

    // Deleting a dead task is an idempotent no-op.
    assert_eq!(delete_task(Some(&task)), Ok(()));
    assert_eq!(delete_task(Some(&task)), Ok(()));
}

#[test]
fn spawn_wrapper_creates_and_starts() {
    let value = Arc::new(AtomicI32::new(0));
    let value2 = Arc::clone(&value);
    let task = spawn_nrt("SPAWNED", StackSize::Default, move || {
        value2.store(55, Ordering::Release);
    })
    .unwrap();

    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
    assert_eq!(value.load(Ordering::Acquire), 55);
}

#[test]
fn double_start_is_rejected() {
    let task = create_nrt("TWICE", StackSize::Default).unwrap();
    start_task(&task, || std::thread::sleep(Duration::from_millis(100))).unwrap();
    assert_eq!(start_task(&task, || {}).unwrap_err(), Error::WouldBlock);
    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
}

#[test]
fn worker_thread_sees_its_own_task() {
    let observed = Arc::new(AtomicBool::new(false));
    let observed2 = Arc::clone(&observed);
    let task = spawn_any("SELFLOOK", 20, move || {
        if let Some(me) = get_self() {
            let info = get_task_info(None).unwrap();
            observed2.store(
                me.name() == "SELFLOOK" && info.name == "SELFLOOK" && info.pid != 0,
                Ordering::Release,
            );
        }
    });

    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
    assert!(observed.load(Ordering::Acquire));
}

#[test]
fn foreign_threads_have_no_task() {
    assert!(get_self().is_none());
    assert_eq!(suspend_task(None).unwrap_err(), Error::NotPermitted);
    assert_eq!(resume_task(None).unwrap_err(), Error::NotPermitted);
    assert_eq!(delete_task(None).unwrap_err(), Error::NotPermitted);
    assert_eq!(get_task_info(None).unwrap_err(), Error::NotPermitted);
}

#[test]
fn affinity_can_only_change_before_start() {
    let task = create_rt("PINNED", StackSize::Default, 30).unwrap();

    assert_eq!(
        set_cpu_affinity(&task, rtask::available_cpus()).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(set_cpu_affinity(&task, 0), Ok(()));

    let done = Arc::new(AtomicBool::new(false));
    let done2 = Arc::clone(&done);
    let task = spawn_any("PINNED", 30, move || {
        done2.store(true, Ordering::Release);
    });

    assert_eq!(set_cpu_affinity(&task, 0).unwrap_err(), Error::NotPermitted);
    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
}

#[test]
fn delete_resets_an_unstarted_task() {
    let task = create_rt("RESET", StackSize::Default, 99).unwrap();
    assert_eq!(get_task_info(Some(&task)).unwrap().priority, 99);

    assert_eq!(delete_task(Some(&task)), Ok(()));
    let info = get_task_info(Some(&task)).unwrap();
    assert_eq!(info.priority, 0);
    assert_eq!(info.state, TaskState::Init);
    assert!(info.name.is_empty());

    // Idempotent on the already-reset record too.
    assert_eq!(delete_task(Some(&task)), Ok(()));
}

#[test]
fn suspend_freezes_and_resume_unfreezes_a_running_task() {
    let counter = Arc::new(AtomicU32::new(0));
    let exit = Arc::new(AtomicBool::new(false));

    // Deliberately time-shared: a busy FIFO loop could starve a
    // single-CPU machine when the suite runs privileged.
    let counter2 = Arc::clone(&counter);
    let exit2 = Arc::clone(&exit);
    let task = create_nrt("FREEZE", StackSize::Default).unwrap();
    start_task(&task, move || {
        while !exit2.load(Ordering::Acquire) {
            counter2.fetch_add(1, Ordering::Relaxed);
        }
    })
    .unwrap();

    assert!(wait_until(
        || counter.load(Ordering::Relaxed) > 0,
        Duration::from_secs(5)
    ));

    suspend_task(Some(&task)).unwrap();
    assert!(wait_until(
        || task.state() == TaskState::Suspended,
        Duration::from_secs(5)
    ));

    let frozen = counter.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::Relaxed), frozen);

    resume_task(Some(&task)).unwrap();
    assert!(wait_until(
        || counter.load(Ordering::Relaxed) != frozen,
        Duration::from_secs(5)
    ));

    exit.store(true, Ordering::Release);
    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
}

#[test]
fn pre_start_suspension_parks_the_worker_before_entry() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = Arc::clone(&ran);

    let task = create_nrt("LATCHED", StackSize::Default).unwrap();
    suspend_task(Some(&task)).unwrap();
    start_task(&task, move || {
        ran2.store(true, Ordering::Release);
    })
    .unwrap();

    assert!(wait_until(
        || task.state() == TaskState::Suspended,
        Duration::from_secs(5)
    ));
    assert!(!ran.load(Ordering::Acquire));

    resume_task(Some(&task)).unwrap();
    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
    assert!(ran.load(Ordering::Acquire));
}

#[test]
fn suspend_and_resume_are_permissive_on_settled_tasks() {
    // Resuming a task that was never suspended is accepted.
    let task = create_nrt("IDLE", StackSize::Default).unwrap();
    assert_eq!(resume_task(Some(&task)), Ok(()));

    // Suspending or resuming a dead task is accepted.
    let task = spawn_any("GONE", 20, || {});
    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
    assert_eq!(suspend_task(Some(&task)), Ok(()));
    assert_eq!(resume_task(Some(&task)), Ok(()));
}

#[test]
fn delete_stops_a_busy_task() {
    let exit_seen = Arc::new(AtomicBool::new(false));
    let exit_seen2 = Arc::clone(&exit_seen);
    let task = spawn_any("STOPME", 10, move || {
        // Self-suspension is a library suspension point; a stop request
        // surfaces there as `Canceled`.
        loop {
            match suspend_task(None) {
                Err(Error::Canceled) => break,
                Ok(()) => {}
                Err(e) => panic!("suspend_task: {}", e),
            }
        }
        exit_seen2.store(true, Ordering::Release);
    });

    assert!(wait_until(
        || task.state() == TaskState::Suspended,
        Duration::from_secs(5)
    ));

    delete_task(Some(&task)).unwrap();
    assert!(wait_until(
        || task.state() == TaskState::Dead,
        Duration::from_secs(5)
    ));
    assert!(exit_seen.load(Ordering::Acquire));
}

#[test]
fn spin_timer_busy_waits_the_requested_time() {
    let t0 = rtask::read_timer();
    rtask::spin_timer(100_000_000);
    let t1 = rtask::read_timer();
    assert!(t1 - t0 >= 100_000_000);
}
