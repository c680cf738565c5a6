//! Priority-preemptive real-time task management on POSIX threads.
//!
//! This crate binds the host's priority-based scheduler and monotonic clock
//! into a small task model: named worker tasks, one-shot or strictly
//! periodic, each pinned to a single CPU and optionally real-time with a
//! fixed `SCHED_FIFO` priority. It provides the task lifecycle (create,
//! start, suspend, resume, delete), absolute-deadline periodic waits with
//! overrun accounting, and utility timing primitives.
//!
//! # Example
//!
//! ```no_run
//! use rtask::{StackSize, StartTime};
//!
//! rtask::init();
//!
//! let task = rtask::create_rt("cycle", StackSize::Default, 80).unwrap();
//! rtask::set_task_period(Some(&task), StartTime::Now, 1_000_000).unwrap();
//! rtask::start_task(&task, || loop {
//!     match rtask::wait_next_period(None) {
//!         Ok(()) | Err(rtask::Error::TimedOut) => { /* one release */ }
//!         Err(_) => break,
//!     }
//! })
//! .unwrap();
//! ```
//!
//! Real-time tasks need the `CAP_SYS_NICE` capability (or root) to start;
//! everything else works unprivileged.
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(not(target_os = "linux"))]
compile_error!(
    "this crate requires a Linux host (SCHED_FIFO threads, per-thread CPU \
     affinity, and absolute monotonic sleeps)"
);

mod error;
mod lifecycle;
pub mod logger;
mod periodic;
mod task;
mod threading;
mod time;
mod utils;

pub use error::{Error, Result};
pub use lifecycle::{delete_task, get_self, get_task_info, resume_task, start_task, suspend_task};
pub use periodic::{set_task_period, wait_next_period, StartTime};
pub use task::{
    create_nrt, create_rt, set_cpu_affinity, spawn_nrt, spawn_rt, StackSize, Task, TaskInfo,
    TaskState, DEFAULT_STKSIZE, LIM_PRIORITY_HI, LIM_PRIORITY_LO, MAX_NAME_LENGTH,
};
pub use time::{ns_to_ts, read_timer, spin_timer, ts_to_ns, RtTime, TimeSpec, NANOSEC_PER_SEC};

use once_cell::sync::Lazy;
use std::sync::Once;

static INIT: Once = Once::new();

/// One-time library setup: install the log sink, announce the library,
/// route termination signals to a notice handler, and pre-register the
/// worker wake signal. Idempotent.
///
/// The library stays usable without this call; the signal handlers the
/// suspend and delete paths rely on are registered lazily on first use.
pub fn init() {
    INIT.call_once(|| {
        logger::init_logger(true);
        log::info!(
            "loading {} v{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        threading::install_termination_notice_handlers();
        threading::ensure_wake_handler();
        // Leave the logging toggle to the application.
        logger::set_verbose(false);
    });
}

/// Undo the signal wiring of [`init`] and announce the teardown.
pub fn teardown() {
    logger::set_verbose(true);
    threading::restore_default_handlers();
    log::info!("{} unloaded", env!("CARGO_PKG_NAME"));
}

/// Number of CPUs available to the process.
pub fn available_cpus() -> usize {
    static CPUS: Lazy<usize> = Lazy::new(|| {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n < 1 {
            1
        } else {
            n as usize
        }
    });
    *CPUS
}

/// Lock all current and future pages into RAM (`mlockall`).
///
/// Real-time applications call this once at startup so page faults cannot
/// stall a deadline later.
pub fn lock_all_memory() -> Result<()> {
    threading::ok_or_errno(unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) })
        .map(drop)
        .map_err(Error::from)
}
