//! Periodic-release timing: deadline programming and the absolute-deadline
//! wait with overrun accounting.
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::lifecycle::current;
use crate::task::{Task, TaskState};
use crate::time::{self, ns_to_ts, read_timer, RtTime};

/// First-release time for [`set_task_period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTime {
    /// Release relative to the current monotonic time.
    Now,
    /// Release relative to the given monotonic timestamp, in nanoseconds.
    At(RtTime),
}

/// Make a task periodic (`None` = the calling thread's task).
///
/// The first release deadline is `start + period_ns`; every successful
/// [`wait_next_period`] advances it by exactly one period. Only callable
/// before the task starts running.
pub fn set_task_period(task: Option<&Task>, start: StartTime, period_ns: RtTime) -> Result<()> {
    let task = match task {
        Some(task) => task.clone(),
        None => match current() {
            Some(task) => task,
            None => {
                log::error!("set_task_period: no target task");
                return Err(Error::WouldBlock);
            }
        },
    };
    let cb = &task.cb;

    if cb.state.load() > TaskState::PendingStart {
        log::error!(
            "set_task_period ({:?}): task is already running",
            cb.name()
        );
        return Err(Error::WouldBlock);
    }
    if period_ns == 0 {
        log::error!("set_task_period ({:?}): period must be non-zero", cb.name());
        return Err(Error::InvalidArgument);
    }

    let mut first = match start {
        StartTime::Now => time::clock_now().map_err(|e| {
            log::error!("set_task_period ({:?}): {}", cb.name(), e);
            e
        })?,
        StartTime::At(ns) => ns_to_ts(ns),
    };
    first.add_ns(period_ns);

    *cb.deadline.lock() = first;
    cb.period_ns.store(period_ns, Ordering::Relaxed);
    cb.periodic.store(true, Ordering::Release);

    log::trace!(
        "set_task_period: {:?} period {} ns, first deadline {}.{:09}",
        cb.name(),
        period_ns,
        first.sec,
        first.nsec
    );
    Ok(())
}

/// Sleep until the calling task's next release deadline.
///
/// Callable only from inside a periodic worker. On an on-time wake the
/// counter behind `overruns` (when given) is reset to zero. When the wake
/// lands past the *next* deadline the call counts one overrun and returns
/// [`Error::TimedOut`]; the deadline still advances by exactly one period,
/// so persistent overruns accumulate lateness instead of resynchronizing.
/// Returns [`Error::Canceled`] once the task has been asked to stop.
pub fn wait_next_period(overruns: Option<&mut u64>) -> Result<()> {
    let task = match current() {
        Some(task) => task,
        None => return Err(Error::WouldBlock),
    };
    let cb = &task.cb;
    if !cb.periodic.load(Ordering::Acquire) {
        return Err(Error::WouldBlock);
    }
    let name = cb.name();

    let deadline = *cb.deadline.lock();
    loop {
        cb.state.store(TaskState::Waiting);
        match time::sleep_until(deadline) {
            Ok(()) => {
                cb.state.store(TaskState::Ready);
                break;
            }
            Err(e) if e.0 == libc::EINTR => {
                // Interrupted: a stop request, a remote suspension that has
                // already been served, or an unrelated signal.
                if cb.stop.load(Ordering::Acquire) {
                    cb.state.store(TaskState::Running);
                    return Err(Error::Canceled);
                }
                continue;
            }
            Err(e) => {
                log::warn!("wait_next_period ({:?}): {}", name, e);
                log::warn!(
                    "wait_next_period ({:?}): continuing with the next release",
                    name
                );
                break;
            }
        }
    }

    // Program the next release.
    let next = {
        let mut deadline = cb.deadline.lock();
        deadline.add_ns(cb.period_ns.load(Ordering::Relaxed));
        *deadline
    };

    let now = ns_to_ts(read_timer());
    let result = if now > next {
        match overruns {
            Some(count) => {
                *count += 1;
                log::warn!("wait_next_period ({:?}): overrun (count={})", name, count);
            }
            None => log::warn!("wait_next_period ({:?}): overrun", name),
        }
        Err(Error::TimedOut)
    } else {
        if let Some(count) = overruns {
            *count = 0;
        }
        Ok(())
    };

    cb.state.store(TaskState::Running);
    result
}
