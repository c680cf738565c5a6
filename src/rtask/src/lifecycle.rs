//! Task lifecycle: start, the worker trampoline, suspend/resume, delete,
//! and the per-thread current-task registry.
use std::cell::Cell;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::task::{Task, TaskCb, TaskInfo, TaskState};
use crate::threading;

thread_local! {
    /// Unowned back-reference to the task running on this thread.
    ///
    /// Written only by the trampoline. The slot must stay readable from the
    /// park signal handler, so it is const-initialized: no lazy allocation
    /// can happen on an access.
    static CURRENT_TASK: Cell<*const TaskCb> = const { Cell::new(ptr::null()) };
}

fn set_current(cb: &Arc<TaskCb>) {
    CURRENT_TASK.with(|slot| slot.set(Arc::as_ptr(cb)));
}

fn clear_current() {
    CURRENT_TASK.with(|slot| slot.set(ptr::null()));
}

fn is_current(cb: &Arc<TaskCb>) -> bool {
    CURRENT_TASK.with(|slot| slot.get()) == Arc::as_ptr(cb)
}

/// The task running on the calling thread, without any logging.
pub(crate) fn current() -> Option<Task> {
    let ptr = CURRENT_TASK.with(|slot| slot.get());
    if ptr.is_null() {
        return None;
    }
    // The slot is only non-null while the worker, which holds a strong
    // reference of its own, is between registration and exit; the calling
    // thread *is* that worker, so the pointer is valid here.
    unsafe {
        Arc::increment_strong_count(ptr);
        Some(Task {
            cb: Arc::from_raw(ptr),
        })
    }
}

/// The task record of the calling thread, or `None` when the thread was not
/// started through [`start_task`].
pub fn get_self() -> Option<Task> {
    let task = current();
    if task.is_none() {
        log::warn!("get_self called outside of a task");
    }
    task
}

/// Resolve an optional task argument, falling back to the calling thread's
/// own task.
fn task_or_self(task: Option<&Task>) -> Result<Task> {
    match task {
        Some(task) => Ok(task.clone()),
        None => current().ok_or_else(|| {
            log::error!("no target task and the calling thread does not run one");
            Error::NotPermitted
        }),
    }
}

/// Start a created task, running `entry` on a fresh detached worker thread.
///
/// Fails with [`Error::WouldBlock`] if the task has already been started.
/// `entry` and everything it captures move to the worker; a one-shot task is
/// done when `entry` returns.
pub fn start_task(task: &Task, entry: impl FnOnce() + Send + 'static) -> Result<()> {
    let cb = &task.cb;

    let prev = cb.state.load();
    if prev > TaskState::Ready {
        log::error!("start_task ({:?}): task has already been started", cb.name());
        return Err(Error::WouldBlock);
    }

    let attr = match cb.attr.lock().take() {
        Some(attr) => attr,
        None => {
            // A record reset by `delete_task` has no attribute block left.
            log::error!("start_task ({:?}): task is not initialized", cb.name());
            return Err(Error::WouldBlock);
        }
    };

    *cb.entry.lock() = Some(Box::new(entry));
    cb.state.store(TaskState::PendingStart);

    let arg = Arc::into_raw(Arc::clone(cb)) as *mut libc::c_void;
    // Safety: `arg` is a strong reference the trampoline takes over.
    match unsafe { threading::spawn_raw(&attr, trampoline, arg) } {
        Ok(handle) => {
            cb.thread.store(handle, Ordering::Release);
            log::trace!("start_task: {:?} pending start", cb.name());
            Ok(())
        }
        Err(e) => {
            // Reclaim the reference the thread never took, then undo the
            // state transition so the caller may retry.
            unsafe { drop(Arc::from_raw(arg as *const TaskCb)) };
            cb.entry.lock().take();
            *cb.attr.lock() = Some(attr);
            cb.state.store(prev);
            log::error!("start_task ({:?}): {}", cb.name(), e);
            Err(Error::Os(e))
        }
    }
}

/// Entry point of every worker thread; drives the state machine around the
/// user-supplied closure.
extern "C" fn trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    // Safety: takes over the strong reference produced by `start_task`.
    let cb = unsafe { Arc::from_raw(arg as *const TaskCb) };

    let state = cb.state.load();
    if state != TaskState::PendingStart && state != TaskState::Suspended {
        log::error!("trampoline: task handed over in state {:?}", state);
        std::process::exit(1);
    }

    if state == TaskState::Suspended || cb.start_suspended.load(Ordering::Acquire) {
        log::trace!(
            "trampoline: {:?} starts suspended, waiting for resume_task",
            cb.name()
        );
        cb.suspend.wait(|| cb.state.store(TaskState::Suspended));
        cb.start_suspended.store(false, Ordering::Release);
        if cb.stop.load(Ordering::Acquire) {
            cb.state.store(TaskState::Dead);
            return ptr::null_mut();
        }
    }

    let name = cb.name();
    if let Err(e) = threading::set_current_name(&name) {
        log::warn!("trampoline: could not set thread name {:?}: {}", name, e);
    }

    cb.pid.store(threading::gettid(), Ordering::Release);
    cb.thread
        .store(unsafe { libc::pthread_self() }, Ordering::Release);
    set_current(&cb);
    log::trace!(
        "trampoline: task {:?} started (pid {})",
        name,
        cb.pid.load(Ordering::Relaxed)
    );
    cb.state.store(TaskState::Running);

    let entry = cb.entry.lock().take();
    if let Some(entry) = entry {
        if catch_unwind(AssertUnwindSafe(entry)).is_err() {
            log::error!("trampoline: task {:?} panicked", name);
        }
    }

    cb.state.store(TaskState::Dead);
    clear_current();
    log::trace!("trampoline: task {:?} ended", name);
    ptr::null_mut()
}

/// Handler for [`threading::SIGNAL_PARK`]: serve every pending remote-park
/// request by blocking on the task's park socket.
extern "C" fn park_signal_handler(
    _signo: c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // Only async-signal-safe operations are allowed here: the raw TLS read,
    // atomics, and `recv` on the park socket.
    let ptr = CURRENT_TASK.with(|slot| slot.get());
    if ptr.is_null() {
        return;
    }
    let cb = unsafe { &*ptr };

    while cb.park_requests.load(Ordering::Acquire) != 0 {
        // Publish the Suspended state before consuming the request, so a
        // suspender that saw the request disappear also sees the state.
        cb.remote_parked.store(true, Ordering::Release);
        cb.state.store(TaskState::Suspended);
        cb.park_requests.fetch_sub(1, Ordering::AcqRel);
        cb.park.take_token();
        cb.remote_parked.store(false, Ordering::Release);
        cb.state.store(TaskState::Running);
    }
}

/// Park a running task from another thread: queue a park request and force
/// the target into the signal handler, then wait until it reports Suspended.
fn remote_suspend(cb: &Arc<TaskCb>) -> Result<()> {
    threading::ensure_park_handler(park_signal_handler);

    cb.park_requests.fetch_add(1, Ordering::Release);
    let handle = cb.thread.load(Ordering::Acquire);
    if let Err(e) = threading::kill_thread(handle, threading::SIGNAL_PARK) {
        cb.park_requests.fetch_sub(1, Ordering::Release);
        log::error!("suspend_task ({:?}): could not signal worker: {}", cb.name(), e);
        return Err(Error::Os(e));
    }

    // Wait until the handler has picked the request up. A worker that exits
    // before the signal lands never will, so give up once it is dead.
    while cb.park_requests.load(Ordering::Acquire) != 0 {
        if cb.state.load() >= TaskState::Dead {
            break;
        }
        std::thread::yield_now();
    }
    Ok(())
}

/// Suspend a task (`None` = the calling thread's task).
///
/// A task that has not started yet is marked to park inside the trampoline
/// before its entry runs. Suspending the calling thread's own task parks it
/// right here until [`resume_task`]; suspending another running task forces
/// it to park via the park signal. Already-suspended and dead tasks are
/// left alone.
pub fn suspend_task(task: Option<&Task>) -> Result<()> {
    let task = task_or_self(task)?;
    let cb = &task.cb;

    let state = cb.state.load();
    if state >= TaskState::Suspended {
        return Ok(());
    }
    if state <= TaskState::PendingStart {
        cb.start_suspended.store(true, Ordering::Release);
        return Ok(());
    }

    if is_current(cb) {
        cb.suspend.wait(|| cb.state.store(TaskState::Suspended));
        cb.state.store(TaskState::Running);
        if cb.stop.load(Ordering::Acquire) {
            return Err(Error::Canceled);
        }
        Ok(())
    } else {
        remote_suspend(cb)
    }
}

/// Resume a suspended task (`None` = the calling thread's task).
///
/// Every state other than Suspended is silently accepted; a resume that
/// races a not-yet-parked suspension is lost, as the permissive contract
/// allows.
pub fn resume_task(task: Option<&Task>) -> Result<()> {
    let task = task_or_self(task)?;
    let cb = &task.cb;

    if cb.state.load() == TaskState::Suspended {
        if cb.remote_parked.load(Ordering::Acquire) {
            if let Err(e) = cb.park.put_token() {
                log::error!("resume_task ({:?}): park token lost: {}", cb.name(), e);
                std::process::exit(1);
            }
        } else {
            cb.suspend.open();
        }
        log::trace!("resume_task: {:?} resumed", cb.name());
    }
    Ok(())
}

/// How long `delete_task` waits for a stop request to be honored before
/// falling back to forced cancellation.
const DELETE_GRACE: Duration = Duration::from_millis(500);

/// Delete a task (`None` = the calling thread's task). Idempotent.
///
/// A task that has not started is reset to its initial state. A started
/// task is asked to stop: the stop flag is raised and the worker is woken,
/// making its next library suspension point return [`Error::Canceled`] so
/// the entry closure can return. A worker that keeps running past the grace
/// period has its thread forcibly cancelled, which skips any cleanup the
/// worker would have performed.
pub fn delete_task(task: Option<&Task>) -> Result<()> {
    let task = task_or_self(task)?;
    let cb = &task.cb;

    let state = cb.state.load();
    if state >= TaskState::Dead {
        return Ok(());
    }
    if state <= TaskState::Ready {
        cb.reset();
        log::trace!("delete_task: {:?} reset before start", task.name());
        return Ok(());
    }

    cb.stop.store(true, Ordering::Release);

    if is_current(cb) {
        // A task deleting itself cannot be waited on here; its suspension
        // points now fail with Canceled and its entry is expected to return.
        return Ok(());
    }

    threading::ensure_wake_handler();
    let handle = cb.thread.load(Ordering::Acquire);
    let grace_end = Instant::now() + DELETE_GRACE;
    while cb.state.load() < TaskState::Dead {
        // Release the worker wherever it is parked or sleeping, every
        // iteration: it may reach a parking point only after the stop
        // request was posted.
        resume_task(Some(&task))?;
        let _ = threading::kill_thread(handle, threading::SIGNAL_WAKE);

        if Instant::now() >= grace_end {
            log::warn!(
                "delete_task: {:?} ignored the stop request, cancelling its thread",
                cb.name()
            );
            threading::cancel_thread(handle).map_err(Error::Os)?;
            cb.state.store(TaskState::Dead);
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    log::trace!("delete_task: {:?} deleted", cb.name());
    Ok(())
}

/// Snapshot a task's identity and state (`None` = the calling thread's task).
pub fn get_task_info(task: Option<&Task>) -> Result<TaskInfo> {
    let task = task_or_self(task)?;
    let cb = &task.cb;

    let cfg = cb.cfg.lock();
    Ok(TaskInfo {
        name: cfg.name.clone(),
        priority: cfg.priority,
        real_time: cfg.real_time,
        periodic: cb.periodic.load(Ordering::Acquire),
        pid: cb.pid.load(Ordering::Acquire),
        state: cb.state.load(),
    })
}
