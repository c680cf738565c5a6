//! Thin wrappers over the POSIX threading, scheduling, and signalling
//! primitives the task engine is built on.
use core::mem::MaybeUninit;
use std::cell::UnsafeCell;
use std::os::raw::c_int;
use std::ptr;
use std::sync::Once;

use crate::error::{Error, Result};

/// Interpret a `-1`-on-failure return value, reading `errno` on failure.
pub(crate) fn ok_or_errno(x: c_int) -> core::result::Result<c_int, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

/// Interpret a pthread-style return value. The pthread functions report the
/// error number directly instead of setting `errno`.
pub(crate) fn ok_or_ret(x: c_int) -> core::result::Result<(), errno::Errno> {
    if x == 0 {
        Ok(())
    } else {
        Err(errno::Errno(x))
    }
}

/// The kernel thread id of the calling thread.
pub(crate) fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Set the OS-level name of the calling thread. The kernel caps thread names
/// at 15 bytes; longer names are rejected with `ERANGE`.
pub(crate) fn set_current_name(name: &str) -> core::result::Result<(), errno::Errno> {
    let cname = std::ffi::CString::new(name).map_err(|_| errno::Errno(libc::EINVAL))?;
    ok_or_ret(unsafe { libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr()) })
}

/// A `pthread_attr_t` block configured for one task, destroyed on drop.
pub(crate) struct ThreadAttr {
    raw: libc::pthread_attr_t,
}

// The block is plain configuration data; nothing in it is thread-affine.
unsafe impl Send for ThreadAttr {}

impl ThreadAttr {
    /// Initialize an attribute block with the detach state already set;
    /// detached workers release their resources as soon as they exit.
    pub fn new() -> Result<Self> {
        let mut raw = MaybeUninit::<libc::pthread_attr_t>::uninit();
        ok_or_ret(unsafe { libc::pthread_attr_init(raw.as_mut_ptr()) })?;
        let mut attr = Self {
            raw: unsafe { raw.assume_init() },
        };
        attr.set(|a| unsafe { libc::pthread_attr_setdetachstate(a, libc::PTHREAD_CREATE_DETACHED) })?;
        Ok(attr)
    }

    fn set(&mut self, f: impl FnOnce(*mut libc::pthread_attr_t) -> c_int) -> Result<()> {
        ok_or_ret(f(&mut self.raw)).map_err(Error::from)
    }

    /// Keep the creating thread's scheduler settings from being inherited.
    pub fn set_explicit_sched(&mut self) -> Result<()> {
        self.set(|a| unsafe { libc::pthread_attr_setinheritsched(a, libc::PTHREAD_EXPLICIT_SCHED) })
    }

    /// Select the priority-preemptive FIFO scheduling class.
    pub fn set_fifo_policy(&mut self) -> Result<()> {
        self.set(|a| unsafe { libc::pthread_attr_setschedpolicy(a, libc::SCHED_FIFO) })
    }

    pub fn set_priority(&mut self, priority: i32) -> Result<()> {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        self.set(|a| unsafe { libc::pthread_attr_setschedparam(a, &param) })
    }

    pub fn set_stack_size(&mut self, bytes: u64) -> Result<()> {
        self.set(|a| unsafe { libc::pthread_attr_setstacksize(a, bytes as libc::size_t) })
    }

    /// Pin the thread to exactly one CPU.
    pub fn pin_to_cpu(&mut self, cpu: usize) -> Result<()> {
        let mut set = unsafe { MaybeUninit::<libc::cpu_set_t>::zeroed().assume_init() };
        unsafe {
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
        }
        self.set(|a| unsafe {
            libc::pthread_attr_setaffinity_np(a, core::mem::size_of::<libc::cpu_set_t>(), &set)
        })
    }
}

impl Drop for ThreadAttr {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_attr_destroy(&mut self.raw) };
        if ret != 0 {
            log::warn!("pthread_attr_destroy: {}", errno::Errno(ret));
        }
    }
}

/// Start a detached native thread described by `attr`.
///
/// # Safety
///
/// `arg` must stay valid until `trampoline` is done with it; the trampoline
/// is responsible for releasing whatever `arg` refers to.
pub(crate) unsafe fn spawn_raw(
    attr: &ThreadAttr,
    trampoline: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
    arg: *mut libc::c_void,
) -> core::result::Result<libc::pthread_t, errno::Errno> {
    let mut handle: libc::pthread_t = unsafe { core::mem::zeroed() };
    ok_or_ret(unsafe { libc::pthread_create(&mut handle, &attr.raw, trampoline, arg) })?;
    Ok(handle)
}

pub(crate) fn kill_thread(handle: libc::pthread_t, signal: c_int) -> core::result::Result<(), errno::Errno> {
    ok_or_ret(unsafe { libc::pthread_kill(handle, signal) })
}

/// Forcibly cancel a thread. The target is terminated at its next
/// cancellation point without unwinding in an orderly way; resources it
/// holds at that moment are lost.
pub(crate) fn cancel_thread(handle: libc::pthread_t) -> core::result::Result<(), errno::Errno> {
    ok_or_ret(unsafe { libc::pthread_cancel(handle) })
}

struct GateInner {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    /// Guarded by `mutex`.
    resume_pending: UnsafeCell<bool>,
}

/// Condition-variable gate a task parks on while suspended.
///
/// Real-time tasks get a priority-inheritance mutex so that a high-priority
/// resumer is never stalled behind an unrelated medium-priority thread
/// holding the gate.
pub(crate) struct SuspendGate {
    // Boxed so the pthread objects never move after initialization.
    inner: Box<GateInner>,
}

unsafe impl Send for SuspendGate {}
unsafe impl Sync for SuspendGate {}

impl SuspendGate {
    pub fn new(priority_inheritance: bool) -> Result<Self> {
        let inner = Box::new(GateInner {
            mutex: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
            cond: UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
            resume_pending: UnsafeCell::new(false),
        });

        unsafe {
            ok_or_ret(libc::pthread_cond_init(inner.cond.get(), ptr::null()))?;

            if priority_inheritance {
                // The attribute block is a scoped value; the mutex keeps its
                // own copy of the protocol after initialization.
                let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
                ok_or_ret(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
                let ret = ok_or_ret(libc::pthread_mutexattr_setprotocol(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_PRIO_INHERIT,
                ))
                .and_then(|()| ok_or_ret(libc::pthread_mutex_init(inner.mutex.get(), attr.as_ptr())));
                libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                if let Err(e) = ret {
                    libc::pthread_cond_destroy(inner.cond.get());
                    return Err(e.into());
                }
            } else if let Err(e) = ok_or_ret(libc::pthread_mutex_init(inner.mutex.get(), ptr::null())) {
                libc::pthread_cond_destroy(inner.cond.get());
                return Err(e.into());
            }
        }

        Ok(Self { inner })
    }

    fn lock(&self) {
        let ret = unsafe { libc::pthread_mutex_lock(self.inner.mutex.get()) };
        if ret != 0 {
            log::error!("pthread_mutex_lock: {}", errno::Errno(ret));
            std::process::exit(1);
        }
    }

    fn unlock(&self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.inner.mutex.get()) };
        if ret != 0 {
            log::error!("pthread_mutex_unlock: {}", errno::Errno(ret));
            std::process::exit(1);
        }
    }

    /// Park the calling thread until another thread calls [`Self::open`].
    ///
    /// `on_locked` runs with the gate's mutex held, before the first wait;
    /// callers use it to publish the Suspended state without racing the
    /// matching `open`. A wait failure means the scheduler state is broken
    /// and terminates the process.
    pub fn wait(&self, on_locked: impl FnOnce()) {
        self.lock();
        on_locked();
        unsafe {
            while !*self.inner.resume_pending.get() {
                let ret = libc::pthread_cond_wait(self.inner.cond.get(), self.inner.mutex.get());
                if ret != 0 {
                    log::error!("pthread_cond_wait: {}", errno::Errno(ret));
                    self.unlock();
                    std::process::exit(1);
                }
            }
            *self.inner.resume_pending.get() = false;
        }
        self.unlock();
    }

    /// Release a thread parked in [`Self::wait`]. A signal failure means the
    /// scheduler state is broken and terminates the process.
    pub fn open(&self) {
        self.lock();
        let ret = unsafe {
            *self.inner.resume_pending.get() = true;
            libc::pthread_cond_signal(self.inner.cond.get())
        };
        self.unlock();
        if ret != 0 {
            log::error!("pthread_cond_signal: {}", errno::Errno(ret));
            std::process::exit(1);
        }
    }
}

impl Drop for SuspendGate {
    fn drop(&mut self) {
        unsafe {
            let ret = libc::pthread_cond_destroy(self.inner.cond.get());
            if ret != 0 {
                log::warn!("pthread_cond_destroy: {}", errno::Errno(ret));
            }
            let ret = libc::pthread_mutex_destroy(self.inner.mutex.get());
            if ret != 0 {
                log::warn!("pthread_mutex_destroy: {}", errno::Errno(ret));
            }
        }
    }
}

/// Byte-token socketpair a remotely-suspended task parks on.
///
/// `recv` is async-signal-safe, which makes it usable from the park signal
/// handler; the condition variable is not.
pub(crate) struct ParkSock {
    fds: [c_int; 2],
}

impl ParkSock {
    pub fn new() -> Result<Self> {
        let fds = unsafe {
            let mut fds = MaybeUninit::<[c_int; 2]>::uninit();
            ok_or_errno(libc::socketpair(
                libc::PF_LOCAL,
                libc::SOCK_STREAM,
                0,
                fds.as_mut_ptr() as *mut c_int,
            ))?;
            fds.assume_init()
        };
        Ok(Self { fds })
    }

    fn token_source(&self) -> c_int {
        self.fds[0]
    }

    fn token_sink(&self) -> c_int {
        self.fds[1]
    }

    /// Block until a resume token arrives. Runs inside the park signal
    /// handler, so only async-signal-safe calls are allowed here.
    pub fn take_token(&self) {
        loop {
            let mut token = 0u8;
            let n = unsafe {
                libc::recv(
                    self.token_source(),
                    (&mut token) as *mut u8 as *mut libc::c_void,
                    1,
                    0,
                )
            };
            match n {
                1 => break,
                0 => continue,
                _ => {
                    let e = errno::errno();
                    if e.0 == libc::EINTR || e.0 == libc::EAGAIN {
                        continue;
                    }
                    // Losing the park socket means the suspend protocol is
                    // broken beyond repair.
                    unsafe { libc::abort() };
                }
            }
        }
    }

    /// Make one resume token available.
    pub fn put_token(&self) -> core::result::Result<(), errno::Errno> {
        let token = 0u8;
        let n = unsafe {
            libc::send(
                self.token_sink(),
                (&token) as *const u8 as *const libc::c_void,
                1,
                0,
            )
        };
        if n == 1 {
            Ok(())
        } else {
            Err(errno::errno())
        }
    }
}

impl Drop for ParkSock {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fds[0]);
            libc::close(self.fds[1]);
        }
    }
}

/// Signal used to force a task to park (remote suspension).
pub(crate) const SIGNAL_PARK: c_int = libc::SIGUSR1;
/// Signal used to interrupt a task's absolute sleep (stop requests).
pub(crate) const SIGNAL_WAKE: c_int = libc::SIGUSR2;

/// Register the remote-park signal handler (idempotent).
pub(crate) fn ensure_park_handler(
    handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void),
) {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = handler as libc::sighandler_t;
        // `SA_SIGINFO`: the handler uses the three-parameter signature.
        // `SA_RESTART` is deliberately absent so an interrupted absolute
        // sleep returns `EINTR` instead of resuming transparently.
        sa.sa_flags = libc::SA_SIGINFO;
        if libc::sigaction(SIGNAL_PARK, &sa, ptr::null_mut()) != 0 {
            log::error!("sigaction(SIGUSR1): {}", errno::errno());
            std::process::exit(1);
        }
    });
}

extern "C" fn wake_handler(_signo: c_int) {
    // Nothing to do; delivery alone interrupts a blocking call. A handler
    // (rather than `SIG_IGN`) is required for that interruption to happen.
}

/// Register the no-op wake signal handler (idempotent).
pub(crate) fn ensure_wake_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = wake_handler as usize as libc::sighandler_t;
        sa.sa_flags = 0;
        if libc::sigaction(SIGNAL_WAKE, &sa, ptr::null_mut()) != 0 {
            log::error!("sigaction(SIGUSR2): {}", errno::errno());
            std::process::exit(1);
        }
    });
}

extern "C" fn termination_notice_handler(_signo: c_int) {
    // Only async-signal-safe calls are allowed here; write(2) qualifies,
    // the logging facade does not.
    let msg = b"rtask: termination signal received\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// Route `SIGTERM`/`SIGINT` to a notice handler instead of the default
/// process kill, leaving shutdown policy to the application.
pub(crate) fn install_termination_notice_handlers() {
    unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = termination_notice_handler as usize as libc::sighandler_t;
        sa.sa_flags = 0;
        for sig in [libc::SIGTERM, libc::SIGINT] {
            if libc::sigaction(sig, &sa, ptr::null_mut()) != 0 {
                log::error!("sigaction({}): {}", sig, errno::errno());
                std::process::exit(1);
            }
        }
    }
}

/// Restore the default disposition of every signal the library rewired.
pub(crate) fn restore_default_handlers() {
    unsafe {
        for sig in [libc::SIGTERM, libc::SIGINT, SIGNAL_WAKE] {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn attr_builds_and_destroys() {
        let mut attr = ThreadAttr::new().unwrap();
        attr.set_stack_size(256 * 1024).unwrap();
        attr.pin_to_cpu(0).unwrap();
    }

    #[test]
    fn gate_blocks_until_opened() {
        let gate = Arc::new(SuspendGate::new(false).unwrap());
        let parked = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));

        let gate2 = Arc::clone(&gate);
        let parked2 = Arc::clone(&parked);
        let released2 = Arc::clone(&released);
        let child = thread::spawn(move || {
            gate2.wait(|| parked2.store(true, Ordering::Relaxed));
            released2.store(true, Ordering::Relaxed);
        });

        while !parked.load(Ordering::Relaxed) {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::Relaxed));

        gate.open();
        child.join().unwrap();
        assert!(released.load(Ordering::Relaxed));
    }

    #[test]
    fn gate_open_before_wait_is_not_lost() {
        let gate = SuspendGate::new(false).unwrap();
        gate.open();
        // The pending resume lets this wait return immediately.
        gate.wait(|| {});
    }

    #[test]
    fn park_sock_passes_tokens() {
        let sock = ParkSock::new().unwrap();
        sock.put_token().unwrap();
        sock.take_token();
    }

    #[test]
    fn pi_gate_round_trip() {
        let gate = SuspendGate::new(true).unwrap();
        gate.open();
        gate.wait(|| {});
    }
}
