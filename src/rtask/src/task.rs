//! Task records and the task factory.
use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::error::{Error, Result};
use crate::lifecycle;
use crate::threading::{ParkSock, SuspendGate, ThreadAttr};
use crate::time::TimeSpec;
use crate::utils::Atomic;

/// Default task stack size (64 KiB), used whenever the caller requests
/// [`StackSize::Default`] or asks for less than the platform minimum.
pub const DEFAULT_STKSIZE: u64 = 65536;

/// Name capacity in bytes, counting the C-style terminator slot; effective
/// names are one byte shorter.
pub const MAX_NAME_LENGTH: usize = 32;

/// Exclusive lower bound of the accepted real-time priority range.
pub const LIM_PRIORITY_LO: i32 = 0;

/// Inclusive upper bound of the accepted real-time priority range.
pub const LIM_PRIORITY_HI: i32 = 99;

/// Stack sizing request for the task factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSize {
    /// Use [`DEFAULT_STKSIZE`].
    Default,
    /// Use the given size, falling back to the default when the value is
    /// zero or below the platform minimum.
    Bytes(u64),
}

/// Task state machine.
///
/// The ordering is meaningful: states up to [`TaskState::Ready`] mean the
/// task has not started, and [`TaskState::Dead`] is terminal. Comparisons
/// like `state <= Ready` appear throughout the lifecycle code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum TaskState {
    Unknown = 0,
    Init,
    Ready,
    PendingStart,
    Waiting,
    Running,
    Suspended,
    Dead,
}

/// [`TaskState`] cell with release stores and acquire loads, so state
/// transitions published by one thread are observable from any other.
pub(crate) struct AtomicState(AtomicU32);

impl AtomicState {
    fn new(state: TaskState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub fn load(&self) -> TaskState {
        match self.0.load(Ordering::Acquire) {
            1 => TaskState::Init,
            2 => TaskState::Ready,
            3 => TaskState::PendingStart,
            4 => TaskState::Waiting,
            5 => TaskState::Running,
            6 => TaskState::Suspended,
            7 => TaskState::Dead,
            _ => TaskState::Unknown,
        }
    }

    pub fn store(&self, state: TaskState) {
        self.0.store(state as u32, Ordering::Release);
    }
}

/// The caller-visible configuration of a task.
pub(crate) struct TaskCfg {
    pub name: String,
    pub priority: i32,
    pub real_time: bool,
    pub stack_size: u64,
    pub cpu: usize,
}

impl Default for TaskCfg {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: 0,
            real_time: false,
            stack_size: DEFAULT_STKSIZE,
            cpu: 0,
        }
    }
}

/// Task control block: everything shared between the owning handle, the
/// worker thread, and lifecycle calls made from other threads.
pub(crate) struct TaskCb {
    /// Factory-time configuration; mutable only before the first start and
    /// by the pre-start `delete_task` reset, so a spinlock is sufficient.
    pub cfg: SpinMutex<TaskCfg>,
    pub state: AtomicState,
    /// Kernel thread id, captured by the trampoline on first scheduling.
    pub pid: Atomic<libc::pid_t>,
    pub thread: Atomic<libc::pthread_t>,
    /// Pre-built thread attributes, consumed (and destroyed) by start.
    pub attr: SpinMutex<Option<ThreadAttr>>,
    /// The task's entry closure, taken by the trampoline.
    pub entry: SpinMutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    pub periodic: AtomicBool,
    pub period_ns: AtomicU64,
    /// Absolute next-release instant; touched by `set_task_period` before
    /// start and by the worker afterwards.
    pub deadline: SpinMutex<TimeSpec>,
    pub suspend: SuspendGate,
    pub start_suspended: AtomicBool,
    pub park: ParkSock,
    pub park_requests: AtomicUsize,
    pub remote_parked: AtomicBool,
    /// Cooperative-cancellation flag, checked at library suspension points.
    pub stop: AtomicBool,
}

impl TaskCb {
    pub fn name(&self) -> String {
        self.cfg.lock().name.clone()
    }

    /// Return the record to its just-initialized state.
    pub fn reset(&self) {
        *self.cfg.lock() = TaskCfg::default();
        self.attr.lock().take();
        self.entry.lock().take();
        self.periodic.store(false, Ordering::Relaxed);
        self.period_ns.store(0, Ordering::Relaxed);
        *self.deadline.lock() = TimeSpec::default();
        self.start_suspended.store(false, Ordering::Relaxed);
        self.stop.store(false, Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
        self.state.store(TaskState::Init);
    }
}

/// Handle to a task.
///
/// Clones refer to the same underlying task; the last handle (including the
/// one held by a running worker) releases the task's synchronization
/// objects when dropped.
#[derive(Clone)]
pub struct Task {
    pub(crate) cb: Arc<TaskCb>,
}

impl Task {
    /// Do `self` and `other` refer to the same task?
    pub fn is_same(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.cb, &other.cb)
    }

    pub fn name(&self) -> String {
        self.cb.name()
    }

    pub fn state(&self) -> TaskState {
        self.cb.state.load()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Snapshot of a task's identity and scheduling classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub priority: i32,
    pub real_time: bool,
    pub periodic: bool,
    pub pid: libc::pid_t,
    pub state: TaskState,
}

fn create_task(
    name: &str,
    stack_size: StackSize,
    priority: i32,
    real_time: bool,
) -> Result<Task> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH - 1 {
        log::error!(
            "create task: name must be 1..={} bytes",
            MAX_NAME_LENGTH - 1
        );
        return Err(Error::InvalidArgument);
    }

    let mut attr = ThreadAttr::new()?;

    if real_time {
        attr.set_explicit_sched()?;
        attr.set_fifo_policy()?;
        if !(priority > LIM_PRIORITY_LO && priority <= LIM_PRIORITY_HI) {
            log::error!(
                "create task {:?}: priority must be within {}..={}",
                name,
                LIM_PRIORITY_LO + 1,
                LIM_PRIORITY_HI
            );
            return Err(Error::InvalidArgument);
        }
        attr.set_priority(priority)?;
    }

    // First CPU as the default; can be re-pinned until the task starts.
    attr.pin_to_cpu(0)?;

    let stack = match stack_size {
        StackSize::Bytes(n) if n >= libc::PTHREAD_STACK_MIN as u64 => n,
        _ => DEFAULT_STKSIZE,
    };
    attr.set_stack_size(stack)?;

    let suspend = SuspendGate::new(real_time)?;
    let park = ParkSock::new()?;

    Ok(Task {
        cb: Arc::new(TaskCb {
            cfg: SpinMutex::new(TaskCfg {
                name: name.to_owned(),
                priority: if real_time { priority } else { 0 },
                real_time,
                stack_size: stack,
                cpu: 0,
            }),
            state: AtomicState::new(TaskState::Ready),
            pid: Atomic::<libc::pid_t>::new(0),
            thread: Atomic::<libc::pthread_t>::new(0),
            attr: SpinMutex::new(Some(attr)),
            entry: SpinMutex::new(None),
            periodic: AtomicBool::new(false),
            period_ns: AtomicU64::new(0),
            deadline: SpinMutex::new(TimeSpec::default()),
            suspend,
            start_suspended: AtomicBool::new(false),
            park,
            park_requests: AtomicUsize::new(0),
            remote_parked: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }),
    })
}

/// Create a real-time task scheduled under priority-preemptive FIFO at the
/// fixed `priority`, which must lie in
/// `LIM_PRIORITY_LO + 1..=LIM_PRIORITY_HI`.
pub fn create_rt(name: &str, stack_size: StackSize, priority: i32) -> Result<Task> {
    match create_task(name, stack_size, priority, true) {
        Ok(task) => {
            log::trace!("created RT task {:?} (priority {})", name, priority);
            Ok(task)
        }
        Err(e) => {
            log::error!("create RT task {:?}: {}", name, e);
            Err(e)
        }
    }
}

/// Create a task scheduled under the OS default time-sharing policy.
pub fn create_nrt(name: &str, stack_size: StackSize) -> Result<Task> {
    match create_task(name, stack_size, 0, false) {
        Ok(task) => {
            log::trace!("created NRT task {:?}", name);
            Ok(task)
        }
        Err(e) => {
            log::error!("create NRT task {:?}: {}", name, e);
            Err(e)
        }
    }
}

/// [`create_rt`] followed by [`crate::start_task`].
///
/// A failed start leaves the record as `create_rt` built it; there is no
/// structural rollback.
pub fn spawn_rt(
    name: &str,
    stack_size: StackSize,
    priority: i32,
    entry: impl FnOnce() + Send + 'static,
) -> Result<Task> {
    let task = create_rt(name, stack_size, priority)?;
    lifecycle::start_task(&task, entry)?;
    log::trace!("spawned RT task {:?} (priority {})", name, priority);
    Ok(task)
}

/// [`create_nrt`] followed by [`crate::start_task`].
pub fn spawn_nrt(
    name: &str,
    stack_size: StackSize,
    entry: impl FnOnce() + Send + 'static,
) -> Result<Task> {
    let task = create_nrt(name, stack_size)?;
    lifecycle::start_task(&task, entry)?;
    log::trace!("spawned NRT task {:?}", name);
    Ok(task)
}

/// Re-pin a not-yet-started task to the single CPU `cpu`.
pub fn set_cpu_affinity(task: &Task, cpu: usize) -> Result<()> {
    let cb = &task.cb;
    if cb.state.load() > TaskState::Ready {
        log::error!(
            "set_cpu_affinity ({:?}): must be called before the task starts",
            cb.name()
        );
        return Err(Error::NotPermitted);
    }
    if cpu >= crate::available_cpus() {
        log::error!(
            "set_cpu_affinity ({:?}): cpu {} is beyond the {} available",
            cb.name(),
            cpu,
            crate::available_cpus()
        );
        return Err(Error::InvalidArgument);
    }

    let mut attr = cb.attr.lock();
    match attr.as_mut() {
        Some(attr) => attr.pin_to_cpu(cpu)?,
        // The attribute block is gone once the task has started.
        None => return Err(Error::NotPermitted),
    }
    drop(attr);

    cb.cfg.lock().cpu = cpu;
    log::trace!("set_cpu_affinity: task {:?} pinned to cpu {}", cb.name(), cpu);
    Ok(())
}
