use std::sync::atomic;

/// Maps an integer type to its atomic counterpart, so that fields whose
/// width depends on libc type aliases (`pid_t`, `pthread_t`) can be declared
/// `Atomic<T>` without committing to a concrete atomic type.
pub trait HasAtomicEquivalent {
    type AtomicEquivalent;
}

impl HasAtomicEquivalent for i32 {
    type AtomicEquivalent = atomic::AtomicI32;
}
impl HasAtomicEquivalent for u32 {
    type AtomicEquivalent = atomic::AtomicU32;
}
impl HasAtomicEquivalent for u64 {
    type AtomicEquivalent = atomic::AtomicU64;
}
impl HasAtomicEquivalent for usize {
    type AtomicEquivalent = atomic::AtomicUsize;
}

pub type Atomic<T> = <T as HasAtomicEquivalent>::AtomicEquivalent;
