//! Minimal per-CPU control block.
//!
//! The full kernel tracks each CPU's GDT/TSS/syscall-entry state in a
//! page-aligned `ProcessorControlRegion` reached via `GS_BASE`. This crate
//! only needs the preemption bookkeeping that `PreemptGuard`,  `IrqMutex`
//! and `IrqRwLock` build on, so it tracks just that plus cpu-index/online
//! bookkeeping for the page allocator's per-CPU caches.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

pub const MAX_CPUS: usize = 256;

pub struct PerCpuControl {
    pub preempt_count: AtomicU32,
    pub reschedule_pending: AtomicU32,
    online: AtomicBool,
}

impl PerCpuControl {
    const fn new() -> Self {
        Self {
            preempt_count: AtomicU32::new(0),
            reschedule_pending: AtomicU32::new(0),
            online: AtomicBool::new(false),
        }
    }
}

static PER_CPU: [PerCpuControl; MAX_CPUS] = {
    const INIT: PerCpuControl = PerCpuControl::new();
    [INIT; MAX_CPUS]
};

/// Callback registered by CPU bring-up code to report the executing CPU's
/// index. Until one is registered, every CPU is treated as CPU 0 — correct
/// for single-core bring-up and for any test harness that never calls
/// `register_current_cpu_fn`.
static CURRENT_CPU_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

pub fn register_current_cpu_fn(f: fn() -> usize) {
    CURRENT_CPU_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
pub fn get_current_cpu() -> usize {
    let ptr = CURRENT_CPU_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only `register_current_cpu_fn` stores into CURRENT_CPU_FN, and
    // it only accepts `fn() -> usize`.
    let f: fn() -> usize = unsafe { core::mem::transmute(ptr) };
    f().min(MAX_CPUS - 1)
}

#[inline]
pub fn is_bsp() -> bool {
    get_current_cpu() == 0
}

pub fn mark_cpu_online(cpu_id: usize) {
    if cpu_id < MAX_CPUS {
        PER_CPU[cpu_id].online.store(true, Ordering::Release);
    }
}

pub fn mark_cpu_offline(cpu_id: usize) {
    if cpu_id < MAX_CPUS {
        PER_CPU[cpu_id].online.store(false, Ordering::Release);
    }
}

pub fn is_cpu_online(cpu_id: usize) -> bool {
    cpu_id < MAX_CPUS && PER_CPU[cpu_id].online.load(Ordering::Acquire)
}

/// Get the current CPU's control block.
///
/// # Safety
/// Callers must only touch fields meant for the owning CPU's context
/// (preemption accounting), matching the contract the full PCR provides.
#[inline]
pub unsafe fn current_pcr() -> &'static PerCpuControl {
    &PER_CPU[get_current_cpu()]
}
