//! # Quiescence-based deferred reclamation
//!
//! Shared objects that lock-free readers may still be looking at (page
//! metadata reached through a file's page table, mnodes reached through the
//! cache) are not destroyed when their last reference goes away. Their
//! destruction is queued here and only runs once every processor has passed a
//! quiescent point after the object was retired.
//!
//! The scheme is epoch based:
//!
//! ```text
//!   global epoch  e ──────────── e+1 ──────────── e+2
//!   retire(obj)   ▲ tagged e
//!   reader A      [── section pinned at e ──]
//!   advance                     ▲ all active slots at e
//!   reclaim                                       ▲ e + 2 <= global → run
//! ```
//!
//! A reader enters a [`QuiescentGuard`] section before dereferencing a raw
//! pointer it loaded from shared memory and leaves it before it could block.
//! The global epoch advances only when every processor inside a section has
//! observed the current epoch, so an object retired at epoch `e` cannot be
//! reachable by any reader once the epoch reaches `e + 2`.
//!
//! Slots tolerate being shared by several execution contexts (the count of
//! active sections is tracked, not a flag); a shared slot only ever pins an
//! older epoch, which delays reclamation but never hastens it.

use crate::SpinLock;
use crate::cpu::{CpuId, MAX_CPUS, current_cpu};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Queue length at which [`Quiescence::defer`] opportunistically reclaims.
const RECLAIM_BATCH: usize = 64;

type Task = Box<dyn FnOnce() + Send>;

struct Deferred {
    epoch: u64,
    task: Task,
}

#[repr(C, align(64))] // one cache line per processor
struct Slot {
    active: AtomicUsize,
    epoch: AtomicU64,
}

impl Slot {
    const fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }
}

/// A reclamation domain.
///
/// The kernel uses the global one behind [`enter`], [`defer`] and friends;
/// separate domains are useful for isolated tests.
pub struct Quiescence {
    epoch: AtomicU64,
    slots: [Slot; MAX_CPUS],
    deferred: SpinLock<Vec<Deferred>>,
}

impl Default for Quiescence {
    fn default() -> Self {
        Self::new()
    }
}

impl Quiescence {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            slots: [const { Slot::new() }; MAX_CPUS],
            deferred: SpinLock::new(Vec::new()),
        }
    }

    /// Current global epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Enters a section on the calling processor.
    pub fn enter(&self) -> QuiescentGuard<'_> {
        self.enter_on(current_cpu())
    }

    /// Enters a section accounted to `cpu`.
    pub fn enter_on(&self, cpu: CpuId) -> QuiescentGuard<'_> {
        let slot = &self.slots[cpu.as_usize()];
        if slot.active.fetch_add(1, Ordering::SeqCst) == 0 {
            slot.epoch
                .store(self.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        QuiescentGuard {
            slot,
            _not_send: PhantomData,
        }
    }

    /// Runs `task` once every processor has passed a quiescent point.
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let backlog = self.deferred.with_lock(|queue| {
            queue.push(Deferred {
                epoch,
                task: Box::new(task),
            });
            queue.len()
        });
        if backlog >= RECLAIM_BATCH {
            self.try_reclaim();
        }
    }

    /// Drops `object` once every processor has passed a quiescent point.
    pub fn retire<T: Send + 'static>(&self, object: Box<T>) {
        self.defer(move || drop(object));
    }

    /// Number of tasks still waiting for a grace period.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.deferred.with_lock(|queue| queue.len())
    }

    /// Advances the global epoch if every active slot has observed it.
    pub fn try_advance(&self) -> bool {
        let global = self.epoch.load(Ordering::SeqCst);
        let lagging = self.slots.iter().any(|slot| {
            slot.active.load(Ordering::SeqCst) != 0 && slot.epoch.load(Ordering::SeqCst) != global
        });
        if lagging {
            return false;
        }
        self.epoch
            .compare_exchange(global, global + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Tries to advance, then runs every task whose grace period has elapsed.
    ///
    /// Returns the number of tasks run. Tasks run outside the queue lock and
    /// may defer further work.
    pub fn try_reclaim(&self) -> usize {
        self.try_advance();
        let global = self.epoch.load(Ordering::SeqCst);
        let ready: Vec<Deferred> = self.deferred.with_lock(|queue| {
            let (ready, waiting): (Vec<Deferred>, Vec<Deferred>) = core::mem::take(queue)
                .into_iter()
                .partition(|d: &Deferred| d.epoch + 2 <= global);
            *queue = waiting;
            ready
        });
        let ran = ready.len();
        for deferred in ready {
            (deferred.task)();
        }
        ran
    }

    /// Waits for a full grace period and runs everything deferred so far,
    /// including work deferred by the tasks themselves.
    ///
    /// Must not be called from inside a section: the caller's own slot would
    /// keep the epoch from advancing.
    pub fn synchronize(&self) {
        loop {
            let target = self.epoch() + 2;
            while self.epoch() < target {
                if !self.try_advance() {
                    spin_loop();
                }
            }
            self.try_reclaim();
            if self.pending() == 0 {
                break;
            }
        }
    }
}

/// A section that does not cross a quiescent point.
///
/// Raw pointers loaded from shared structures stay dereferenceable while the
/// guard lives, even if the object's last reference is dropped concurrently.
pub struct QuiescentGuard<'a> {
    slot: &'a Slot,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for QuiescentGuard<'_> {
    fn drop(&mut self) {
        self.slot.active.fetch_sub(1, Ordering::SeqCst);
    }
}

static DOMAIN: Quiescence = Quiescence::new();

/// The kernel-wide reclamation domain.
#[must_use]
pub fn domain() -> &'static Quiescence {
    &DOMAIN
}

/// Enters a section on the kernel-wide domain.
pub fn enter() -> QuiescentGuard<'static> {
    DOMAIN.enter()
}

/// Defers `task` on the kernel-wide domain.
pub fn defer(task: impl FnOnce() + Send + 'static) {
    DOMAIN.defer(task);
}

/// Retires `object` on the kernel-wide domain.
pub fn retire<T: Send + 'static>(object: Box<T>) {
    DOMAIN.retire(object);
}

/// See [`Quiescence::synchronize`].
pub fn synchronize() {
    DOMAIN.synchronize();
}
