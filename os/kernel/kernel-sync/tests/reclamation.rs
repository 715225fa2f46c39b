//! Lock-free readers racing the last reference drop.

use kernel_sync::cpu::{CpuId, install_cpu_source};
use kernel_sync::{RefCount, Referenced, Sref, quiesce};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

thread_local! {
    static CPU: Cell<u16> = const { Cell::new(0) };
}

fn thread_cpu() -> CpuId {
    CpuId::new(CPU.with(Cell::get))
}

fn on_cpu(id: u16) {
    install_cpu_source(thread_cpu);
    CPU.with(|c| c.set(id));
}

static FREED: AtomicUsize = AtomicUsize::new(0);

struct Node {
    rc: RefCount,
    payload: u64,
}

impl Drop for Node {
    fn drop(&mut self) {
        // A reclaimed node must never be read again; poison it.
        self.payload = 0xdead;
        FREED.fetch_add(1, Ordering::SeqCst);
    }
}

unsafe impl Referenced for Node {
    fn refcount(&self) -> &RefCount {
        &self.rc
    }
}

fn node(payload: u64) -> Sref<Node> {
    Sref::new(Node {
        rc: RefCount::new(),
        payload,
    })
}

#[test]
fn retired_object_survives_until_grace_period() {
    on_cpu(0);
    let n = node(5);
    let raw = Sref::as_ptr(&n);
    let before = FREED.load(Ordering::SeqCst);

    let guard = quiesce::enter();
    drop(n);
    // Dead but not reclaimed: the raw pointer is still readable.
    assert!(unsafe { Sref::try_upgrade(raw) }.is_none());
    assert_eq!(unsafe { raw.as_ref() }.payload, 5);
    drop(guard);

    quiesce::synchronize();
    assert!(FREED.load(Ordering::SeqCst) > before);
}

#[test]
fn readers_never_observe_reclaimed_payload() {
    const WRITERS: u16 = 2;
    const READERS: u16 = 4;
    const ROUNDS: u64 = 2_000;

    let slot = Arc::new(AtomicPtr::new(Sref::into_raw(node(1)).as_ptr()));
    let start = Arc::new(Barrier::new(usize::from(WRITERS + READERS)));
    let done = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let slot = Arc::clone(&slot);
        let start = Arc::clone(&start);
        let done = Arc::clone(&done);
        handles.push(thread::spawn(move || {
            on_cpu(w);
            start.wait();
            for round in 1..=ROUNDS {
                let fresh = Sref::into_raw(node(round));
                let old = slot.swap(fresh.as_ptr(), Ordering::AcqRel);
                drop(unsafe { Sref::from_raw(NonNull::new(old).unwrap()) });
                quiesce::domain().try_reclaim();
            }
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for r in 0..READERS {
        let slot = Arc::clone(&slot);
        let start = Arc::clone(&start);
        let done = Arc::clone(&done);
        handles.push(thread::spawn(move || {
            on_cpu(WRITERS + r);
            start.wait();
            while done.load(Ordering::SeqCst) < usize::from(WRITERS) {
                let _guard = quiesce::enter();
                let raw = NonNull::new(slot.load(Ordering::Acquire)).unwrap();
                if let Some(strong) = unsafe { Sref::try_upgrade(raw) } {
                    assert_ne!(strong.payload, 0xdead);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let last = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
    drop(unsafe { Sref::from_raw(NonNull::new(last).unwrap()) });
    quiesce::synchronize();
    assert_eq!(quiesce::domain().pending(), 0);
}
