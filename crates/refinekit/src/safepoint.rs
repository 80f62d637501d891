//! Stop-the-world pauses: a dedicated VM thread drains a queue of
//! operations, each executed with every mutator quiesced, plus the
//! suspendible-thread-set protocol that lets non-mutator workers cooperate
//! with pending pauses.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::threads::{self, ThreadState};

static AT_SAFEPOINT: AtomicBool = AtomicBool::new(false);

thread_local! {
    static IS_VM_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// True while a VM operation is executing with the world stopped.
#[inline]
pub fn is_at_safepoint() -> bool {
    AT_SAFEPOINT.load(Ordering::Acquire)
}

pub(crate) fn is_vm_thread() -> bool {
    IS_VM_THREAD.with(|flag| flag.get())
}

// Serializes stop-the-world pauses with mutator attach: a fresh mutator
// must not start running in the middle of a pause the VM thread has
// already rendezvoused.
static STW_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn attach_scope() -> MutexGuard<'static, ()> {
    STW_LOCK.lock()
}

struct VmOperation {
    name: &'static str,
    run: Box<dyn FnOnce() + Send>,
    done: flume::Sender<()>,
}

/// Handle to the dedicated VM thread.
pub(crate) struct VmThread {
    sender: flume::Sender<VmOperation>,
}

impl VmThread {
    pub(crate) fn spawn() -> Self {
        let (sender, receiver) = flume::unbounded();
        std::thread::Builder::new()
            .name("refinekit-vm".into())
            .spawn(move || vm_loop(receiver))
            .expect("failed to spawn the vm thread");
        Self { sender }
    }

    /// Runs `op` inside a stop-the-world pause on the VM thread and waits
    /// for it to complete. Callers must not be attached mutators: a mutator
    /// cannot be stopped for a pause it is itself waiting on.
    pub(crate) fn execute(&self, name: &'static str, op: impl FnOnce() + Send + 'static) {
        debug_assert!(
            threads::current().is_none(),
            "a mutator cannot wait for a vm operation"
        );
        let (done, done_recv) = flume::bounded(1);
        self.sender
            .send(VmOperation {
                name,
                run: Box::new(op),
                done,
            })
            .expect("vm thread terminated");
        done_recv.recv().expect("vm thread terminated");
    }
}

fn vm_loop(receiver: flume::Receiver<VmOperation>) {
    IS_VM_THREAD.with(|flag| flag.set(true));
    for op in receiver.iter() {
        let stw = STW_LOCK.lock();
        sts_synchronize();
        let stopped = block_all_mutators();
        AT_SAFEPOINT.store(true, Ordering::Release);
        log::debug!(
            target: "refinekit::safepoint",
            "safepoint begin: {} ({} mutators stopped)",
            op.name,
            stopped
        );
        (op.run)();
        AT_SAFEPOINT.store(false, Ordering::Release);
        unblock_all_mutators();
        sts_desynchronize();
        drop(stw);
        log::debug!(target: "refinekit::safepoint", "safepoint end: {}", op.name);
        let _ = op.done.send(());
    }
}

/// Drives every live mutator to a stopped state: request blocks
/// asynchronously first, then wait for the stragglers' rendezvous. Returns
/// the number of mutators stopped.
fn block_all_mutators() -> usize {
    let registry = crate::refinekit().threads();
    loop {
        let mut pending = Vec::new();
        for thread in registry.snapshot() {
            if thread.is_blocked() {
                continue;
            }
            let state = threads::block(&thread, true);
            if state != ThreadState::Terminated && !thread.is_blocked() {
                pending.push(thread);
            }
        }
        if pending.is_empty() {
            break;
        }
        for thread in pending {
            let _ = threads::block(&thread, false);
        }
    }
    registry
        .snapshot()
        .iter()
        .filter(|thread| thread.is_blocked())
        .count()
}

fn unblock_all_mutators() {
    for thread in crate::refinekit().threads().snapshot() {
        threads::unblock(&thread);
    }
}

// The suspendible thread set. Non-mutator workers that read mutator state
// (the refinement initiators) join the set around a synchronization episode;
// the VM thread waits for the set to drain before stopping the world and
// keeps `should_yield` raised while a pause is pending, telling joined
// workers to defer instead of spinning.

static STS_ARMED: AtomicBool = AtomicBool::new(false);

struct StsState {
    joined: usize,
    waiting: bool,
}

static STS_LOCK: Mutex<StsState> = Mutex::new(StsState {
    joined: 0,
    waiting: false,
});
static STS_CV: Condvar = Condvar::new();

thread_local! {
    static STS_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True while a stop-the-world pause is pending or active. Joined workers
/// should wind down (defer) promptly when this is raised.
#[inline]
pub fn should_yield() -> bool {
    STS_ARMED.load(Ordering::Relaxed)
}

pub(crate) fn is_current_thread_joined() -> bool {
    STS_DEPTH.with(|depth| depth.get()) > 0
}

/// Membership in the suspendible thread set for the current thread, held for
/// the scope of a synchronization episode. Joiners nest; the outermost join
/// blocks while a pause is in progress.
///
/// A mutator holding a joiner must not poll or park until it is dropped:
/// the pending pause is waiting for the set to drain.
pub struct StsJoiner {
    // not Send: the membership belongs to the constructing thread
    _not_send: std::marker::PhantomData<*const ()>,
}

impl StsJoiner {
    pub fn new() -> Self {
        STS_DEPTH.with(|depth| {
            if depth.get() == 0 {
                let mut state = STS_LOCK.lock();
                while state.waiting {
                    STS_CV.wait(&mut state);
                }
                state.joined += 1;
            }
            depth.set(depth.get() + 1);
        });
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Default for StsJoiner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StsJoiner {
    fn drop(&mut self) {
        STS_DEPTH.with(|depth| {
            depth.set(depth.get() - 1);
            if depth.get() == 0 {
                let mut state = STS_LOCK.lock();
                state.joined -= 1;
                if state.waiting && state.joined == 0 {
                    STS_CV.notify_all();
                }
            }
        });
    }
}

fn sts_synchronize() {
    STS_ARMED.store(true, Ordering::Relaxed);
    let mut state = STS_LOCK.lock();
    state.waiting = true;
    while state.joined > 0 {
        STS_CV.wait(&mut state);
    }
}

fn sts_desynchronize() {
    let mut state = STS_LOCK.lock();
    state.waiting = false;
    STS_ARMED.store(false, Ordering::Relaxed);
    STS_CV.notify_all();
}
