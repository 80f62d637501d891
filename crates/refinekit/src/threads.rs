//! Mutator threads and the machinery that lets the rest of the crate
//! coordinate with them: the per-thread state machine, the safepoint poll,
//! parked scopes for blocking/native sections, and the thread registry.
//!
//! A mutator's epoch slot is written by the thread itself at its
//! pre-existing synchronization points (the poll slow path and every
//! managed/unmanaged transition) and read by arbitrary initiators. The only
//! other writer is a remote thread holding a delegate-processing scope on a
//! parked target (see the `handshake` module) or the safepoint reset.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::epoch::{AtomicEpoch, Epoch};
use crate::handshake::{self, HandshakeState};
use crate::sync::{self, Monitor};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; participates in polls and epoch updates.
    Running = 0,
    /// In privileged/native code that does not synchronize with collectors.
    Parked = 1,
    /// Running, but asked to stop at its next poll.
    RunningToBlock = 2,
    /// Parked, and blocked in place before it may return to managed code.
    BlockedInParked = 3,
    Terminated = 4,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Running,
            1 => ThreadState::Parked,
            2 => ThreadState::RunningToBlock,
            3 => ThreadState::BlockedInParked,
            4 => ThreadState::Terminated,
            _ => unreachable!(),
        }
    }
}

impl ThreadState {
    pub fn is_parked(&self) -> bool {
        matches!(self, ThreadState::Parked | ThreadState::BlockedInParked)
    }
}

/// The concurrently accessible block of a mutator thread.
pub struct MutatorThread {
    name: String,
    /// Epoch slot: owner-written at sync points, remotely readable, and
    /// remotely writable only under a delegate-processing scope or at a
    /// safepoint.
    pub(crate) local_epoch: AtomicEpoch,
    state: AtomicU8,
    /// Non-zero when the next poll must take the slow path.
    pub(crate) take_poll: AtomicI8,
    should_block: AtomicBool,
    is_blocked: AtomicBool,
    pub(crate) is_about_to_terminate: AtomicBool,
    owner_id: AtomicU64,
    pub(crate) monitor: Monitor<()>,
    pub(crate) handshake: HandshakeState,
}

impl MutatorThread {
    fn new(name: String) -> Self {
        Self {
            name,
            local_epoch: AtomicEpoch::new(),
            state: AtomicU8::new(ThreadState::Running as _),
            take_poll: AtomicI8::new(0),
            should_block: AtomicBool::new(false),
            is_blocked: AtomicBool::new(false),
            is_about_to_terminate: AtomicBool::new(false),
            owner_id: AtomicU64::new(u64::MAX),
            monitor: Monitor::new(()),
            handshake: HandshakeState::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn local_epoch(&self) -> Epoch {
        self.local_epoch.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as _, Ordering::Relaxed);
    }

    pub(crate) fn attempt_state_transition(&self, old: ThreadState, new: ThreadState) -> bool {
        self.state
            .compare_exchange(old as _, new as _, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Transitions towards "must stop": `Running -> RunningToBlock`,
    /// `Parked -> BlockedInParked`, anything else unchanged.
    fn set_blocked_state(&self) -> ThreadState {
        loop {
            let old = self.state();
            let new = match old {
                ThreadState::Running => ThreadState::RunningToBlock,
                ThreadState::Parked => ThreadState::BlockedInParked,
                other => return other,
            };
            if self.attempt_state_transition(old, new) {
                return new;
            }
        }
    }

    #[inline]
    pub(crate) fn arm_poll(&self) {
        self.take_poll.store(1, Ordering::Relaxed);
    }

    /// Copies the current global epoch into this thread's slot.
    ///
    /// Must be called by the owning thread, outside of a safepoint. The
    /// acquire/release pair is the whole point: together with the epoch value
    /// an initiator acquiring the slot observes every store this thread
    /// issued before the update.
    #[inline]
    pub fn update_epoch_self(&self) {
        debug_assert!(
            !crate::safepoint::is_at_safepoint(),
            "mutator epoch update would race the safepoint reset"
        );
        debug_assert_eq!(
            self.owner_id.load(Ordering::Relaxed),
            sync::current_thread_id(),
            "update_epoch_self called from a foreign thread"
        );
        self.refresh_epoch();
    }

    /// Same as [`update_epoch_self`](Self::update_epoch_self), performed on
    /// the thread's behalf by a remote caller holding a delegate-processing
    /// scope that proves the owner is safely parked.
    #[inline]
    pub(crate) fn update_epoch_other(&self) {
        debug_assert!(self.state().is_parked());
        self.refresh_epoch();
    }

    #[inline]
    pub(crate) fn refresh_epoch(&self) {
        let epoch = crate::epoch::global_epoch();
        self.local_epoch.store(epoch, Ordering::Release);
    }

    /// Zeroes the epoch slot. Only the safepoint reset may do this; the
    /// owner is quiesced.
    pub(crate) fn reset_epoch(&self) {
        debug_assert!(crate::safepoint::is_at_safepoint());
        self.local_epoch.store(Epoch::ZERO, Ordering::Release);
    }

    fn request_block(&self) {
        if !self.is_blocked.load(Ordering::Relaxed) {
            self.should_block.store(true, Ordering::Relaxed);
        }
    }

    fn has_block_request(&self) -> bool {
        self.should_block.load(Ordering::Relaxed)
    }

    fn clear_block_request(&self) {
        self.should_block.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.is_blocked.load(Ordering::Relaxed)
    }

    fn set_blocked(&self, value: bool) {
        self.is_blocked.store(value, Ordering::Relaxed);
    }

    /// Turns a pending block request into the blocked state. Caller holds
    /// the thread's monitor. Returns true if a request was acknowledged, in
    /// which case the requester waiting on the monitor must be notified.
    fn acknowledge_block_request(&self) -> bool {
        if self.has_block_request() {
            self.set_blocked(true);
            self.clear_block_request();
            true
        } else {
            false
        }
    }
}

/// The registry of live mutator threads.
pub struct Threads {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
}

impl Threads {
    pub(crate) fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Visits every live mutator. The registry lock is held across the
    /// iteration, so the list is stable; visitors must not attach, detach or
    /// re-enter the registry.
    pub fn for_each_mutator(&self, mut f: impl FnMut(&Arc<MutatorThread>)) {
        let threads = self.threads.lock();
        for thread in threads.iter() {
            f(thread);
        }
    }

    pub fn mutator_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<MutatorThread>> {
        self.threads.lock().clone()
    }

    fn add(&self, thread: Arc<MutatorThread>) {
        self.threads.lock().push(thread);
    }

    fn remove(&self, thread: &Arc<MutatorThread>) {
        self.threads.lock().retain(|t| !Arc::ptr_eq(t, thread));
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<MutatorThread>>> = const { RefCell::new(None) };
}

/// The calling thread's mutator identity, if it is attached.
pub fn current() -> Option<Arc<MutatorThread>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Registers the calling OS thread as a mutator until the returned guard is
/// dropped.
pub fn attach(name: impl Into<String>) -> AttachedMutator {
    let name = name.into();
    assert!(
        current().is_none(),
        "thread is already attached as a mutator"
    );
    let thread = Arc::new(MutatorThread::new(name));
    {
        // Attaching is mutually exclusive with a stop-the-world pause; a
        // fresh mutator must not start running in the middle of one.
        let _stw = crate::safepoint::attach_scope();
        thread
            .owner_id
            .store(sync::current_thread_id(), Ordering::Relaxed);
        crate::refinekit().threads().add(thread.clone());
        thread.refresh_epoch();
    }
    CURRENT.with(|c| *c.borrow_mut() = Some(thread.clone()));
    log::trace!(
        target: "refinekit::threads",
        "attached mutator {} at epoch {}",
        thread.name(),
        thread.local_epoch()
    );
    AttachedMutator { thread }
}

/// Guard for an attached mutator; detaches on drop.
pub struct AttachedMutator {
    thread: Arc<MutatorThread>,
}

impl AttachedMutator {
    pub fn thread(&self) -> &Arc<MutatorThread> {
        &self.thread
    }
}

impl Drop for AttachedMutator {
    fn drop(&mut self) {
        let thread = &self.thread;
        {
            let guard = thread.monitor.lock_no_handshake();
            thread.is_about_to_terminate.store(true, Ordering::Release);
            // serve whatever was posted at us before we disappear
            handshake::process_pending(thread);
            thread.set_state(ThreadState::Terminated);
            thread.monitor.notify_all();
            drop(guard);
        }
        crate::refinekit().threads().remove(thread);
        CURRENT.with(|c| *c.borrow_mut() = None);
        log::trace!(target: "refinekit::threads", "detached mutator {}", thread.name());
    }
}

/// The safepoint poll. Cheap enough for a mutator's hot loop: a
/// thread-local read and one relaxed load on the fast path.
#[inline]
pub fn poll() {
    if let Some(thread) = current() {
        if thread.take_poll.load(Ordering::Relaxed) != 0 {
            poll_slow(&thread);
        }
    }
}

#[cold]
#[inline(never)]
fn poll_slow(thread: &Arc<MutatorThread>) {
    let guard = thread.monitor.lock_no_handshake();
    if thread.take_poll.load(Ordering::Relaxed) != 0 {
        thread.take_poll.store(0, Ordering::Relaxed);
        handshake::process_pending(thread);
        thread.update_epoch_self();
        check_block(thread);
    }
    drop(guard);
}

/// Checks whether the thread is supposed to stop, and if so stops it until
/// released. Acknowledged block requests are announced on the thread's
/// monitor because the requester waits there for the rendezvous. Leaves the
/// thread `Running`.
fn check_block(thread: &Arc<MutatorThread>) {
    let mut guard = thread.monitor.lock_no_handshake();
    loop {
        if thread.acknowledge_block_request() {
            thread.monitor.notify_all();
        }
        if !thread.is_blocked() {
            break;
        }
        guard.wait_no_handshake();
    }
    thread.set_state(ThreadState::Running);
    drop(guard);
}

/// Marks the calling mutator as executing privileged code that does not
/// synchronize with collectors (a blocking syscall, a long native section).
/// The thread performs its last epoch update on the way out; from here on
/// remote threads may update its slot through a delegate-processing scope.
pub fn enter_parked() {
    let thread = current().expect("enter_parked called on an unattached thread");
    thread.update_epoch_self();
    loop {
        let old = thread.state();
        if old == ThreadState::Running {
            if thread.attempt_state_transition(ThreadState::Running, ThreadState::Parked) {
                return;
            }
        } else {
            debug_assert_eq!(old, ThreadState::RunningToBlock);
            // A block request raced with parking: park as already blocked
            // and acknowledge, so the requester stops waiting for our poll.
            let guard = thread.monitor.lock_no_handshake();
            thread.set_state(ThreadState::BlockedInParked);
            if thread.acknowledge_block_request() {
                thread.monitor.notify_all();
            }
            drop(guard);
            return;
        }
    }
}

/// Returns the calling mutator to managed execution, blocking first if a
/// safepoint caught it while parked.
pub fn leave_parked() {
    let thread = current().expect("leave_parked called on an unattached thread");
    // The fast path may not race a delegate processor: a pending handshake
    // means one may be (or be about to start) working on our behalf, so
    // serialize through the monitor instead.
    let fast = !handshake::has_pending(&thread)
        && thread.attempt_state_transition(ThreadState::Parked, ThreadState::Running);
    if !fast {
        let guard = thread.monitor.lock_no_handshake();
        handshake::process_pending(&thread);
        drop(guard);
        check_block(&thread);
    }
    thread.update_epoch_self();
}

/// Runs `f` with the calling mutator parked.
pub fn parked_scope<R>(f: impl FnOnce() -> R) -> R {
    enter_parked();
    let result = f();
    leave_parked();
    result
}

/// Asks `thread` to stop at its next poll (or blocks it in place if it is
/// parked). With `asynchronous` the request is only posted; otherwise the
/// caller waits on the thread's monitor for the rendezvous. Returns the
/// state the thread was driven to.
pub(crate) fn block(thread: &Arc<MutatorThread>, asynchronous: bool) -> ThreadState {
    debug_assert!(
        current().map_or(true, |c| !Arc::ptr_eq(&c, thread)),
        "a thread must not request a block on itself"
    );
    let mut guard = thread.monitor.lock_no_handshake();
    if thread.is_about_to_terminate.load(Ordering::Relaxed) {
        return ThreadState::Terminated;
    }
    thread.request_block();
    thread.arm_poll();
    let new_state = thread.set_blocked_state();
    thread.monitor.notify_all();

    let mut result = new_state;
    match new_state {
        ThreadState::RunningToBlock if !asynchronous => {
            while thread.has_block_request()
                && !thread.is_blocked()
                && !thread.is_about_to_terminate.load(Ordering::Relaxed)
            {
                guard.wait_no_handshake();
            }
            result = if thread.is_about_to_terminate.load(Ordering::Relaxed) {
                ThreadState::Terminated
            } else {
                thread.state()
            };
        }
        ThreadState::BlockedInParked => {
            // We own the thread for now: it cannot return to managed code
            // until it gets past its monitor, so block it in place.
            thread.clear_block_request();
            thread.set_blocked(true);
        }
        _ => {}
    }
    drop(guard);
    result
}

/// Releases a thread stopped by [`block`].
pub(crate) fn unblock(thread: &Arc<MutatorThread>) {
    let guard = thread.monitor.lock_no_handshake();
    thread.clear_block_request();
    thread.set_blocked(false);
    thread.monitor.notify_all();
    drop(guard);
}
