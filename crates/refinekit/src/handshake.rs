//! Asynchronous one-shot handshakes against mutator threads.
//!
//! A handshake is a no-op callable posted at a target. It runs either on the
//! target's next poll, or immediately on the poster's side through a
//! *delegate-processing scope* when the target is safely parked. Its value
//! is not the callable itself but the synchronization point its processing
//! implies: every processing path refreshes the target's epoch slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::threads::MutatorThread;

type HandshakeOp = Box<dyn FnOnce(&MutatorThread) + Send>;

/// Per-thread handshake slot, embedded in the thread's concurrently
/// accessible block.
pub struct HandshakeState {
    op: Mutex<Option<HandshakeOp>>,
    /// Mirrors `op.is_some()` for lock-free probing. On the delegate path
    /// the flag is cleared with `Release` only after the target's epoch was
    /// written, so an owner observing `false` with `Acquire` knows no
    /// delegate is still writing on its behalf.
    pending: AtomicBool,
}

impl HandshakeState {
    pub(crate) fn new() -> Self {
        Self {
            op: Mutex::new(None),
            pending: AtomicBool::new(false),
        }
    }
}

/// Whether `thread` has a posted handshake that has not run yet.
#[inline]
pub fn has_pending(thread: &MutatorThread) -> bool {
    thread.handshake.pending.load(Ordering::Acquire)
}

/// Outcome of a delegate-processing attempt on a target thread.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DelegateOutcome {
    Processed,
    NotProcessed,
}

/// Posts a one-shot `op` at `thread`, to run at its next poll. If the target
/// is parked the operation is executed immediately on its behalf. Returns
/// false if the target is terminating or already has a pending handshake.
pub fn try_execute_async(thread: &Arc<MutatorThread>, op: HandshakeOp) -> bool {
    if thread.is_about_to_terminate.load(Ordering::Acquire) {
        return false;
    }
    {
        let mut slot = thread.handshake.op.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(op);
        thread.handshake.pending.store(true, Ordering::Release);
    }
    thread.arm_poll();
    log::debug!(
        target: "refinekit::handshake",
        "posted async handshake at {}",
        thread.name()
    );

    // A parked target will not poll; run on its behalf right away.
    if thread.state().is_parked() {
        delegate_processing_scope(thread);
    }
    true
}

/// Attempts a scoped acquisition of `thread` for remote handshake
/// processing. The scope is only grantable while the target is parked: its
/// monitor is held for the duration, and a parked thread cannot resume
/// managed execution without passing through that monitor. On success the
/// target's epoch is refreshed on its behalf and its pending handshake (if
/// any) is run; the scope is released on every exit path.
pub fn delegate_processing_scope(thread: &Arc<MutatorThread>) -> DelegateOutcome {
    let _guard = thread.monitor.lock_no_handshake();
    if !thread.state().is_parked() {
        return DelegateOutcome::NotProcessed;
    }
    // Only a still-pending handshake keeps the target's unpark fast path
    // away; without one, writing its slot could race the owner resuming.
    if !has_pending(thread) {
        return DelegateOutcome::NotProcessed;
    }
    thread.update_epoch_other();
    process_pending(thread);
    log::trace!(
        target: "refinekit::handshake",
        "processed handshake for parked {} at epoch {}",
        thread.name(),
        thread.local_epoch()
    );
    DelegateOutcome::Processed
}

/// Runs the pending handshake operation, if any. The caller must hold the
/// thread's monitor: either as the owner (poll slow path, unmanaged
/// transitions, detach) or through a delegate-processing scope.
pub(crate) fn process_pending(thread: &MutatorThread) {
    let op = {
        let mut slot = thread.handshake.op.lock();
        let op = slot.take();
        if op.is_some() {
            thread.handshake.pending.store(false, Ordering::Release);
        }
        op
    };
    if let Some(op) = op {
        op(thread);
    }
}
