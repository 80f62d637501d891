//! The initiator side of the protocol: constructing a synchronization
//! episode, probing and escalating until every mutator has passed the
//! required frontier, and the safepoint reset that bounds the counters.
//!
//! The central guarantee: the constructor's fetch-add orders everything the
//! initiator did before it ahead of its subsequent loads of mutator epoch
//! slots, and a mutator's update releases everything it did before the
//! update into the slot. Once the initiator has observed every mutator at or
//! past `required_frontier`, every store any mutator issued before the
//! episode began is visible to it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::epoch::{self, Epoch};
use crate::handshake;
use crate::options::options;
use crate::safepoint::{self, StsJoiner};
use crate::sync::SpinYield;
use crate::threads::{self, MutatorThread};

/// Result of driving a synchronization episode.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SyncOutcome {
    /// Every mutator passed the required frontier.
    Complete,
    /// Timed out or had to yield to a pending pause. Not an error: retry
    /// later, or queue the dependent work on the deferred queue.
    Deferred,
}

pub(crate) enum ScanMode {
    Observe,
    CollectStragglers,
}

struct ScanOutcome {
    min_epoch: Option<Epoch>,
    stragglers: Vec<Arc<MutatorThread>>,
}

/// Visits every live mutator, computing the wrap-aware minimum of the
/// observed epochs and, when asked, the list of threads still behind the
/// required frontier.
fn scan_threads(required_frontier: Epoch, mode: ScanMode) -> ScanOutcome {
    let current = threads::current();
    let mut min_epoch = None;
    let mut stragglers = Vec::new();
    crate::refinekit().threads().for_each_mutator(|thread| {
        if thread.is_about_to_terminate.load(Ordering::Acquire) {
            // threads on their way out no longer participate
            return;
        }
        let observed = thread.local_epoch();
        debug_assert!(
            !epoch::global_epoch().precedes(observed),
            "local epoch ahead of the global epoch"
        );
        min_epoch = Some(match min_epoch {
            None => observed,
            Some(min) => observed.min(min),
        });
        if matches!(mode, ScanMode::CollectStragglers)
            && observed.precedes(required_frontier)
            && current.as_ref().map_or(true, |c| !Arc::ptr_eq(c, thread))
        {
            stragglers.push(thread.clone());
        }
    });
    ScanOutcome {
        min_epoch,
        stragglers,
    }
}

/// One synchronization episode. Constructed by a refinement worker (or any
/// non-mutator reader of mutator-written state) before reading, and driven
/// until [`Complete`](SyncOutcome::Complete); a deferred episode must either
/// be retried or parked on the [`DeferredSyncQueue`].
///
/// Initiating callers hold an [`StsJoiner`] for the whole episode, so a
/// stop-the-world pause cannot begin with the episode half-driven.
pub struct EpochSync {
    required_frontier: Epoch,
    complete: bool,
}

impl EpochSync {
    /// With `start_sync`, advances the global epoch and targets the
    /// incremented value as this episode's required frontier. Without it,
    /// the episode is trivially synchronized.
    pub fn new(start_sync: bool) -> Self {
        if !start_sync {
            return Self {
                required_frontier: Epoch::ZERO,
                complete: true,
            };
        }
        debug_assert!(
            safepoint::is_current_thread_joined(),
            "initiators must hold an StsJoiner for the whole episode"
        );
        let required_frontier = epoch::advance_global_epoch();
        epoch::pending_sync_inc();
        maybe_schedule_reset(required_frontier);
        Self {
            required_frontier,
            complete: false,
        }
    }

    pub fn required_frontier(&self) -> Epoch {
        self.required_frontier
    }

    /// The fast probe: consult the memoized global frontier, then scan the
    /// thread list once. Raises the frontier on success so later episodes
    /// can skip the scan.
    pub fn check_synchronized(&mut self) -> bool {
        if self.complete {
            return true;
        }
        debug_assert!(
            safepoint::is_current_thread_joined(),
            "initiators must hold an StsJoiner for the whole episode"
        );
        // a mutator caller satisfies the protocol for itself first
        if let Some(thread) = threads::current() {
            thread.update_epoch_self();
        }
        if !epoch::global_frontier().precedes(self.required_frontier) {
            self.mark_complete();
            return true;
        }
        let scan = scan_threads(self.required_frontier, ScanMode::Observe);
        match scan.min_epoch {
            Some(min) if min.precedes(self.required_frontier) => false,
            observed => {
                if let Some(min) = observed {
                    epoch::try_raise_frontier(min);
                }
                self.mark_complete();
                true
            }
        }
    }

    /// Drives the episode: fast check, then escalate to the stragglers with
    /// asynchronous no-op handshakes, then spin until success, timeout, or a
    /// pending pause asks us to yield.
    pub fn synchronize(&mut self) -> SyncOutcome {
        if self.check_synchronized() {
            return SyncOutcome::Complete;
        }

        let scan = scan_threads(self.required_frontier, ScanMode::CollectStragglers);
        if scan.stragglers.is_empty() {
            // everyone met the frontier between the fast check and the scan
            if let Some(min) = scan.min_epoch {
                epoch::try_raise_frontier(min);
            }
            self.mark_complete();
            return SyncOutcome::Complete;
        }
        for thread in &scan.stragglers {
            if handshake::has_pending(thread) {
                // an earlier episode already posted at this thread; it may
                // have parked since, letting us process on its behalf
                handshake::delegate_processing_scope(thread);
            } else {
                handshake::try_execute_async(thread, Box::new(|_| {}));
            }
        }
        log::debug!(
            target: "refinekit::refine",
            "{}: escalated to {} straggler(s) behind frontier {}",
            current_name(),
            scan.stragglers.len(),
            self.required_frontier
        );

        let timeout = options().wait_timeout;
        let start = Instant::now();
        let mut spin = SpinYield::new();
        loop {
            spin.wait();
            if self.check_synchronized() {
                return SyncOutcome::Complete;
            }
            if start.elapsed() >= timeout || safepoint::should_yield() {
                log::debug!(
                    target: "refinekit::refine",
                    "{}: deferring synchronization (required {}, frontier {})",
                    current_name(),
                    self.required_frontier,
                    epoch::global_frontier()
                );
                return SyncOutcome::Deferred;
            }
        }
    }

    fn mark_complete(&mut self) {
        debug_assert!(!self.complete);
        self.complete = true;
        epoch::pending_sync_dec();
        log::trace!(
            target: "refinekit::refine",
            "{}: synchronized at frontier {}",
            current_name(),
            self.required_frontier
        );
    }

    /// Completion decreed by the safepoint reset: every mutator is quiesced
    /// behind its monitor, so the visibility contract holds for any
    /// frontier.
    pub(crate) fn force_complete(&mut self) {
        if !self.complete {
            self.complete = true;
            epoch::pending_sync_dec();
        }
    }
}

fn current_name() -> String {
    match threads::current() {
        Some(thread) => thread.name().to_string(),
        None => std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string(),
    }
}

fn maybe_schedule_reset(required_frontier: Epoch) {
    let threshold = Epoch::from_value(options().epoch_reset_threshold);
    if !required_frontier.precedes(threshold) && epoch::try_claim_reset() {
        log::debug!(
            target: "refinekit::refine",
            "required frontier {} crossed the reset threshold, scheduling epoch reset",
            required_frontier
        );
        crate::refinekit().service().request_reset();
    }
}

pub(crate) struct DeferredSync {
    sync: EpochSync,
    work: Box<dyn FnOnce() + Send>,
}

/// The one queue of deferred synchronizations. Work queued here is run
/// either by [`drain_completed`](DeferredSyncQueue::drain_completed) once
/// its episode holds, or by the safepoint reset, which force-completes
/// whatever is left. This is the only place a pending episode may outlive
/// its initiating call chain.
pub struct DeferredSyncQueue {
    entries: Mutex<Vec<DeferredSync>>,
}

impl DeferredSyncQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, sync: EpochSync, work: impl FnOnce() + Send + 'static) {
        debug_assert!(
            !sync.complete,
            "only deferred synchronizations belong on the queue"
        );
        self.entries.lock().push(DeferredSync {
            sync,
            work: Box::new(work),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The retry path: re-checks every queued episode and runs the work of
    /// those that now hold. Returns how many were drained.
    pub fn drain_completed(&self) -> usize {
        let _sts = StsJoiner::new();
        let taken: Vec<DeferredSync> = self.entries.lock().drain(..).collect();
        let mut ready = Vec::new();
        let mut kept = Vec::new();
        for mut entry in taken {
            if entry.sync.check_synchronized() {
                ready.push(entry.work);
            } else {
                kept.push(entry);
            }
        }
        self.entries.lock().extend(kept);
        let drained = ready.len();
        for work in ready {
            work();
        }
        drained
    }

    fn take_all(&self) -> Vec<DeferredSync> {
        self.entries.lock().drain(..).collect()
    }
}

/// Debug check run on entry to a collection pause: every live pending
/// synchronization must be accounted for by the deferred queue. Anything
/// else means a caller failed to drive its episode before the pause, and
/// the reset would leave it waiting for a frontier that no longer exists.
pub fn verify_before_collection_pause(deferred_len: usize) {
    #[cfg(debug_assertions)]
    assert_eq!(
        epoch::pending_sync(),
        deferred_len,
        "pending synchronizations not accounted for by the deferred queue"
    );
    #[cfg(not(debug_assertions))]
    let _ = deferred_len;
}

/// Posts the epoch reset as a VM operation and waits for the pause.
pub(crate) fn run_epoch_reset() {
    crate::refinekit()
        .vm_thread()
        .execute("epoch reset", reset_at_safepoint);
}

fn reset_at_safepoint() {
    assert!(safepoint::is_at_safepoint());
    assert!(safepoint::is_vm_thread());
    let kit = crate::refinekit();
    let previous = epoch::global_epoch();

    let deferred = kit.deferred().take_all();
    verify_before_collection_pause(deferred.len());
    for mut entry in deferred {
        entry.sync.force_complete();
        (entry.work)();
    }

    epoch::reset_global_counters();
    kit.threads().for_each_mutator(|thread| thread.reset_epoch());
    epoch::clear_reset_scheduled();
    log::debug!(
        target: "refinekit::refine",
        "reset epoch state at safepoint (previous epoch {})",
        previous
    );
}
