//! Asymmetric epoch synchronization between concurrent-refinement workers
//! and a population of mutator threads: after an initiator's episode
//! completes, every store a mutator issued before the episode began is
//! visible to the initiator, without a full memory barrier on the mutator's
//! hot path. Mutators pay a pair of atomic operations at synchronization
//! points they already have (polls, managed/unmanaged transitions); the
//! initiator escalates to stragglers with asynchronous no-op handshakes and
//! defers instead of blocking.

use std::sync::LazyLock;

pub mod epoch;
pub mod handshake;
pub mod options;
pub mod refine;
pub mod safepoint;
pub mod service;
pub mod sync;
pub mod threads;

pub use epoch::{global_epoch, global_frontier, Epoch};
pub use refine::{verify_before_collection_pause, DeferredSyncQueue, EpochSync, SyncOutcome};
pub use safepoint::StsJoiner;
pub use threads::{attach, parked_scope, poll, AttachedMutator, MutatorThread};

/// The process-wide runtime: the mutator registry, the VM thread executing
/// safepoint operations, the service thread running scheduled work, and the
/// deferred-synchronization queue.
pub struct RefineKit {
    threads: threads::Threads,
    vm_thread: safepoint::VmThread,
    service: service::ServiceThread,
    deferred: refine::DeferredSyncQueue,
}

impl RefineKit {
    fn new() -> Self {
        Self {
            threads: threads::Threads::new(),
            vm_thread: safepoint::VmThread::spawn(),
            service: service::ServiceThread::spawn(),
            deferred: refine::DeferredSyncQueue::new(),
        }
    }

    pub fn threads(&self) -> &threads::Threads {
        &self.threads
    }

    pub fn deferred(&self) -> &refine::DeferredSyncQueue {
        &self.deferred
    }

    pub(crate) fn vm_thread(&self) -> &safepoint::VmThread {
        &self.vm_thread
    }

    pub(crate) fn service(&self) -> &service::ServiceThread {
        &self.service
    }
}

static REFINEKIT: LazyLock<RefineKit> = LazyLock::new(RefineKit::new);

/// The process-wide [`RefineKit`] instance, created on first use and alive
/// until process exit.
pub fn refinekit() -> &'static RefineKit {
    &REFINEKIT
}
