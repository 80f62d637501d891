use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

const NO_HOLDER: u64 = u64::MAX;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// A process-unique id for the calling OS thread, independent of whether it
/// is attached as a mutator. Monitors use it to track their holder.
#[inline]
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// A monitor controls concurrent access to a value and doubles as a
/// recursive mutex: the per-thread monitor is locked both by the thread's
/// own poll slow path and again by the blocking check it performs while
/// still holding it.
pub struct Monitor<T> {
    lock: Mutex<T>,
    cvar: Condvar,
    holder: AtomicU64,
    rec_count: AtomicUsize,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
            cvar: Condvar::new(),
            holder: AtomicU64::new(NO_HOLDER),
            rec_count: AtomicUsize::new(0),
        }
    }

    pub fn lock_no_handshake(&self) -> MonitorGuard<'_, T> {
        let my_slot = current_thread_id();
        if my_slot != self.holder.load(Ordering::Relaxed) {
            let guard = self.lock.lock();
            self.holder.store(my_slot, Ordering::Relaxed);
            self.rec_count.fetch_add(1, Ordering::Relaxed);
            MonitorGuard {
                guard: Some(guard),
                monitor: self,
            }
        } else {
            // Recursive entry: the raw mutex is already held by this thread,
            // hand out another guard without touching it.
            let guard = MonitorGuard {
                guard: unsafe { Some(self.lock.make_guard_unchecked()) },
                monitor: self,
            };
            self.rec_count.fetch_add(1, Ordering::Relaxed);
            guard
        }
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }
}

pub struct MonitorGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    pub monitor: &'a Monitor<T>,
}

impl<'a, T> MonitorGuard<'a, T> {
    /// Waits on the monitor's condition variable, releasing the raw mutex
    /// across the wait even when held recursively.
    pub fn wait_no_handshake(&mut self) {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::Relaxed);
        self.monitor.holder.store(NO_HOLDER, Ordering::Relaxed);

        self.monitor.cvar.wait(self.guard.as_mut().unwrap());

        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor
            .holder
            .store(current_thread_id(), Ordering::Relaxed);
    }
}

impl<'a, T> Drop for MonitorGuard<'a, T> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            unreachable!()
        };

        if self.monitor.rec_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.monitor.holder.store(NO_HOLDER, Ordering::Relaxed);
            drop(guard);
        } else {
            MutexGuard::leak(guard);
        }
    }
}

impl<'a, T> Deref for MonitorGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> DerefMut for MonitorGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 16;
const SLEEP_STEP: Duration = Duration::from_millis(1);

/// Escalating wait: busy-spin first, then yield the CPU, then sleep in
/// millisecond steps. The initiator's spin loop is the only protocol code
/// allowed to suspend.
pub struct SpinYield {
    spins: u32,
    yields: u32,
}

impl SpinYield {
    pub fn new() -> Self {
        Self { spins: 0, yields: 0 }
    }

    pub fn wait(&mut self) {
        if self.spins < SPIN_LIMIT {
            self.spins += 1;
            for _ in 0..self.spins {
                std::hint::spin_loop();
            }
        } else if self.yields < YIELD_LIMIT {
            self.yields += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(SLEEP_STEP);
        }
    }
}

impl Default for SpinYield {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Monitor;

    #[test]
    fn monitor_locks_recursively() {
        let monitor = Monitor::new(0usize);

        let mut outer = monitor.lock_no_handshake();
        *outer += 1;
        {
            let mut inner = monitor.lock_no_handshake();
            *inner += 1;
        }
        *outer += 1;
        assert_eq!(*outer, 3);
        drop(outer);

        // fully released: another plain acquisition must succeed
        let guard = monitor.lock_no_handshake();
        assert_eq!(*guard, 3);
    }

    #[test]
    fn monitor_release_clears_holder() {
        let monitor = Monitor::new(());
        drop(monitor.lock_no_handshake());
        // relocking from the same thread must go through the raw mutex again
        drop(monitor.lock_no_handshake());
    }
}
