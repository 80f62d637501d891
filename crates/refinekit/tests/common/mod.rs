#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use refinekit::{EpochSync, SyncOutcome};

static ENV_INIT: Once = Once::new();
static SERIAL: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Applies this process's option overrides (before anything touches the
/// options singleton) and serializes tests that share the global epoch
/// state.
pub fn setup(env: &[(&str, &str)]) -> MutexGuard<'static, ()> {
    ENV_INIT.call_once(|| {
        for (key, value) in env {
            std::env::set_var(key, value);
        }
        let _ = env_logger::builder().is_test(true).try_init();
    });
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wait_ready(ready: &AtomicBool) {
    let start = Instant::now();
    while !ready.load(Ordering::Acquire) {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "mutator failed to attach"
        );
        std::thread::yield_now();
    }
}

/// A mutator worker with a controllable lifetime.
pub struct Mutator {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Mutator {
    /// Keeps passing through managed/unmanaged transitions, refreshing its
    /// epoch on every iteration.
    pub fn transitioning(name: &str) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let ready = ready.clone();
            let name = name.to_string();
            std::thread::spawn(move || {
                let _mutator = refinekit::attach(name);
                ready.store(true, Ordering::Release);
                while !stop.load(Ordering::Relaxed) {
                    refinekit::parked_scope(|| {});
                    refinekit::poll();
                    std::thread::yield_now();
                }
            })
        };
        wait_ready(&ready);
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Parked in a long native section until stopped; never polls.
    pub fn parked(name: &str) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let ready = ready.clone();
            let name = name.to_string();
            std::thread::spawn(move || {
                let _mutator = refinekit::attach(name);
                refinekit::threads::enter_parked();
                ready.store(true, Ordering::Release);
                while !stop.load(Ordering::Relaxed) {
                    std::thread::yield_now();
                }
                refinekit::threads::leave_parked();
            })
        };
        wait_ready(&ready);
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Runs without ever reaching a synchronization point unless
    /// `responsive` is raised, after which it polls on every iteration.
    pub fn silent(name: &str, responsive: Arc<AtomicBool>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let ready = ready.clone();
            let name = name.to_string();
            std::thread::spawn(move || {
                let _mutator = refinekit::attach(name);
                ready.store(true, Ordering::Release);
                while !stop.load(Ordering::Relaxed) {
                    if responsive.load(Ordering::Acquire) {
                        refinekit::poll();
                    }
                    std::thread::yield_now();
                }
            })
        };
        wait_ready(&ready);
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.take().unwrap().join().unwrap();
    }
}

/// Retries `synchronize` until it completes. Only for tests where no pause
/// can intervene: the caller keeps its joiner across retries.
pub fn drive_to_completion(sync: &mut EpochSync) {
    let start = Instant::now();
    loop {
        if let SyncOutcome::Complete = sync.synchronize() {
            return;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "synchronization failed to complete"
        );
        std::thread::yield_now();
    }
}
