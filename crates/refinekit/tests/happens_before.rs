//! The protocol's central contract, exercised with a sentinel: a store the
//! mutator issued before its epoch update must be visible to an initiator
//! that completed an episode covering that update.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{drive_to_completion, setup};
use refinekit::{EpochSync, StsJoiner};

const ENV: &[(&str, &str)] = &[("REFINEKIT_WAIT_TIMEOUT_NS", "100000000")];

static MARKER: AtomicUsize = AtomicUsize::new(0);

#[test]
fn initiator_observes_stores_before_the_update() {
    let _serial = setup(ENV);

    let stop = Arc::new(AtomicBool::new(false));
    let wrote = Arc::new(AtomicBool::new(false));
    let writer = {
        let stop = stop.clone();
        let wrote = wrote.clone();
        std::thread::spawn(move || {
            let _mutator = refinekit::attach("writer");
            // the store the protocol must publish, followed by a
            // synchronization point (the unmanaged round trip)
            MARKER.store(42, Ordering::Relaxed);
            refinekit::parked_scope(|| {});
            wrote.store(true, Ordering::Release);
            while !stop.load(Ordering::Relaxed) {
                refinekit::poll();
                std::thread::yield_now();
            }
        })
    };

    let start = Instant::now();
    while !wrote.load(Ordering::Acquire) {
        assert!(start.elapsed() < Duration::from_secs(5), "writer never started");
        std::thread::yield_now();
    }

    {
        let _sts = StsJoiner::new();
        let mut sync = EpochSync::new(true);
        drive_to_completion(&mut sync);
        assert_eq!(MARKER.load(Ordering::Relaxed), 42);
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}
