//! Escalation paths: a parked straggler is brought past the frontier on the
//! poster's side, and a mutator that never reaches a synchronization point
//! forces the deferred outcome.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{drive_to_completion, setup, Mutator};
use refinekit::{EpochSync, StsJoiner, SyncOutcome};

const ENV: &[(&str, &str)] = &[("REFINEKIT_WAIT_TIMEOUT_NS", "100000000")];

#[test]
fn parked_straggler_is_processed_on_its_behalf() {
    let _serial = setup(ENV);
    let active1 = Mutator::transitioning("active-1");
    let active2 = Mutator::transitioning("active-2");
    let parked = Mutator::parked("parked-native");

    let required;
    {
        let _sts = StsJoiner::new();
        let mut sync = EpochSync::new(true);
        required = sync.required_frontier();
        drive_to_completion(&mut sync);
    }

    // the parked thread never polled; only the delegate-processing scope can
    // have moved its epoch past the frontier
    let mut saw_parked = false;
    refinekit::refinekit().threads().for_each_mutator(|thread| {
        if thread.name() == "parked-native" {
            saw_parked = true;
            assert!(!thread.local_epoch().precedes(required));
        }
    });
    assert!(saw_parked);

    parked.stop();
    active1.stop();
    active2.stop();
}

#[test]
fn unresponsive_mutator_defers_then_completes() {
    let _serial = setup(ENV);
    let responsive = Arc::new(AtomicBool::new(false));
    let silent = Mutator::silent("silent", responsive.clone());

    {
        let _sts = StsJoiner::new();
        let mut sync = EpochSync::new(true);
        assert_eq!(sync.synchronize(), SyncOutcome::Deferred);

        // the straggler finally reaches its poll; the posted handshake runs
        // there and the next probe succeeds
        responsive.store(true, Ordering::Release);
        let start = Instant::now();
        while !sync.check_synchronized() {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "straggler never caught up"
            );
            std::thread::yield_now();
        }
    }

    silent.stop();
}
