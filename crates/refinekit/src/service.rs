//! The service thread: owns scheduled background work. Today that is the
//! epoch reset, either on request (the counter crossed its threshold) or
//! periodically when the stress option forces it.

use crate::options::options;

pub(crate) enum ServiceRequest {
    Reset,
}

pub(crate) struct ServiceThread {
    sender: flume::Sender<ServiceRequest>,
}

impl ServiceThread {
    pub(crate) fn spawn() -> Self {
        let (sender, receiver) = flume::unbounded();
        std::thread::Builder::new()
            .name("refinekit-service".into())
            .spawn(move || service_loop(receiver))
            .expect("failed to spawn the service thread");
        Self { sender }
    }

    /// Asks the service thread to run the epoch reset. Never blocks; safe to
    /// call from an initiator's construction path.
    pub(crate) fn request_reset(&self) {
        let _ = self.sender.send(ServiceRequest::Reset);
    }
}

fn service_loop(receiver: flume::Receiver<ServiceRequest>) {
    let opts = options();
    loop {
        let request = if opts.force_periodic_reset {
            match receiver.recv_timeout(opts.periodic_reset_interval) {
                Ok(request) => Some(request),
                Err(flume::RecvTimeoutError::Timeout) => None,
                Err(flume::RecvTimeoutError::Disconnected) => return,
            }
        } else {
            match receiver.recv() {
                Ok(request) => Some(request),
                Err(_) => return,
            }
        };

        match request {
            Some(ServiceRequest::Reset) => crate::refine::run_epoch_reset(),
            None => {
                // periodic stress forcing; claim the slot like any scheduler
                if crate::epoch::try_claim_reset() {
                    log::debug!(
                        target: "refinekit::refine",
                        "forcing periodic epoch reset"
                    );
                    crate::refine::run_epoch_reset();
                }
            }
        }
    }
}
