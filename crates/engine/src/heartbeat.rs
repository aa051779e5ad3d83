use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::queue::{Lease, TransportQueue};

/// Timer-driven lease renewal for one in-flight message.
///
/// The returned guard aborts the renewal task on drop, so every exit path of
/// a processing attempt (success, classified error, panic unwind) stops
/// extending the lease within one tick. Extension failures are logged and
/// swallowed; a heartbeat must never abort processing.
pub struct Heartbeat;

pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
    renewals: Arc<AtomicU64>,
}

impl HeartbeatGuard {
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Heartbeat {
    pub fn spawn(
        queue: Arc<dyn TransportQueue>,
        lease: Lease,
        interval: Duration,
        extension: Duration,
    ) -> HeartbeatGuard {
        let renewals = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&renewals);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval completes immediately; the
            // lease is already fresh at spawn time, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.extend_lease(&lease, extension).await {
                    Ok(()) => {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        warn!(
                            event_name = "engine.heartbeat.extend_failed",
                            receipt = %lease.receipt,
                            error = %error,
                            "lease extension failed"
                        );
                    }
                }
            }
        });

        HeartbeatGuard { handle, renewals }
    }
}
