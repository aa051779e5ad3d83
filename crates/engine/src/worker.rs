use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::process::{Outcome, ProcessingEngine};
use crate::queue::TransportQueue;

/// One consumer slot: receive, process, route the outcome.
pub struct Worker {
    engine: Arc<ProcessingEngine>,
    queue: Arc<dyn TransportQueue>,
    poll_interval: Duration,
    slot: usize,
}

impl Worker {
    pub fn new(
        engine: Arc<ProcessingEngine>,
        queue: Arc<dyn TransportQueue>,
        poll_interval: Duration,
        slot: usize,
    ) -> Self {
        Self { engine, queue, poll_interval, slot }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(event_name = "engine.worker.started", slot = self.slot, "worker slot running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = match self.queue.receive().await {
                Ok(received) => received,
                Err(error) => {
                    warn!(
                        event_name = "engine.worker.receive_failed",
                        slot = self.slot,
                        error = %error,
                        "queue receive failed"
                    );
                    None
                }
            };

            let Some((envelope, lease)) = received else {
                // Idle; wake on either the poll timer or shutdown.
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            match self.engine.process(&envelope, &lease).await {
                Outcome::Completed => {
                    if let Err(error) = self.queue.delete(&lease).await {
                        warn!(
                            event_name = "engine.worker.ack_failed",
                            slot = self.slot,
                            correlation_id = %envelope.correlation_id,
                            error = %error,
                            "could not acknowledge completed message"
                        );
                    }
                }
                Outcome::Retryable => {
                    info!(
                        event_name = "engine.worker.requeued",
                        slot = self.slot,
                        correlation_id = %envelope.correlation_id,
                        receive_count = lease.receive_count,
                        "left for redelivery"
                    );
                }
                Outcome::Terminal => {
                    if let Err(error) = self.queue.move_to_dead_letter(&lease).await {
                        warn!(
                            event_name = "engine.worker.dead_letter_failed",
                            slot = self.slot,
                            correlation_id = %envelope.correlation_id,
                            error = %error,
                            "could not dead-letter message"
                        );
                    }
                }
            }
        }

        info!(event_name = "engine.worker.stopped", slot = self.slot, "worker slot stopped");
    }
}

/// Fixed number of independent worker slots over one shared queue. Slot count
/// is the engine's only concurrency control.
pub struct WorkerPool {
    engine: Arc<ProcessingEngine>,
    queue: Arc<dyn TransportQueue>,
    slots: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<ProcessingEngine>,
        queue: Arc<dyn TransportQueue>,
        slots: usize,
        poll_interval: Duration,
    ) -> Self {
        Self { engine, queue, slots, poll_interval }
    }

    /// Runs until every slot has observed shutdown and drained its in-flight
    /// message.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::with_capacity(self.slots);
        for slot in 0..self.slots {
            let worker = Worker::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.queue),
                self.poll_interval,
                slot,
            );
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        for handle in handles {
            if let Err(error) = handle.await {
                warn!(
                    event_name = "engine.worker.join_failed",
                    error = %error,
                    "worker slot ended abnormally"
                );
            }
        }
    }
}
