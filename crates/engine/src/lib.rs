//! The processing engine: queue consumption, per-message lease heartbeat,
//! the idempotent conversation state machine, the worker pool, and the
//! dead-letter reconciler.
//!
//! Bounded worker slots are the only concurrency control. There is no
//! cross-slot coordination and no store locking; correctness under duplicate
//! delivery rests on the conditional create, version-guarded updates and
//! monotonic status transitions in the store layer.

pub mod error;
pub mod heartbeat;
pub mod process;
pub mod queue;
pub mod reconciler;
#[cfg(test)]
pub(crate) mod testutil;
pub mod worker;

pub use error::EngineError;
pub use heartbeat::{Heartbeat, HeartbeatGuard};
pub use process::{Outcome, ProcessingEngine};
pub use queue::{Lease, MemoryQueue, TransportQueue};
pub use reconciler::Reconciler;
pub use worker::{Worker, WorkerPool};
