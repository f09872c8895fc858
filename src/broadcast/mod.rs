//! # Broadcast Module
//!
//! Fans a message out across a set of channels using a small bounded pool of
//! worker tasks. The requested message count is split evenly across the
//! workers (remainder to the first ones); every worker runs its own
//! publish/sleep loop against the shared broker handle until its share is
//! exhausted, the job is cancelled, or the connection goes away.
//!
//! ## Module Architecture
//!
//! ```text
//! broadcast/
//! ├── job.rs         - BroadcastJob, work split, outcome types
//! └── coordinator.rs - Broadcaster, worker loops, JobHandle
//! ```
//!
//! ## Accounting
//!
//! Sent and failed counts live in shared atomics incremented only after the
//! publish call returns, so the numbers reported at cancellation or failure
//! are exactly the publishes that actually happened. Progress reaches the
//! presentation layer on a fixed tick, never per message.

pub mod coordinator;
pub mod job;

pub use coordinator::{BroadcastError, Broadcaster, JobHandle};
pub use job::{BroadcastJob, JobEvent, JobOutcome, JobSummary, TargetSet, MAX_WORKERS};
