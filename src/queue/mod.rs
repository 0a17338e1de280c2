//! Bounded-concurrency admission queue.
//!
//! - `task`: work item, producer tag, and the Pending → Active → Done phases
//! - `dispatch`: the `TaskQueue` itself: dedup by key, FIFO drain, self-refill

pub mod dispatch;
pub mod task;

pub use dispatch::{QueueStatus, TaskEvent, TaskQueue};
pub use task::{Producer, TaskBody, TaskOutcome, TaskPhase, WorkItem};
