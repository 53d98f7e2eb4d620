//! Worker system: the dispatch loop and stale-work recovery.
//!
//! Core components:
//! - `scheduler`: selects, assigns and runs one task per iteration
//! - `reclaimer`: resets tasks held by agents that stopped heartbeating

pub mod reclaimer;
pub mod scheduler;

pub use reclaimer::{ReclaimReport, Reclaimer};
pub use scheduler::{IterationOutcome, Scheduler, StoreBackoff, spawn_scheduler_loop};
