//! Job-scheduling daemon: claims queued jobs from the database, drives each
//! through the runner its job type names, and persists progress back.
//!
//! - `scheduler` — bounded-concurrency dispatch loop, routing, cancellation
//! - `daemon` — startup: open the database, construct the scheduler, run
//!   until shutdown

pub mod daemon;
pub mod scheduler;
