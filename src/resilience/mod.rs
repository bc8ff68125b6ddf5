//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! Worker spawn fails (reload supervisor):
//!     → backoff.rs (next delay, exponential with jitter, capped)
//!     → supervisor sleeps, then retries the spawn
//! Worker starts:
//!     → backoff.rs reset
//! ```
//!
//! # Design Decisions
//! - Restart failures are retried forever; only the delay grows
//! - Jitter keeps several supervisors on one machine from retrying in lockstep

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
