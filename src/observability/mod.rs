//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, access log)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (full, compact, pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Connection and request IDs are span fields, so every event inherits them
//! - Metrics go through the `metrics` facade; without an installed recorder
//!   they are no-ops

pub mod logging;
pub mod metrics;
