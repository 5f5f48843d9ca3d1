//! Observability for the stepgate engine.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms for gate decisions, claims,
//!   conflicts and escalations, with Prometheus text export

pub mod logging;
pub mod metrics;
