//! Observability for switchboard services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus export
//! - **Middleware**: axum layer recording per-request HTTP metrics

pub mod logging;
pub mod metrics;
pub mod middleware;
