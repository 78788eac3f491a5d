//! Prometheus metrics for upload coordination.
//!
//! Exposed series:
//! - chunk dispatches, completions, failures and retries
//! - capacity rejections per account
//! - session starts and terminal outcomes
//! - in-flight chunks, active sessions and reachable servers
//! - chunk dispatch and session durations

pub mod exporter;
pub mod recorder;

pub use exporter::{install_recorder, metrics_route, render_metrics, MetricsError};
pub use recorder::{init_metrics, InFlightChunk, SessionTimer};
