//! Observability: logging setup and per-node packet statistics

mod logging;
mod metrics;

pub use logging::{init_logging, LogSettings};
pub use metrics::{Counter, StackMetrics};
