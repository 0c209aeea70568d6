//! Fan-out and node statistics

pub mod metrics;

pub use metrics::{FanoutStats, NodeStats};
