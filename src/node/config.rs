//! Node configuration

use std::time::Duration;

/// Node configuration options
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Frames a broadcaster may queue ahead of its delivery worker
    pub broadcast_queue_capacity: usize,

    /// Frames a subscriber may buffer between reception and its callback
    pub delivery_queue_capacity: usize,

    /// Bound on one send to one listener; slower listeners are dropped
    pub send_timeout: Duration,

    /// Bound on the upstream cancel and close during teardown
    pub cancel_timeout: Duration,

    /// Bound on waiting for a master playlist reply
    pub request_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            broadcast_queue_capacity: 256,
            delivery_queue_capacity: 256,
            send_timeout: Duration::from_secs(5),
            cancel_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    /// Set the broadcaster queue capacity (at least 1)
    pub fn broadcast_queue_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_queue_capacity = capacity.max(1);
        self
    }

    /// Set the subscriber delivery queue capacity (at least 1)
    pub fn delivery_queue_capacity(mut self, capacity: usize) -> Self {
        self.delivery_queue_capacity = capacity.max(1);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Set playlist request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
