//! Transport configuration

use std::time::Duration;

use crate::protocol::constants::DEFAULT_MAX_FRAME_SIZE;

/// Transport configuration options
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest frame body accepted from a peer
    pub max_frame_size: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Bound on establishing an outbound TCP connection
    pub connect_timeout: Duration,

    /// Bound on the hello exchanged on a new connection
    pub handshake_timeout: Duration,

    /// Pipe capacity for in-memory connections
    pub duplex_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tcp_nodelay: true, // Segments are latency sensitive
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            duplex_buffer_size: 64 * 1024,
        }
    }
}

impl TransportConfig {
    /// Set the maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn duplex_buffer_size(mut self, size: usize) -> Self {
        self.duplex_buffer_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();

        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.tcp_nodelay);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_duplex_buffer_never_zero() {
        let config = TransportConfig::default().duplex_buffer_size(0);

        assert_eq!(config.duplex_buffer_size, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let config = TransportConfig::default()
            .max_frame_size(4096)
            .tcp_nodelay(false)
            .connect_timeout(Duration::from_secs(1))
            .handshake_timeout(Duration::from_millis(500));

        assert_eq!(config.max_frame_size, 4096);
        assert!(!config.tcp_nodelay);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.handshake_timeout, Duration::from_millis(500));
    }
}
