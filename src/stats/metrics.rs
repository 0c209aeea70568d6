//! Statistics snapshots for fan-out and node state

/// Counters for one listener set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Listeners currently registered
    pub listeners: usize,
    /// Frames successfully sent, counted once per listener
    pub frames_delivered: u64,
    /// Listeners removed after a failed or timed out send
    pub listeners_dropped: u64,
}

/// Node-wide snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Locally originated streams
    pub broadcasters: usize,
    /// Active or idle local subscriptions
    pub subscribers: usize,
    /// Streams relayed through this node
    pub relayers: usize,
    /// Listeners across all broadcasters and relayers
    pub listeners: usize,
    pub frames_delivered: u64,
    pub listeners_dropped: u64,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one listener set's counters into the totals
    pub fn add_fanout(&mut self, fanout: &FanoutStats) {
        self.listeners += fanout.listeners;
        self.frames_delivered += fanout.frames_delivered;
        self.listeners_dropped += fanout.listeners_dropped;
    }

    /// Number of stream instances of any kind
    pub fn instances(&self) -> usize {
        self.broadcasters + self.subscribers + self.relayers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_fanout() {
        let mut stats = NodeStats::new();
        stats.add_fanout(&FanoutStats {
            listeners: 2,
            frames_delivered: 10,
            listeners_dropped: 1,
        });
        stats.add_fanout(&FanoutStats {
            listeners: 1,
            frames_delivered: 5,
            listeners_dropped: 0,
        });

        assert_eq!(stats.listeners, 3);
        assert_eq!(stats.frames_delivered, 15);
        assert_eq!(stats.listeners_dropped, 1);
    }

    #[test]
    fn test_instances() {
        let stats = NodeStats {
            broadcasters: 1,
            subscribers: 2,
            relayers: 3,
            ..Default::default()
        };
        assert_eq!(stats.instances(), 6);
    }
}
