#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use streamnet::{MemoryNetwork, Node, RoutingTable};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test log subscriber once per binary (`RUST_LOG` to enable)
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Join `peer` to `network` with the given routing and start its accept loop
pub fn start_node(network: &Arc<MemoryNetwork>, peer: &str, routing: RoutingTable) -> Node {
    let node = Node::new(network.join(peer), Arc::new(routing));
    node.spawn();
    node
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
