//! Memory Relay - three nodes relaying a stream in one process
//!
//! Run with: cargo run --example memory_relay -- [segments]
//!
//! This example demonstrates:
//! - Joining nodes to an in-memory network
//! - Routing a leaf's subscription through an intermediate relay
//! - Publishing segments and finishing the stream at the origin
//!
//! # Topology
//!
//! ```text
//!   origin "aa"          relay "bb"           viewer "cc"
//!  +-------------+     +-------------+     +-------------+
//!  | Broadcaster |────>|   Relayer   |────>| Subscriber  |
//!  +-------------+     +-------------+     +-------------+
//! ```

use std::sync::Arc;
use std::time::Duration;

use streamnet::{MemoryNetwork, Node, PeerId, RoutingTable, StreamId};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let segments: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 5,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("streamnet=info".parse()?),
        )
        .init();

    let network = MemoryNetwork::new();
    let origin = Node::new(network.join("aa"), Arc::new(RoutingTable::new()));
    let relay = Node::new(
        network.join("bb"),
        Arc::new(RoutingTable::new().with_peer("aa")),
    );
    let viewer = Node::new(
        network.join("cc"),
        Arc::new(RoutingTable::new().with_fallback("bb")),
    );
    origin.spawn();
    relay.spawn();
    viewer.spawn();

    let id = StreamId::for_peer(&PeerId::new("aa"), "live");
    origin.registry().get_broadcaster(&id).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = viewer
        .subscribe(&id, move |seq_no, data, eof| {
            let _ = tx.send((seq_no, data, eof));
        })
        .await?;

    // Give the subscription time to reach the origin
    tokio::time::sleep(Duration::from_millis(100)).await;

    for seq_no in 0..segments {
        origin
            .broadcast(&id, seq_no, format!("segment {seq_no}"))
            .await?;
    }
    origin.finish_broadcast(&id).await?;

    while let Some((seq_no, data, eof)) = rx.recv().await {
        if eof {
            println!("stream finished");
            break;
        }
        println!("#{seq_no}: {}", String::from_utf8_lossy(&data));
    }
    handle.stopped().await;

    let stats = relay.stats().await;
    println!(
        "relay: {} relayers, {} frames delivered",
        stats.relayers, stats.frames_delivered
    );

    Ok(())
}
