mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{eventually, init_tracing, start_node};
use streamnet::{MemoryNetwork, Node, PeerId, RoutingTable, StreamId};
use tokio::sync::mpsc;

/// A (origin) <- B (relay) <- C (leaf); C only knows B
fn three_hops(network: &std::sync::Arc<MemoryNetwork>) -> (Node, Node, Node) {
    let a = start_node(network, "aa", RoutingTable::new());
    let b = start_node(network, "bb", RoutingTable::new().with_peer("aa"));
    let c = start_node(network, "cc", RoutingTable::new().with_fallback("bb"));
    (a, b, c)
}

#[tokio::test]
async fn test_multi_hop_relay_and_finish() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b, c) = three_hops(&network);
    let id = StreamId::for_peer(&PeerId::new("aa"), "strmID");
    let broadcaster = a.registry().get_broadcaster(&id).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = c
        .subscribe(&id, move |seq, data, eof| {
            let _ = tx.send((seq, data, eof));
        })
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || async { broadcaster.listeners().len().await == 1 }).await);

    assert_eq!(b.registry().relayer_count().await, 1);
    let relayer = b.registry().relayer(&id).await.unwrap();
    assert_eq!(relayer.listeners().peers().await, vec![PeerId::new("cc")]);
    assert_eq!(broadcaster.listeners().peers().await, vec![PeerId::new("bb")]);

    a.broadcast(&id, 100, "test data").await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        (100, Bytes::from_static(b"test data"), false)
    );

    a.finish_broadcast(&id).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), (0, Bytes::new(), true));
    handle.stopped().await;

    // Exactly one finish reaches the leaf
    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(!matches!(extra, Ok(Some(_))));

    assert_eq!(a.registry().broadcaster_count().await, 0);
    assert!(eventually(Duration::from_secs(1), || async { b.registry().relayer_count().await == 0 }).await);
    assert_eq!(c.registry().subscriber_count().await, 0);
}

#[tokio::test]
async fn test_one_relayer_for_two_leaves() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b, c) = three_hops(&network);
    let d = start_node(&network, "dd", RoutingTable::new().with_fallback("bb"));
    let id = StreamId::for_peer(&PeerId::new("aa"), "strmID");
    let broadcaster = a.registry().get_broadcaster(&id).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx_d = tx.clone();
    let _hc = c
        .subscribe(&id, move |seq, _, eof| {
            let _ = tx.send(("cc", seq, eof));
        })
        .await
        .unwrap();
    let _hd = d
        .subscribe(&id, move |seq, _, eof| {
            let _ = tx_d.send(("dd", seq, eof));
        })
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || async {
        match b.registry().relayer(&id).await {
            Some(relayer) => relayer.listeners().len().await == 2,
            None => false,
        }
    })
    .await);
    assert!(eventually(Duration::from_secs(1), || async { broadcaster.listeners().len().await == 1 }).await);
    assert_eq!(b.registry().relayer_count().await, 1);

    a.broadcast(&id, 5, "seg").await.unwrap();

    let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    seen.sort();
    assert_eq!(seen, vec![("cc", 5, false), ("dd", 5, false)]);
}

#[tokio::test]
async fn test_leaf_cancel_propagates_upstream() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (a, b, c) = three_hops(&network);
    let id = StreamId::for_peer(&PeerId::new("aa"), "strmID");
    let broadcaster = a.registry().get_broadcaster(&id).await;

    let handle = c.subscribe(&id, |_, _, _| {}).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || async { broadcaster.listeners().len().await == 1 }).await);

    handle.cancel().await;

    assert!(eventually(Duration::from_secs(2), || async { b.registry().relayer_count().await == 0 }).await);
    assert!(eventually(Duration::from_secs(2), || async { broadcaster.listeners().is_empty().await }).await);

    // The origin keeps its broadcaster; only the listener went away
    assert_eq!(a.registry().broadcaster_count().await, 1);
}
