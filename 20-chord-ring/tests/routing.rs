//! Shortcut routing, UDP retries and the UDP bootstrap exchange.

mod common;

use std::time::Duration;

use anyhow::Result;
use chord_ring::{Lookup, NodeError, NodeEvent, RingState};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use common::{key, peer, TestNode, TestRing};

/// Collects datagrams until the socket has been quiet for `quiet`.
async fn collect_datagrams(socket: &UdpSocket, quiet: Duration) -> Vec<String> {
    let mut received = Vec::new();
    let mut buf = [0u8; 128];
    while let Ok(Ok((len, _))) = timeout(quiet, socket.recv_from(&mut buf)).await {
        received.push(String::from_utf8_lossy(&buf[..len]).into_owned());
    }
    received
}

#[tokio::test]
async fn silent_shortcut_is_retried_then_bypassed() -> Result<()> {
    let mut ring = TestRing::form(&[5, 10, 20], 47301).await?;

    // A shortcut that never ACKs.
    let silent = UdpSocket::bind("127.0.0.1:47309").await?;
    ring.node(5).handle.set_shortcut(peer(25, 47309)).await?;

    let Lookup::Pending(seq) = ring.node(5).handle.find(key(27)).await? else {
        panic!("node 5 does not own key 27");
    };

    let datagrams = collect_datagrams(&silent, Duration::from_millis(300)).await;
    let expected = format!("FND 27 {seq} 5 127.0.0.1 47301\n");
    assert_eq!(datagrams, vec![expected; 4], "one send plus three retries");

    let event = ring
        .node_mut(5)
        .expect_event("owner of key 27", |event| matches!(event, NodeEvent::KeyOwner { .. }))
        .await?;
    assert_eq!(
        event,
        NodeEvent::KeyOwner {
            seq,
            key: key(27),
            owner: ring.node(20).peer()
        }
    );
    assert_eq!(ring.node(5).status().await?.pending_datagrams, 0);

    ring.shutdown().await
}

#[tokio::test]
async fn acknowledged_shortcut_skips_ring_hops() -> Result<()> {
    let mut ring = TestRing::form(&[5, 10, 20], 47321).await?;
    let twenty = ring.node(20).peer();
    ring.node(5).handle.set_shortcut(twenty).await?;

    let Lookup::Pending(seq) = ring.node(5).handle.find(key(28)).await? else {
        panic!("node 5 does not own key 28");
    };
    let event = ring
        .node_mut(5)
        .expect_event("owner of key 28", |event| matches!(event, NodeEvent::KeyOwner { .. }))
        .await?;
    assert_eq!(
        event,
        NodeEvent::KeyOwner {
            seq,
            key: key(28),
            owner: twenty
        }
    );
    ring.node(5)
        .wait_until("shortcut ACK", |status| status.pending_datagrams == 0)
        .await?;

    // Keys closer through the successor still go around the ring.
    ring.node(5).handle.clear_shortcut().await?;
    assert_eq!(ring.node(5).status().await?.shortcut, None);

    ring.shutdown().await
}

#[tokio::test]
async fn shortcut_cannot_point_at_self() -> Result<()> {
    let node = TestNode::spawn(5, 47331);
    let err = node.handle.set_shortcut(peer(5, 47999)).await.unwrap_err();
    assert_eq!(err.downcast_ref::<NodeError>(), Some(&NodeError::ShortcutIsSelf));
    node.handle.shutdown().await
}

#[tokio::test]
async fn bootstrap_finds_predecessor_through_any_member() -> Result<()> {
    let mut ring = TestRing::form(&[5, 10], 47341).await?;

    let mut joiner = TestNode::spawn(14, 47349);
    joiner.handle.bootstrap(ring.node(5).peer()).await?;
    let resolved = joiner
        .expect_event("bootstrap answer", |event| {
            matches!(event, NodeEvent::BootstrapResolved(_))
        })
        .await?;
    assert_eq!(resolved, NodeEvent::BootstrapResolved(ring.node(10).peer()));

    ring.nodes.insert(2, joiner);
    ring.wait_settled().await?;
    assert_eq!(ring.node(14).status().await?.state, RingState::Connected);

    ring.shutdown().await
}

#[tokio::test]
async fn bootstrap_with_taken_key_fails() -> Result<()> {
    let ring = TestRing::form(&[5, 10], 47351).await?;

    let mut duplicate = TestNode::spawn(10, 47359);
    duplicate.handle.bootstrap(ring.node(5).peer()).await?;
    let failed = duplicate
        .expect_event("bootstrap failure", |event| {
            matches!(event, NodeEvent::BootstrapFailed(_))
        })
        .await?;
    assert!(matches!(failed, NodeEvent::BootstrapFailed(reason) if reason.contains("taken")));
    assert_eq!(duplicate.status().await?.state, RingState::Solitary);

    duplicate.handle.shutdown().await?;
    ring.shutdown().await
}

#[tokio::test]
async fn unanswered_bootstrap_gives_up() -> Result<()> {
    let _silent = UdpSocket::bind("127.0.0.1:47368").await?;
    let mut joiner = TestNode::spawn(3, 47369);
    joiner.handle.bootstrap(peer(9, 47368)).await?;
    joiner
        .expect_event("bootstrap failure", |event| {
            matches!(event, NodeEvent::BootstrapFailed(_))
        })
        .await?;
    assert_eq!(joiner.status().await?.state, RingState::Solitary);
    joiner.handle.shutdown().await
}
