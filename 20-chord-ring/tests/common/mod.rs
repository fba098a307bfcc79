//! Harness shared by the integration tests: real nodes on loopback, each
//! test on its own fixed block of ports.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chord_ring::{
    spawn_node, NodeConfig, NodeEvent, NodeHandle, NodeStatus, Peer, RingKey, RingState, Value,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn key(value: u8) -> RingKey {
    RingKey::new(value).expect("valid key")
}

pub fn value(raw: &str) -> Value {
    Value::new(raw).expect("valid value")
}

pub fn peer(k: u8, port: u16) -> Peer {
    Peer::new(key(k), Ipv4Addr::LOCALHOST, port)
}

pub struct TestNode {
    pub handle: NodeHandle,
    pub events: UnboundedReceiver<NodeEvent>,
}

impl TestNode {
    pub fn spawn(k: u8, port: u16) -> Self {
        let config = NodeConfig::new(peer(k, port)).with_bind(Ipv4Addr::LOCALHOST);
        let (handle, events) = spawn_node(config);
        Self { handle, events }
    }

    pub fn peer(&self) -> Peer {
        self.handle.identity()
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.handle.status().await
    }

    /// Polls the node until `check` holds.
    pub async fn wait_until<F>(&self, what: &str, check: F) -> Result<NodeStatus>
    where
        F: Fn(&NodeStatus) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        loop {
            let status = self.status().await?;
            if check(&status) {
                return Ok(status);
            }
            if Instant::now() > deadline {
                bail!("timed out waiting for {what}; last status:\n{status}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Skips events until one satisfies `check`.
    pub async fn expect_event<F>(&mut self, what: &str, check: F) -> Result<NodeEvent>
    where
        F: Fn(&NodeEvent) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) if check(&event) => return Ok(event),
                Ok(Some(_)) => continue,
                Ok(None) => bail!("event stream closed while waiting for {what}"),
                Err(_) => return Err(anyhow!("timed out waiting for {what}")),
            }
        }
    }
}

/// Nodes forming one ring, listed in clockwise key order.
pub struct TestRing {
    pub nodes: Vec<TestNode>,
}

impl TestRing {
    /// Creates the ring on the first key and joins every later key through
    /// the node before it. Ports are `base_port + index`.
    pub async fn form(keys: &[u8], base_port: u16) -> Result<Self> {
        let mut nodes: Vec<TestNode> = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            let node = TestNode::spawn(*k, base_port + i as u16);
            match nodes.last() {
                None => node.handle.create().await?,
                Some(previous) => node.handle.join(previous.peer()).await?,
            }
            nodes.push(node);
            let ring = Self { nodes };
            ring.wait_settled().await?;
            nodes = ring.nodes;
        }
        Ok(Self { nodes })
    }

    pub fn node(&self, k: u8) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.peer().key == key(k))
            .expect("node is part of the ring")
    }

    pub fn node_mut(&mut self, k: u8) -> &mut TestNode {
        self.nodes
            .iter_mut()
            .find(|node| node.peer().key == key(k))
            .expect("node is part of the ring")
    }

    /// Waits until every node's links match the clockwise order.
    pub async fn wait_settled(&self) -> Result<()> {
        let count = self.nodes.len();
        for (i, node) in self.nodes.iter().enumerate() {
            let successor = self.nodes[(i + 1) % count].peer();
            let predecessor = self.nodes[(i + count - 1) % count].peer();
            let expected_state = if count == 1 {
                RingState::AloneInRing
            } else {
                RingState::Connected
            };
            node.wait_until(&format!("node {} to settle", node.peer()), |status| {
                status.successor == Some(successor)
                    && status.predecessor == Some(predecessor)
                    && status.state == expected_state
            })
            .await?;
        }
        Ok(())
    }

    pub async fn shutdown(self) -> Result<()> {
        for node in &self.nodes {
            let _ = node.handle.shutdown().await;
        }
        Ok(())
    }
}
