//! Ring membership: creating, joining and leaving rings, reacting to the
//! `SELF`/`PRED` handshakes, handing objects over when ownership moves, and
//! the UDP bootstrap exchange (`EFND`/`EPRED`).
//!
//! Link naming follows the direction of the handshake. A node's predecessor
//! link is the connection it opened and sent `SELF` on; its successor link is
//! an accepted connection on which `SELF` arrived.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::link::{Link, LinkRole};
use crate::message::Message;
use crate::node::Node;
use crate::ring::{distance, Peer, RingKey};
use crate::routing::DatagramClass;
use crate::runtime::{NodeError, NodeEvent};

impl Node {
    async fn open_sockets(&mut self) -> Result<()> {
        let addr = self.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
        let udp = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        info!(%addr, "sockets open");
        self.listener = Some(listener);
        self.udp = Some(udp);
        Ok(())
    }

    fn ensure_outside_ring(&self) -> Result<(), NodeError> {
        if self.is_open() {
            return Err(NodeError::AlreadyInRing);
        }
        Ok(())
    }

    /// `new`: a ring with this node as its only member.
    pub(crate) async fn create_ring(&mut self) -> Result<()> {
        self.ensure_outside_ring()?;
        self.open_sockets().await?;
        if let Err(err) = self.connect_to_self().await {
            self.close_all();
            return Err(err);
        }
        info!(node = %self.identity, "created ring");
        self.emit(NodeEvent::RingCreated(self.identity));
        Ok(())
    }

    /// Loopback connection making this node its own successor and
    /// predecessor.
    ///
    /// Connections already queued on the listener are accepted as ordinary
    /// temp links until our own arrives.
    async fn connect_to_self(&mut self) -> Result<()> {
        let outbound = timeout(
            self.tuning.connect_timeout,
            TcpStream::connect(self.identity.socket_addr()),
        )
        .await
        .context("loopback connection timed out")?
        .context("loopback connection failed")?;
        let local = outbound.local_addr()?;

        let (inbound, remote) = loop {
            let listener = self
                .listener
                .as_ref()
                .context("listener must be open to connect to self")?;
            let (stream, remote) = timeout(self.tuning.connect_timeout, listener.accept())
                .await
                .context("loopback connection was never accepted")??;
            if remote == local {
                break (stream, remote);
            }
            self.on_accept(Ok((stream, remote)));
        };

        self.install_predecessor(Link::from_stream(self.identity, outbound))
            .await;
        let mut inbound = Link::accepted(inbound, remote);
        inbound.peer = Some(self.identity);
        self.install_successor(inbound).await;
        Ok(())
    }

    /// `pentry`: join the ring through the node that will be our
    /// predecessor. The successor arrives later as a `SELF` on a temp link.
    pub(crate) async fn join_ring(&mut self, predecessor: Peer) -> Result<()> {
        self.ensure_outside_ring()?;
        self.open_sockets().await?;
        if let Err(err) = self.connect_predecessor(predecessor).await {
            self.close_all();
            return Err(err);
        }
        Ok(())
    }

    async fn connect_predecessor(&mut self, predecessor: Peer) -> Result<()> {
        let mut link = Link::connect(predecessor, self.tuning.connect_timeout)
            .await
            .with_context(|| format!("failed to connect to node {predecessor}"))?;
        link.send(&Message::SelfNode(self.identity))
            .await
            .with_context(|| format!("failed to announce ourselves to node {predecessor}"))?;
        self.install_predecessor(link).await;
        Ok(())
    }

    /// `bentry`: ask a known node which ring member should be our
    /// predecessor.
    pub(crate) async fn bootstrap(&mut self, boot: Peer) -> Result<()> {
        self.ensure_outside_ring()?;
        self.open_sockets().await?;
        let addr = boot.socket_addr();
        self.bootstrap = Some(addr);
        info!(boot = %boot, "bootstrapping");
        self.send_tracked(addr, Message::EntryFind { key: self.key() }, DatagramClass::Entry)
            .await;
        Ok(())
    }

    pub(crate) fn fail_bootstrap(&mut self, reason: &str) {
        warn!(reason, "bootstrap failed");
        self.close_all();
        self.emit(NodeEvent::BootstrapFailed(reason.to_string()));
    }

    /// A node announced itself on the temp link and becomes our successor.
    pub(crate) async fn on_self(&mut self, joiner: Peer) {
        let Some(mut temp) = self.temp.take() else {
            return;
        };
        temp.peer = Some(joiner);

        if joiner == self.identity {
            info!("loopback handshake, ring is down to this node");
            self.install_successor(temp).await;
            return;
        }
        if joiner.key == self.key() {
            warn!(%joiner, "refusing node that claims our key");
            return;
        }

        match self.successor_peer() {
            Some(successor) if successor != self.identity => {
                if distance(self.key(), joiner.key) > distance(self.key(), successor.key) {
                    warn!(%joiner, %successor, "joining node is outside our arc, ring order breaks");
                }
                info!(%joiner, %successor, "node joins between us and our successor");
                self.send_to_successor(&Message::Pred(joiner)).await;
            }
            _ if self.predecessor_is_open_slot() => {
                info!(%joiner, "closing the ring through the new node");
                if let Err(err) = self.connect_predecessor(joiner).await {
                    warn!(%joiner, err = %format!("{err:#}"), "connect-back failed");
                    return;
                }
            }
            // We joined through our predecessor and this is the successor
            // it sent us.
            _ => info!(%joiner, "adopting the node our predecessor handed over"),
        }

        self.install_successor(temp).await;
    }

    /// Our predecessor changed hands: connect to the named node.
    pub(crate) async fn on_pred(&mut self, peer: Peer) {
        info!(%peer, "told to adopt new predecessor");
        if let Err(err) = self.connect_predecessor(peer).await {
            warn!(%peer, err = %format!("{err:#}"), "could not reach new predecessor");
        }
    }

    /// Predecessor link absent or pointing back at this node.
    fn predecessor_is_open_slot(&self) -> bool {
        self.predecessor.is_none() || self.predecessor_peer() == Some(self.identity)
    }

    async fn install_successor(&mut self, link: Link) {
        if let Some(mut old) = self.successor.take() {
            let lines = old.drain_ready();
            drop(old);
            self.process_drained(LinkRole::Successor, lines).await;
        }
        let peer = link.peer;
        self.successor = Some(link);
        self.had_successor = true;
        self.emit(NodeEvent::SuccessorChanged(peer));
        self.announce_topology();
        self.redistribute().await;
    }

    async fn install_predecessor(&mut self, link: Link) {
        if let Some(mut old) = self.predecessor.take() {
            let lines = old.drain_ready();
            drop(old);
            self.process_drained(LinkRole::Predecessor, lines).await;
        }
        let peer = link.peer;
        self.predecessor = Some(link);
        self.emit(NodeEvent::PredecessorChanged(peer));
        self.announce_topology();
    }

    /// Hands every stored key now closer to the successor over to it.
    async fn redistribute(&mut self) {
        let Some(successor) = self.successor_peer() else {
            return;
        };
        if successor == self.identity {
            return;
        }
        let me = self.key();
        let moved = self
            .store
            .drain_where(|key| distance(successor.key, key) < distance(me, key));
        if moved.is_empty() {
            return;
        }
        info!(count = moved.len(), %successor, "handing keys to new successor");
        for (key, value) in moved {
            let seq = self.requests.unregistered_seq();
            let handoff = Message::Set {
                key,
                seq,
                origin: me,
                value: Some(value),
            };
            self.send_to_successor(&handoff).await;
        }
    }

    /// `leave`: pass every key to the predecessor, tell the successor who
    /// its new predecessor is, then close everything.
    pub(crate) async fn leave(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(NodeError::NotInRing.into());
        }
        info!(state = "leaving", "leaving ring");

        let me = self.identity;
        let predecessor = self.predecessor_peer().filter(|peer| *peer != me);
        let successor = self.successor_peer().filter(|peer| *peer != me);

        if let (Some(_), Some(link)) = (predecessor, self.predecessor.as_mut()) {
            let entries = self.store.drain_where(|_| true);
            for (key, value) in entries {
                let seq = self.requests.unregistered_seq();
                let handoff = Message::Set {
                    key,
                    seq,
                    origin: me.key,
                    value: Some(value),
                };
                if let Err(err) = link.send(&handoff).await {
                    warn!(%err, %key, "handoff to predecessor failed");
                    break;
                }
            }
        }

        if let (Some(predecessor), Some(_), Some(link)) =
            (predecessor, successor, self.successor.as_mut())
        {
            if let Err(err) = link.send(&Message::Pred(predecessor)).await {
                warn!(%err, "could not hand our predecessor to our successor");
            }
        }

        if !self.store.is_empty() {
            warn!(lost = self.store.len(), "no neighbour to take our keys");
        }

        self.close_all();
        info!("left ring");
        self.emit(NodeEvent::LeftRing);
        Ok(())
    }

    /// Reconnects to ourselves when every ring link is gone but the node was
    /// part of a ring.
    pub(crate) async fn repair_if_orphaned(&mut self) {
        if !self.is_open()
            || !self.had_successor
            || self.successor.is_some()
            || self.predecessor.is_some()
        {
            return;
        }
        warn!("lost both ring links, reforming ring alone");
        if let Err(err) = self.connect_to_self().await {
            warn!(err = %format!("{err:#}"), "ring repair failed");
            self.had_successor = false;
        }
    }

    /// `EFND` from a node outside the ring: find the owner of its key and
    /// answer with `EPRED` once known.
    pub(crate) async fn on_entry_find(&mut self, key: RingKey, from: SocketAddr) {
        if self.successor.is_none() {
            warn!(%from, "not in a ring, ignoring EFND");
            return;
        }
        if self.owns(key) {
            let answer = Message::EntryPred {
                owner: self.identity,
            };
            self.send_tracked(from, answer, DatagramClass::Entry).await;
            return;
        }
        match self.requests.register_next(key, Some(from)) {
            Ok(seq) => {
                let find = Message::Find {
                    key,
                    seq,
                    origin: self.identity,
                };
                self.send_to_closest(find, key).await;
            }
            Err(err) => warn!(%from, %err, "cannot track EFND"),
        }
    }

    /// `EPRED` answering our bootstrap: join through the named owner.
    pub(crate) async fn on_entry_pred(&mut self, owner: Peer) {
        if self.bootstrap.take().is_none() {
            warn!(%owner, "unexpected EPRED");
            return;
        }
        if owner.key == self.key() {
            self.fail_bootstrap("key already taken in this ring");
            return;
        }
        info!(%owner, "bootstrap resolved");
        self.emit(NodeEvent::BootstrapResolved(owner));
        if let Err(err) = self.connect_predecessor(owner).await {
            self.fail_bootstrap(&format!("{err:#}"));
        }
    }
}
