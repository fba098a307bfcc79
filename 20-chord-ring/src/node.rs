//! Node state owned by the dispatcher.
//!
//! [`Node`] holds the ring links, the shortcut, the object store and both
//! bounded request tables. It is only ever touched from the worker task, so
//! nothing in here is shared or locked. The protocol handlers live in
//! [`crate::membership`], [`crate::lookup`] and [`crate::routing`] as further
//! `impl Node` blocks; this module covers link bookkeeping and the
//! per-line dispatch that feeds those handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::buffer::Received;
use crate::config::{NodeConfig, RuntimeTuning};
use crate::correlation::RequestTable;
use crate::link::{Link, LinkRole};
use crate::message::Message;
use crate::ring::{self, Peer, RingKey};
use crate::routing::PendingDatagrams;
use crate::runtime::NodeEvent;
use crate::store::ObjectStore;

/// Where a node stands with respect to a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// No sockets open.
    Solitary,
    /// Sockets open but at least one ring link is still missing.
    Joining,
    /// Successor and predecessor are both this node.
    AloneInRing,
    /// Distinct successor and predecessor links.
    Connected,
}

impl RingState {
    pub fn as_str(self) -> &'static str {
        match self {
            RingState::Solitary => "solitary",
            RingState::Joining => "joining",
            RingState::AloneInRing => "alone in ring",
            RingState::Connected => "connected",
        }
    }
}

/// Point-in-time view of a node, returned by `show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub identity: Peer,
    pub state: RingState,
    pub successor: Option<Peer>,
    pub predecessor: Option<Peer>,
    pub shortcut: Option<Peer>,
    pub store: BTreeMap<u8, String>,
    pub pending_requests: usize,
    pub pending_datagrams: usize,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_none(peer: Option<Peer>) -> String {
            peer.map_or_else(|| "none".to_string(), |peer| peer.to_string())
        }

        writeln!(f, "node {} [{}]", self.identity, self.state.as_str())?;
        writeln!(f, "successor: {}", or_none(self.successor))?;
        writeln!(f, "predecessor: {}", or_none(self.predecessor))?;
        writeln!(f, "shortcut: {}", or_none(self.shortcut))?;
        writeln!(
            f,
            "pending: {} requests, {} datagrams",
            self.pending_requests, self.pending_datagrams
        )?;
        if self.store.is_empty() {
            write!(f, "store: empty")
        } else {
            write!(f, "store:")?;
            for (key, value) in &self.store {
                write!(f, " {key}={value:?}")?;
            }
            Ok(())
        }
    }
}

pub(crate) struct Node {
    pub(crate) identity: Peer,
    pub(crate) bind_addr: SocketAddrV4,
    pub(crate) tuning: RuntimeTuning,
    pub(crate) listener: Option<TcpListener>,
    pub(crate) udp: Option<UdpSocket>,
    pub(crate) successor: Option<Link>,
    pub(crate) predecessor: Option<Link>,
    pub(crate) temp: Option<Link>,
    pub(crate) shortcut: Option<Peer>,
    pub(crate) store: ObjectStore,
    pub(crate) requests: RequestTable,
    pub(crate) datagrams: PendingDatagrams,
    /// Address of the bootstrap node while an `EFND` is outstanding.
    pub(crate) bootstrap: Option<SocketAddr>,
    /// Set once a successor has been installed since the sockets opened;
    /// ring repair only applies to nodes that were actually in a ring.
    pub(crate) had_successor: bool,
    events: UnboundedSender<NodeEvent>,
}

impl Node {
    pub(crate) fn new(config: NodeConfig, events: UnboundedSender<NodeEvent>) -> Self {
        Self {
            identity: config.identity,
            bind_addr: config.bind_addr(),
            tuning: config.tuning,
            listener: None,
            udp: None,
            successor: None,
            predecessor: None,
            temp: None,
            shortcut: None,
            store: ObjectStore::new(),
            requests: RequestTable::new(),
            datagrams: PendingDatagrams::new(config.tuning.udp_timeout, config.tuning.udp_retries),
            bootstrap: None,
            had_successor: false,
            events,
        }
    }

    pub(crate) fn key(&self) -> RingKey {
        self.identity.key
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // The receiver may legitimately be gone (e.g. a test that ignores events).
        let _ = self.events.send(event);
    }

    /// Whether the listener and UDP socket are open.
    pub(crate) fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    pub(crate) fn successor_peer(&self) -> Option<Peer> {
        self.successor.as_ref().and_then(|link| link.peer)
    }

    pub(crate) fn predecessor_peer(&self) -> Option<Peer> {
        self.predecessor.as_ref().and_then(|link| link.peer)
    }

    /// Key bounding this node's arc. Without a successor the node treats
    /// itself as solitary and claims the whole ring.
    pub(crate) fn successor_key(&self) -> RingKey {
        self.successor_peer().map_or(self.key(), |peer| peer.key)
    }

    pub(crate) fn owns(&self, key: RingKey) -> bool {
        ring::owns(self.key(), self.successor_key(), key)
    }

    pub(crate) fn state(&self) -> RingState {
        if !self.is_open() {
            return RingState::Solitary;
        }
        match (self.successor_peer(), self.predecessor_peer()) {
            (Some(succ), Some(pred)) if succ == self.identity && pred == self.identity => {
                RingState::AloneInRing
            }
            (Some(_), Some(_)) => RingState::Connected,
            _ => RingState::Joining,
        }
    }

    pub(crate) fn status(&self) -> NodeStatus {
        NodeStatus {
            identity: self.identity,
            state: self.state(),
            successor: self.successor_peer(),
            predecessor: self.predecessor_peer(),
            shortcut: self.shortcut,
            store: self.store.snapshot(),
            pending_requests: self.requests.in_flight(),
            pending_datagrams: self.datagrams.len(),
        }
    }

    pub(crate) fn link_mut(&mut self, role: LinkRole) -> &mut Option<Link> {
        match role {
            LinkRole::Successor => &mut self.successor,
            LinkRole::Predecessor => &mut self.predecessor,
            LinkRole::Temp => &mut self.temp,
        }
    }

    /// Drops the link in `role`. Ring repair, if needed, happens at the end
    /// of the dispatcher pass.
    pub(crate) fn close_link(&mut self, role: LinkRole, reason: &str) {
        let Some(link) = self.link_mut(role).take() else {
            return;
        };
        let peer = link
            .peer
            .map_or_else(|| link.remote().to_string(), |peer| peer.to_string());
        warn!(link = role.as_str(), %peer, reason, "closing link");
        match role {
            LinkRole::Successor => self.emit(NodeEvent::SuccessorChanged(None)),
            LinkRole::Predecessor => self.emit(NodeEvent::PredecessorChanged(None)),
            LinkRole::Temp => {}
        }
    }

    /// Closes every socket and forgets all in-flight traffic.
    pub(crate) fn close_all(&mut self) {
        self.successor = None;
        self.predecessor = None;
        self.temp = None;
        self.listener = None;
        self.udp = None;
        self.shortcut = None;
        self.bootstrap = None;
        self.had_successor = false;
        self.requests.clear();
        self.datagrams.clear();
    }

    pub(crate) fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, remote)) => {
                if self.temp.is_some() {
                    warn!(%remote, "temp link busy, refusing connection");
                    drop(stream);
                    return;
                }
                debug!(%remote, "accepted connection");
                self.temp = Some(Link::accepted(stream, remote));
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }

    /// The first link (successor, predecessor, temp) already holding a
    /// complete line from an earlier read.
    pub(crate) fn backlogged(&self) -> Option<LinkRole> {
        [
            (LinkRole::Successor, &self.successor),
            (LinkRole::Predecessor, &self.predecessor),
            (LinkRole::Temp, &self.temp),
        ]
        .into_iter()
        .find(|(_, link)| link.as_ref().is_some_and(Link::has_backlog))
        .map(|(role, _)| role)
    }

    pub(crate) async fn service_backlog(&mut self, role: LinkRole) {
        let Some(link) = self.link_mut(role).as_mut() else {
            return;
        };
        match link.next_buffered() {
            Ok(Some(line)) => self.handle_line(role, line).await,
            Ok(None) => {}
            Err(err) => self.close_link(role, &err.to_string()),
        }
    }

    pub(crate) async fn on_link_read(&mut self, role: LinkRole, read: io::Result<Vec<u8>>) {
        let Some(link) = self.link_mut(role).as_mut() else {
            return;
        };
        match link.absorb(read) {
            Ok(Received::Complete(line)) => self.handle_line(role, line).await,
            Ok(Received::Partial) => {}
            Ok(Received::Disconnected) => self.close_link(role, "peer disconnected"),
            Ok(Received::Failed(err)) => self.close_link(role, &err.to_string()),
            Err(err) => self.close_link(role, &err.to_string()),
        }
    }

    async fn handle_line(&mut self, role: LinkRole, line: String) {
        let message = match Message::parse(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(link = role.as_str(), %err, "discarding malformed message");
                if role == LinkRole::Temp || err.is_handshake() {
                    self.close_link(role, "malformed handshake");
                }
                return;
            }
        };
        debug!(link = role.as_str(), %message, "received");

        match (role, message) {
            (LinkRole::Temp, Message::SelfNode(joiner)) => self.on_self(joiner).await,
            (LinkRole::Predecessor, Message::Pred(peer)) => self.on_pred(peer).await,
            (LinkRole::Successor, message) => self.on_successor_message(message).await,
            (LinkRole::Predecessor, message) if is_routed(&message) => {
                self.on_routed(message).await
            }
            (LinkRole::Temp, message) => {
                warn!(tag = %message.tag(), "expected SELF on unclassified connection");
                self.close_link(LinkRole::Temp, "no SELF handshake");
            }
            (role, message) => {
                warn!(link = role.as_str(), tag = %message.tag(), "unexpected message on link")
            }
        }
    }

    /// Traffic arriving from the successor: handoff SETs from a leaving
    /// successor, plus any routed message. Also used for lines drained out
    /// of a successor link that is being replaced.
    pub(crate) async fn on_successor_message(&mut self, message: Message) {
        match message {
            Message::Set { key, value, .. } => self.on_handoff(key, value),
            message if is_routed(&message) => self.on_routed(message).await,
            message => warn!(tag = %message.tag(), "unexpected message from successor"),
        }
    }

    pub(crate) async fn process_drained(&mut self, role: LinkRole, lines: Vec<String>) {
        for line in lines {
            match Message::parse(&line) {
                Ok(message) => match role {
                    LinkRole::Successor => self.on_successor_message(message).await,
                    _ if is_routed(&message) => self.on_routed(message).await,
                    _ => debug!(tag = %message.tag(), "ignoring drained message"),
                },
                Err(err) => warn!(link = role.as_str(), %err, "discarding malformed message"),
            }
        }
    }

    pub(crate) fn announce_topology(&self) {
        info!(
            state = self.state().as_str(),
            successor = ?self.successor_peer().map(|peer| peer.key.get()),
            predecessor = ?self.predecessor_peer().map(|peer| peer.key.get()),
            "ring topology changed"
        );
    }
}

pub(crate) fn is_routed(message: &Message) -> bool {
    matches!(
        message,
        Message::Find { .. }
            | Message::Response { .. }
            | Message::Get { .. }
            | Message::GetReply { .. }
            | Message::Set { .. }
    )
}
