//! Dispatcher task and the handle used to drive it.
//!
//! A node runs as a single tokio task, the [`Worker`], which owns all node
//! state and multiplexes every input with `tokio::select!`:
//!
//! - the TCP listener and the successor, predecessor and temp links
//! - the UDP socket
//! - commands from [`NodeHandle`]
//! - a short tick that keeps the UDP retry sweep running while idle
//!
//! Lines already reassembled in a link buffer are handled before the next
//! wait, in successor, predecessor, temp order. Results of routed lookups
//! come back asynchronously and are delivered as [`NodeEvent`]s.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::link::{Link, LinkRole};
use crate::lookup::{Lookup, SetOutcome};
use crate::node::{Node, NodeStatus};
use crate::ring::{Peer, RingKey, Seq};
use crate::routing::recv_datagram;
use crate::store::Value;

/// Reasons a command is refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("not part of a ring")]
    NotInRing,
    #[error("already part of a ring")]
    AlreadyInRing,
    #[error("too many requests in flight")]
    TableFull,
    #[error("a node cannot be its own shortcut")]
    ShortcutIsSelf,
    #[error("node has stopped")]
    Stopped,
}

/// Asynchronous notifications from a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    RingCreated(Peer),
    SuccessorChanged(Option<Peer>),
    PredecessorChanged(Option<Peer>),
    KeyOwner { seq: Seq, key: RingKey, owner: Peer },
    Value { seq: Seq, key: RingKey, value: Value },
    ValueMissing { seq: Seq, key: RingKey },
    LeftRing,
    BootstrapResolved(Peer),
    BootstrapFailed(String),
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::RingCreated(node) => write!(f, "created ring as node {node}"),
            NodeEvent::SuccessorChanged(Some(peer)) => write!(f, "successor is node {peer}"),
            NodeEvent::SuccessorChanged(None) => write!(f, "successor lost"),
            NodeEvent::PredecessorChanged(Some(peer)) => write!(f, "predecessor is node {peer}"),
            NodeEvent::PredecessorChanged(None) => write!(f, "predecessor lost"),
            NodeEvent::KeyOwner { key, owner, .. } => write!(f, "key {key} belongs to node {owner}"),
            NodeEvent::Value { key, value, .. } => write!(f, "key {key} = {value}"),
            NodeEvent::ValueMissing { key, .. } => write!(f, "key {key} not found"),
            NodeEvent::LeftRing => write!(f, "left the ring"),
            NodeEvent::BootstrapResolved(owner) => write!(f, "joining through node {owner}"),
            NodeEvent::BootstrapFailed(reason) => write!(f, "bootstrap failed: {reason}"),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Create(Reply<()>),
    Join(Peer, Reply<()>),
    Bootstrap(Peer, Reply<()>),
    Find(RingKey, Reply<Lookup<Peer>>),
    Get(RingKey, Reply<Lookup<Option<Value>>>),
    Set(RingKey, Option<Value>, Reply<SetOutcome>),
    SetShortcut(Peer, Reply<()>),
    ClearShortcut(Reply<()>),
    Status(Reply<NodeStatus>),
    Leave(Reply<()>),
    Shutdown(Reply<()>),
}

/// Handle for sending commands to a running node.
///
/// Cloning is cheap; every clone talks to the same worker. The worker stops
/// after [`shutdown`](Self::shutdown) or once every handle is dropped.
#[derive(Clone)]
pub struct NodeHandle {
    identity: Peer,
    commands: mpsc::UnboundedSender<Command>,
}

impl NodeHandle {
    pub fn identity(&self) -> Peer {
        self.identity
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| NodeError::Stopped)?;
        reply_rx
            .await
            .map_err(|_| NodeError::Stopped)
            .context("worker dropped the request")?
    }

    /// Creates a new ring with this node as its only member.
    pub async fn create(&self) -> Result<()> {
        self.request(Command::Create).await
    }

    /// Joins an existing ring, `predecessor` being the node we insert after.
    pub async fn join(&self, predecessor: Peer) -> Result<()> {
        self.request(|reply| Command::Join(predecessor, reply)).await
    }

    /// Joins a ring through any member, which looks up our predecessor.
    pub async fn bootstrap(&self, boot: Peer) -> Result<()> {
        self.request(|reply| Command::Bootstrap(boot, reply)).await
    }

    pub async fn find(&self, key: RingKey) -> Result<Lookup<Peer>> {
        self.request(|reply| Command::Find(key, reply)).await
    }

    pub async fn get(&self, key: RingKey) -> Result<Lookup<Option<Value>>> {
        self.request(|reply| Command::Get(key, reply)).await
    }

    /// Stores `value` under `key`; `None` deletes it.
    pub async fn set(&self, key: RingKey, value: Option<Value>) -> Result<SetOutcome> {
        self.request(|reply| Command::Set(key, value, reply)).await
    }

    pub async fn set_shortcut(&self, shortcut: Peer) -> Result<()> {
        self.request(|reply| Command::SetShortcut(shortcut, reply))
            .await
    }

    pub async fn clear_shortcut(&self) -> Result<()> {
        self.request(Command::ClearShortcut).await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(Command::Status).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.request(Command::Leave).await
    }

    /// Leaves the ring if needed and stops the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

/// Spawns a node on the current tokio runtime.
///
/// The node starts outside any ring; sockets are only opened by `create`,
/// `join` or `bootstrap`.
pub fn spawn_node(config: NodeConfig) -> (NodeHandle, mpsc::UnboundedReceiver<NodeEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let identity = config.identity;

    let worker = Worker {
        node: Node::new(config, event_tx),
        commands: command_rx,
    };
    tokio::spawn(worker.run());

    (
        NodeHandle {
            identity,
            commands: command_tx,
        },
        event_rx,
    )
}

enum Event {
    Command(Option<Command>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    LinkRead(LinkRole, io::Result<Vec<u8>>),
    Datagram(io::Result<(Vec<u8>, SocketAddr)>),
    Tick,
}

enum Flow {
    Continue,
    Stop,
}

struct Worker {
    node: Node,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Worker {
    async fn run(mut self) {
        info!(node = %self.node.identity, "node started");
        loop {
            if let Some(role) = self.node.backlogged() {
                self.node.service_backlog(role).await;
            } else {
                let flow = match self.next_event().await {
                    Event::Command(Some(command)) => self.handle_command(command).await,
                    Event::Command(None) => {
                        debug!("all handles dropped");
                        if self.node.is_open() {
                            let _ = self.node.leave().await;
                        }
                        Flow::Stop
                    }
                    Event::Accepted(accepted) => {
                        self.node.on_accept(accepted);
                        Flow::Continue
                    }
                    Event::LinkRead(role, read) => {
                        self.node.on_link_read(role, read).await;
                        Flow::Continue
                    }
                    Event::Datagram(received) => {
                        self.node.on_datagram(received).await;
                        Flow::Continue
                    }
                    Event::Tick => Flow::Continue,
                };
                if let Flow::Stop = flow {
                    break;
                }
            }
            self.node.run_sweep(Instant::now()).await;
            self.node.repair_if_orphaned().await;
        }
        info!(node = %self.node.identity, "node stopped");
    }

    async fn next_event(&mut self) -> Event {
        let tick = self.node.tuning.tick;
        let Node {
            listener,
            successor,
            predecessor,
            temp,
            udp,
            ..
        } = &mut self.node;

        tokio::select! {
            command = self.commands.recv() => Event::Command(command),
            accepted = accept(listener.as_ref()) => Event::Accepted(accepted),
            read = read_link(successor.as_mut()) => Event::LinkRead(LinkRole::Successor, read),
            read = read_link(predecessor.as_mut()) => Event::LinkRead(LinkRole::Predecessor, read),
            read = read_link(temp.as_mut()) => Event::LinkRead(LinkRole::Temp, read),
            received = recv_datagram(udp.as_ref()) => Event::Datagram(received),
            _ = sleep(tick) => Event::Tick,
        }
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        let node = &mut self.node;
        match command {
            Command::Create(reply) => {
                let _ = reply.send(node.create_ring().await);
            }
            Command::Join(predecessor, reply) => {
                let _ = reply.send(node.join_ring(predecessor).await);
            }
            Command::Bootstrap(boot, reply) => {
                let _ = reply.send(node.bootstrap(boot).await);
            }
            Command::Find(key, reply) => {
                let _ = reply.send(node.find(key).await.map_err(Into::into));
            }
            Command::Get(key, reply) => {
                let _ = reply.send(node.get(key).await.map_err(Into::into));
            }
            Command::Set(key, value, reply) => {
                let _ = reply.send(node.set(key, value).await.map_err(Into::into));
            }
            Command::SetShortcut(shortcut, reply) => {
                let result = if shortcut.key == node.key() {
                    Err(NodeError::ShortcutIsSelf.into())
                } else {
                    info!(%shortcut, "shortcut set");
                    node.shortcut = Some(shortcut);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::ClearShortcut(reply) => {
                if node.shortcut.take().is_some() {
                    info!("shortcut cleared");
                }
                let _ = reply.send(Ok(()));
            }
            Command::Status(reply) => {
                let _ = reply.send(Ok(node.status()));
            }
            Command::Leave(reply) => {
                let _ = reply.send(node.leave().await);
            }
            Command::Shutdown(reply) => {
                if node.is_open() {
                    let _ = node.leave().await;
                }
                let _ = reply.send(Ok(()));
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn read_link(link: Option<&mut Link>) -> io::Result<Vec<u8>> {
    match link {
        Some(link) => link.read_chunk().await,
        None => std::future::pending().await,
    }
}
