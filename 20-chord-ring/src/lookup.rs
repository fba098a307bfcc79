//! Key lookups and object access.
//!
//! `find`, `get` and `set` share one routing primitive: a node answers for
//! the keys in its own arc and forwards everything else with
//! [`Node::send_to_closest`]. Answers (`RSP`, `RGET`) are routed back
//! towards the origin key the same way and matched to the request through
//! the correlation table.

use tracing::{debug, info, warn};

use crate::message::Message;
use crate::node::Node;
use crate::ring::{Peer, RingKey, Seq};
use crate::routing::DatagramClass;
use crate::runtime::{NodeError, NodeEvent};
use crate::store::Value;

/// Result of a lookup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// This node owns the key; here is the answer.
    Local(T),
    /// The request was routed; the answer arrives later as a `NodeEvent`
    /// carrying this sequence number.
    Pending(Seq),
}

/// Where a `set` ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    Forwarded,
}

impl Node {
    fn ensure_in_ring(&self) -> Result<(), NodeError> {
        if self.successor.is_none() {
            return Err(NodeError::NotInRing);
        }
        Ok(())
    }

    pub(crate) async fn find(&mut self, key: RingKey) -> Result<Lookup<Peer>, NodeError> {
        self.ensure_in_ring()?;
        if self.owns(key) {
            return Ok(Lookup::Local(self.identity));
        }
        let seq = self
            .requests
            .register_next(key, None)
            .map_err(|_| NodeError::TableFull)?;
        let find = Message::Find {
            key,
            seq,
            origin: self.identity,
        };
        self.send_to_closest(find, key).await;
        Ok(Lookup::Pending(seq))
    }

    pub(crate) async fn get(&mut self, key: RingKey) -> Result<Lookup<Option<Value>>, NodeError> {
        self.ensure_in_ring()?;
        if self.owns(key) {
            return Ok(Lookup::Local(self.store.get(key).cloned()));
        }
        let seq = self
            .requests
            .register_next(key, None)
            .map_err(|_| NodeError::TableFull)?;
        let get = Message::Get {
            key,
            seq,
            origin: self.identity,
        };
        self.send_to_closest(get, key).await;
        Ok(Lookup::Pending(seq))
    }

    pub(crate) async fn set(
        &mut self,
        key: RingKey,
        value: Option<Value>,
    ) -> Result<SetOutcome, NodeError> {
        self.ensure_in_ring()?;
        if self.owns(key) {
            self.store.set(key, value);
            return Ok(SetOutcome::Stored);
        }
        let set = Message::Set {
            key,
            seq: self.requests.unregistered_seq(),
            origin: self.key(),
            value,
        };
        self.send_to_closest(set, key).await;
        Ok(SetOutcome::Forwarded)
    }

    /// A `SET` from a leaving successor: the key is ours now, whatever the
    /// ownership test says.
    pub(crate) fn on_handoff(&mut self, key: RingKey, value: Option<Value>) {
        debug!(%key, "handoff from successor");
        self.store.set(key, value);
    }

    /// FND, GET, SET, RSP and RGET from any transport.
    pub(crate) async fn on_routed(&mut self, message: Message) {
        match message {
            Message::Find { key, seq, origin } => {
                if !self.owns(key) {
                    return self.send_to_closest(message, key).await;
                }
                let answer = Message::Response {
                    origin: origin.key,
                    seq,
                    owner: self.identity,
                };
                self.route_reply(answer, origin.key).await;
            }
            Message::Get { key, seq, origin } => {
                if !self.owns(key) {
                    return self.send_to_closest(message, key).await;
                }
                let answer = Message::GetReply {
                    origin: origin.key,
                    seq,
                    key,
                    value: self.store.get(key).cloned(),
                };
                self.route_reply(answer, origin.key).await;
            }
            Message::Set { key, .. } if !self.owns(key) => {
                self.send_to_closest(message, key).await
            }
            Message::Set { key, value, .. } => {
                debug!(%key, "stored routed value");
                self.store.set(key, value);
            }
            Message::Response { origin, .. } | Message::GetReply { origin, .. } => {
                self.route_reply(message, origin).await
            }
            message => warn!(tag = %message.tag(), "not a routed message"),
        }
    }

    async fn route_reply(&mut self, reply: Message, origin: RingKey) {
        if origin == self.key() {
            self.resolve(reply).await;
        } else if self.owns(origin) {
            warn!(%origin, tag = %reply.tag(), "origin no longer in the ring, dropping reply");
        } else {
            self.send_to_closest(reply, origin).await;
        }
    }

    /// Matches a reply addressed to this node with its request.
    async fn resolve(&mut self, reply: Message) {
        let seq = match &reply {
            Message::Response { seq, .. } | Message::GetReply { seq, .. } => *seq,
            _ => return,
        };
        let Some(request) = self.requests.drop_request(seq) else {
            warn!(%seq, tag = %reply.tag(), "reply for unknown request");
            return;
        };

        match (reply, request.reply_to) {
            (Message::Response { owner, .. }, Some(requester)) => {
                info!(%owner, %requester, "answering bootstrap request");
                self.send_tracked(requester, Message::EntryPred { owner }, DatagramClass::Entry)
                    .await;
            }
            (Message::Response { owner, .. }, None) => {
                self.emit(NodeEvent::KeyOwner {
                    seq,
                    key: request.key,
                    owner,
                });
            }
            (Message::GetReply { key, value, .. }, None) => {
                if key != request.key {
                    warn!(%seq, expected = %request.key, got = %key, "reply names another key");
                }
                self.emit(match value {
                    Some(value) => NodeEvent::Value { seq, key, value },
                    None => NodeEvent::ValueMissing { seq, key },
                });
            }
            (reply, _) => warn!(%seq, tag = %reply.tag(), "reply does not match its request"),
        }
    }
}
