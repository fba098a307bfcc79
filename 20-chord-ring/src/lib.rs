//! Chord-style distributed hash table on a 32-position ring.
//!
//! Each process is a ring member identified by a key in `[0, 32)`. Members
//! keep one TCP link to their successor and one to their predecessor, may
//! route through a single manual UDP shortcut, and store the values of the
//! keys in their arc of the ring. The modules, leaves first:
//!
//! - [`ring`] has keys, distances, peer identities and the ownership test.
//! - [`message`] is the line-oriented wire codec.
//! - [`buffer`] reassembles lines from a TCP byte stream, and [`link`]
//!   pairs one with its socket.
//! - [`store`] is the per-node key-value table.
//! - [`correlation`] matches asynchronous replies to their requests.
//! - [`routing`] chooses between successor and shortcut and retries
//!   unacknowledged datagrams.
//! - [`membership`] covers create, join, leave, redistribution and bootstrap.
//! - [`lookup`] covers find, get and set.
//! - [`runtime`] drives a node as one tokio task behind a [`NodeHandle`].
//! - [`config`], [`cli`], [`protocol`] and [`console`] make up the binary.

pub mod buffer;
pub mod cli;
pub mod config;
pub mod console;
pub mod correlation;
pub mod link;
pub mod lookup;
mod membership;
pub mod message;
pub mod node;
pub mod protocol;
pub mod ring;
pub mod routing;
pub mod runtime;
pub mod store;

pub use config::{NodeConfig, RuntimeTuning};
pub use lookup::{Lookup, SetOutcome};
pub use node::{NodeStatus, RingState};
pub use ring::{distance, owns, Peer, RingKey, Seq};
pub use runtime::{spawn_node, NodeError, NodeEvent, NodeHandle};
pub use store::Value;
