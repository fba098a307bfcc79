//! Identifier ring primitives.
//!
//! Every node and every stored object lives on a fixed ring of [`RING_SIZE`]
//! positions. Distances are always measured clockwise, so `distance(a, b)`
//! and `distance(b, a)` add up to the ring size (or are both zero).
//!
//! A node owns the arc that starts at its own key and ends just before its
//! successor's key. [`owns`] is the single ownership test used for both
//! lookups and storage.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::message::FieldError;

/// Number of positions on the identifier ring.
pub const RING_SIZE: u8 = 32;

/// Number of request sequence numbers (and correlation slots).
pub const SEQ_SPACE: u8 = 100;

/// A position on the ring, always in `[0, RING_SIZE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingKey(u8);

impl RingKey {
    pub fn new(value: u8) -> Result<Self, FieldError> {
        if value < RING_SIZE {
            Ok(Self(value))
        } else {
            Err(FieldError::KeyOutOfRange(value.into()))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Iterates over every key on the ring in ascending order.
    pub fn all() -> impl Iterator<Item = RingKey> {
        (0..RING_SIZE).map(RingKey)
    }
}

impl FromStr for RingKey {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = parse_unsigned(s)?;
        if value >= u64::from(RING_SIZE) {
            return Err(FieldError::KeyOutOfRange(value));
        }
        Ok(Self(value as u8))
    }
}

impl fmt::Display for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request sequence number, always in `[0, SEQ_SPACE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u8);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn new(value: u8) -> Result<Self, FieldError> {
        if value < SEQ_SPACE {
            Ok(Self(value))
        } else {
            Err(FieldError::SeqOutOfRange(value.into()))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// The sequence number following this one, wrapping at [`SEQ_SPACE`].
    pub fn next(self) -> Self {
        Self((self.0 + 1) % SEQ_SPACE)
    }
}

impl FromStr for Seq {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = parse_unsigned(s)?;
        if value >= u64::from(SEQ_SPACE) {
            return Err(FieldError::SeqOutOfRange(value));
        }
        Ok(Self(value as u8))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a ring member: its key plus the address serving both its TCP
/// listener and its UDP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub key: RingKey,
    pub addr: SocketAddrV4,
}

impl Peer {
    pub fn new(key: RingKey, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            key,
            addr: SocketAddrV4::new(ip, port),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.addr)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.addr)
    }
}

/// Clockwise distance from `from` to `to`: `(to - from) mod RING_SIZE`.
pub fn distance(from: RingKey, to: RingKey) -> u8 {
    (to.0 + RING_SIZE - from.0) % RING_SIZE
}

/// Whether `node` owns `key` given its successor's position.
///
/// A solitary node (successor equal to itself) owns every key.
pub fn owns(node: RingKey, successor: RingKey, key: RingKey) -> bool {
    distance(node, key) <= distance(successor, key)
}

pub(crate) fn parse_unsigned(s: &str) -> Result<u64, FieldError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FieldError::NotANumber(s.to_string()));
    }
    s.parse::<u64>()
        .map_err(|_| FieldError::NotANumber(s.to_string()))
}

pub(crate) fn parse_port(s: &str) -> Result<u16, FieldError> {
    let value = parse_unsigned(s)?;
    u16::try_from(value).map_err(|_| FieldError::PortOutOfRange(value))
}

pub(crate) fn parse_ip(s: &str) -> Result<Ipv4Addr, FieldError> {
    Ipv4Addr::from_str(s).map_err(|_| FieldError::BadIp(s.to_string()))
}
