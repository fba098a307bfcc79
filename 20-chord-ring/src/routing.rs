//! Forwarding decisions and best-effort UDP delivery.
//!
//! Routed messages normally travel clockwise over the successor link. When a
//! shortcut is configured and lands closer to the target key, the message is
//! sent to it as a UDP datagram instead and tracked in [`PendingDatagrams`]
//! until the shortcut ACKs it. Unacknowledged datagrams are resent a fixed
//! number of times by [`PendingDatagrams::sweep`]; after that a lookup falls
//! back to the successor link and a bootstrap datagram is dropped.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::link::LinkRole;
use crate::message::{Message, MAX_MESSAGE_LEN};
use crate::node::{is_routed, Node};
use crate::ring::{distance, RingKey};

/// Capacity of the pending datagram arena.
pub const MAX_PENDING_DATAGRAMS: usize = 16;

/// Receive buffer for datagrams; anything past [`MAX_MESSAGE_LEN`] is
/// rejected as malformed, so this only needs to be large enough to tell.
pub(crate) const DATAGRAM_BUFFER: usize = 512;

/// What happens to a datagram once its retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramClass {
    /// Ring lookup traffic; falls back to the successor link.
    Lookup,
    /// Bootstrap traffic (`EFND`/`EPRED`); dropped.
    Entry,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatagramError {
    #[error("a datagram to {0} is still awaiting its ACK")]
    Outstanding(SocketAddr),
    #[error("all 16 pending datagram slots are in use")]
    Full,
}

#[derive(Debug, Clone)]
struct PendingDatagram {
    addr: SocketAddr,
    message: Message,
    class: DatagramClass,
    retries_left: u8,
    sent_at: Instant,
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Free,
    Occupied(PendingDatagram),
}

/// Action the dispatcher must carry out for an aged datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    Resend { addr: SocketAddr, message: Message },
    FallBack { message: Message },
    Expired { addr: SocketAddr, message: Message },
}

/// Fixed arena of datagrams awaiting an ACK, at most one per destination.
#[derive(Debug)]
pub struct PendingDatagrams {
    slots: Vec<Slot>,
    timeout: Duration,
    retries: u8,
}

impl PendingDatagrams {
    pub fn new(timeout: Duration, retries: u8) -> Self {
        Self {
            slots: vec![Slot::Free; MAX_PENDING_DATAGRAMS],
            timeout,
            retries,
        }
    }

    pub fn is_outstanding(&self, addr: SocketAddr) -> bool {
        self.position(addr).is_some()
    }

    /// Starts tracking a datagram just sent to `addr`.
    pub fn track(
        &mut self,
        addr: SocketAddr,
        message: Message,
        class: DatagramClass,
        now: Instant,
    ) -> Result<(), DatagramError> {
        if self.is_outstanding(addr) {
            return Err(DatagramError::Outstanding(addr));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| matches!(slot, Slot::Free))
            .ok_or(DatagramError::Full)?;
        *slot = Slot::Occupied(PendingDatagram {
            addr,
            message,
            class,
            retries_left: self.retries,
            sent_at: now,
        });
        Ok(())
    }

    /// Pops the datagram awaiting an ACK from `addr`.
    pub fn acknowledge(&mut self, addr: SocketAddr) -> Option<Message> {
        let index = self.position(addr)?;
        match std::mem::take(&mut self.slots[index]) {
            Slot::Occupied(pending) => Some(pending.message),
            Slot::Free => None,
        }
    }

    /// Ages every tracked datagram against `now`.
    ///
    /// Each aged datagram is either resent (consuming one retry and
    /// restarting its clock) or removed. Removal yields `FallBack` for
    /// lookups and `Expired` for bootstrap traffic.
    pub fn sweep(&mut self, now: Instant) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        for slot in &mut self.slots {
            let Slot::Occupied(pending) = slot else {
                continue;
            };
            if now.saturating_duration_since(pending.sent_at) < self.timeout {
                continue;
            }
            if pending.retries_left > 0 {
                pending.retries_left -= 1;
                pending.sent_at = now;
                actions.push(SweepAction::Resend {
                    addr: pending.addr,
                    message: pending.message.clone(),
                });
                continue;
            }
            if let Slot::Occupied(pending) = std::mem::take(slot) {
                actions.push(match pending.class {
                    DatagramClass::Lookup => SweepAction::FallBack {
                        message: pending.message,
                    },
                    DatagramClass::Entry => SweepAction::Expired {
                        addr: pending.addr,
                        message: pending.message,
                    },
                });
            }
        }
        actions
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.fill(Slot::Free);
    }

    fn position(&self, addr: SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Occupied(pending) if pending.addr == addr))
    }
}

impl Node {
    /// Sends `message` one hop closer to the owner of `key`.
    pub(crate) async fn send_to_closest(&mut self, message: Message, key: RingKey) {
        if let Some(shortcut) = self.shortcut {
            let addr = shortcut.socket_addr();
            let closer = distance(shortcut.key, key) < distance(self.successor_key(), key);
            if closer && !self.datagrams.is_outstanding(addr) {
                let tracked = self.datagrams.track(
                    addr,
                    message.clone(),
                    DatagramClass::Lookup,
                    Instant::now(),
                );
                match tracked {
                    Ok(()) => {
                        debug!(%addr, %key, tag = %message.tag(), "routing via shortcut");
                        self.send_datagram(addr, &message).await;
                        return;
                    }
                    Err(err) => debug!(%err, "shortcut unavailable, using successor"),
                }
            }
        }
        self.send_to_successor(&message).await;
    }

    pub(crate) async fn send_to_successor(&mut self, message: &Message) {
        let Some(link) = self.successor.as_mut() else {
            warn!(tag = %message.tag(), "no successor, dropping message");
            return;
        };
        if let Err(err) = link.send(message).await {
            warn!(%err, tag = %message.tag(), "send to successor failed");
            self.close_link(LinkRole::Successor, "send failed");
        }
    }

    /// Sends a datagram and tracks it until ACKed. Bootstrap traffic that
    /// cannot be tracked is dropped.
    pub(crate) async fn send_tracked(
        &mut self,
        addr: SocketAddr,
        message: Message,
        class: DatagramClass,
    ) {
        match self.datagrams.track(addr, message.clone(), class, Instant::now()) {
            Ok(()) => self.send_datagram(addr, &message).await,
            Err(err) => warn!(%addr, %err, tag = %message.tag(), "dropping datagram"),
        }
    }

    pub(crate) async fn send_datagram(&self, addr: SocketAddr, message: &Message) {
        let Some(udp) = self.udp.as_ref() else {
            warn!(%addr, "UDP socket closed, dropping datagram");
            return;
        };
        if let Err(err) = udp.send_to(message.encode().as_bytes(), addr).await {
            warn!(%addr, %err, "datagram send failed");
        }
    }

    /// Carries out retries and fallbacks for aged datagrams.
    pub(crate) async fn run_sweep(&mut self, now: Instant) {
        for action in self.datagrams.sweep(now) {
            match action {
                SweepAction::Resend { addr, message } => {
                    debug!(%addr, tag = %message.tag(), "resending unacknowledged datagram");
                    self.send_datagram(addr, &message).await;
                }
                SweepAction::FallBack { message } => {
                    info!(tag = %message.tag(), "shortcut silent, falling back to successor");
                    self.send_to_successor(&message).await;
                }
                SweepAction::Expired { addr, message } => {
                    warn!(%addr, tag = %message.tag(), "bootstrap datagram never acknowledged");
                    if self.bootstrap == Some(addr) {
                        self.fail_bootstrap("bootstrap node did not answer");
                    }
                }
            }
        }
    }

    pub(crate) async fn on_datagram(&mut self, received: io::Result<(Vec<u8>, SocketAddr)>) {
        let (bytes, from) = match received {
            Ok(received) => received,
            Err(err) => {
                warn!(%err, "UDP receive failed");
                return;
            }
        };

        let parsed = if bytes.len() > MAX_MESSAGE_LEN {
            None
        } else {
            std::str::from_utf8(&bytes).ok().map(Message::parse)
        };

        if let Some(Ok(Message::Ack)) = parsed {
            match self.datagrams.acknowledge(from) {
                Some(message) => debug!(%from, tag = %message.tag(), "datagram acknowledged"),
                None => warn!(%from, "unmatched ACK"),
            }
            return;
        }

        self.send_datagram(from, &Message::Ack).await;

        let message = match parsed {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(%from, %err, "discarding malformed datagram");
                return;
            }
            None => {
                warn!(%from, len = bytes.len(), "discarding oversized or non-ASCII datagram");
                return;
            }
        };
        debug!(%from, %message, "datagram received");

        match message {
            Message::EntryFind { key } => self.on_entry_find(key, from).await,
            Message::EntryPred { owner } => self.on_entry_pred(owner).await,
            message if is_routed(&message) => self.on_routed(message).await,
            message => warn!(%from, tag = %message.tag(), "unexpected datagram"),
        }
    }
}

pub(crate) async fn recv_datagram(udp: Option<&UdpSocket>) -> io::Result<(Vec<u8>, SocketAddr)> {
    match udp {
        Some(udp) => {
            let mut buf = [0u8; DATAGRAM_BUFFER];
            let (len, from) = udp.recv_from(&mut buf).await?;
            Ok((buf[..len].to_vec(), from))
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::ring::Seq;

    const TIMEOUT: Duration = Duration::from_millis(5);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn find(key: u8) -> Message {
        Message::Find {
            key: RingKey::new(key).expect("valid key"),
            seq: Seq::ZERO,
            origin: crate::ring::Peer::new(
                RingKey::new(1).expect("valid key"),
                Ipv4Addr::LOCALHOST,
                7001,
            ),
        }
    }

    #[test]
    fn retries_three_times_then_falls_back() {
        let mut pending = PendingDatagrams::new(TIMEOUT, 3);
        let start = Instant::now();
        pending
            .track(addr(9000), find(12), DatagramClass::Lookup, start)
            .expect("free slot");

        assert!(pending.sweep(start).is_empty(), "not aged yet");

        let mut now = start;
        for _ in 0..3 {
            now += TIMEOUT;
            assert_eq!(
                pending.sweep(now),
                vec![SweepAction::Resend {
                    addr: addr(9000),
                    message: find(12)
                }]
            );
        }

        now += TIMEOUT;
        assert_eq!(pending.sweep(now), vec![SweepAction::FallBack { message: find(12) }]);
        assert!(pending.is_empty());
    }

    #[test]
    fn entry_datagrams_expire_instead_of_falling_back() {
        let mut pending = PendingDatagrams::new(TIMEOUT, 0);
        let start = Instant::now();
        let message = Message::EntryFind {
            key: RingKey::new(3).expect("valid key"),
        };
        pending
            .track(addr(9001), message.clone(), DatagramClass::Entry, start)
            .expect("free slot");
        assert_eq!(
            pending.sweep(start + TIMEOUT),
            vec![SweepAction::Expired {
                addr: addr(9001),
                message
            }]
        );
    }

    #[test]
    fn ack_pops_by_sender_address() {
        let mut pending = PendingDatagrams::new(TIMEOUT, 3);
        let now = Instant::now();
        pending
            .track(addr(9000), find(4), DatagramClass::Lookup, now)
            .expect("free slot");

        assert!(pending.acknowledge(addr(9999)).is_none());
        assert_eq!(pending.acknowledge(addr(9000)), Some(find(4)));
        assert!(pending.sweep(now + TIMEOUT * 10).is_empty());
    }

    #[test]
    fn one_outstanding_datagram_per_destination() {
        let mut pending = PendingDatagrams::new(TIMEOUT, 3);
        let now = Instant::now();
        pending
            .track(addr(9000), find(4), DatagramClass::Lookup, now)
            .expect("free slot");
        assert_eq!(
            pending.track(addr(9000), find(5), DatagramClass::Lookup, now),
            Err(DatagramError::Outstanding(addr(9000)))
        );
    }

    #[test]
    fn arena_is_bounded() {
        let mut pending = PendingDatagrams::new(TIMEOUT, 3);
        let now = Instant::now();
        for port in 0..MAX_PENDING_DATAGRAMS as u16 {
            pending
                .track(addr(9100 + port), find(1), DatagramClass::Lookup, now)
                .expect("free slot");
        }
        assert_eq!(
            pending.track(addr(9500), find(1), DatagramClass::Lookup, now),
            Err(DatagramError::Full)
        );
        assert_eq!(pending.len(), MAX_PENDING_DATAGRAMS);
    }
}
