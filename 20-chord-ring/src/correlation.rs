//! Matching asynchronous replies back to the request that caused them.
//!
//! Every FND/GET this node originates is registered under its sequence
//! number. The table has exactly one slot per sequence number, so at most
//! [`SEQ_SPACE`] lookups can be in flight; past that, new requests are
//! refused rather than queued.

use std::net::SocketAddr;

use thiserror::Error;

use crate::ring::{RingKey, Seq, SEQ_SPACE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("request slot {0} is already in use")]
    SlotOccupied(Seq),
}

/// Bookkeeping for one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub key: RingKey,
    /// Set when the request was made on behalf of a node outside the ring
    /// (an `EFND`); the answer goes back to this UDP address.
    pub reply_to: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Free,
    Occupied(PendingRequest),
}

#[derive(Debug)]
pub struct RequestTable {
    slots: Vec<Slot>,
    next_seq: Seq,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::Free; usize::from(SEQ_SPACE)],
            next_seq: Seq::ZERO,
        }
    }

    /// Claims `seq`. Fails without touching the table if it is taken.
    pub fn register(
        &mut self,
        seq: Seq,
        key: RingKey,
        reply_to: Option<SocketAddr>,
    ) -> Result<(), CorrelationError> {
        let slot = &mut self.slots[seq.index()];
        if let Slot::Occupied(_) = slot {
            return Err(CorrelationError::SlotOccupied(seq));
        }
        *slot = Slot::Occupied(PendingRequest { key, reply_to });
        Ok(())
    }

    /// Registers under the next sequence number from the rolling counter.
    ///
    /// The counter advances even on failure so one stuck slot does not block
    /// every later request.
    pub fn register_next(
        &mut self,
        key: RingKey,
        reply_to: Option<SocketAddr>,
    ) -> Result<Seq, CorrelationError> {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        self.register(seq, key, reply_to)?;
        Ok(seq)
    }

    /// Hands out a sequence number for fire-and-forget messages (SET).
    pub fn unregistered_seq(&mut self) -> Seq {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        seq
    }

    /// Frees `seq`, returning what was registered there.
    pub fn drop_request(&mut self, seq: Seq) -> Option<PendingRequest> {
        match std::mem::take(&mut self.slots[seq.index()]) {
            Slot::Occupied(request) => Some(request),
            Slot::Free => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count()
    }

    pub fn clear(&mut self) {
        self.slots.fill(Slot::Free);
    }
}
