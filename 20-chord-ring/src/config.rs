use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::ring::Peer;

/// Dispatcher wake-up interval; the UDP retry sweep runs at least this often.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

/// Age after which an unacknowledged datagram is resent.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_millis(5);

/// Resends before a shortcut datagram falls back to the successor link.
pub const DEFAULT_UDP_RETRIES: u8 = 3;

/// Upper bound on establishing an outbound ring link.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Numeric knobs of the dispatcher and the routing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeTuning {
    pub tick: Duration,
    pub udp_timeout: Duration,
    pub udp_retries: u8,
    pub connect_timeout: Duration,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            udp_retries: DEFAULT_UDP_RETRIES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Everything needed to spawn a node.
///
/// `identity` is what the node announces to its neighbours; `bind` is the
/// local interface its TCP listener and UDP socket bind to, on the identity
/// port.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub identity: Peer,
    pub bind: Ipv4Addr,
    pub tuning: RuntimeTuning,
}

impl NodeConfig {
    pub fn new(identity: Peer) -> Self {
        Self {
            identity,
            bind: Ipv4Addr::UNSPECIFIED,
            tuning: RuntimeTuning::default(),
        }
    }

    pub fn with_bind(mut self, bind: Ipv4Addr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_tuning(mut self, tuning: RuntimeTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind, self.identity.port())
    }
}
