use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

use crate::config::{NodeConfig, RuntimeTuning};
use crate::ring::{Peer, RingKey};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chord-style ring DHT node", long_about = None)]
pub struct Cli {
    /// Position of this node on the 32-key ring.
    pub key: RingKey,

    /// Address other nodes use to reach this node.
    pub ip: Ipv4Addr,

    /// TCP and UDP port of this node.
    pub port: u16,

    /// Local interface to bind the sockets to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: Ipv4Addr,

    /// Dispatcher tick in milliseconds.
    #[arg(long, default_value_t = 1)]
    pub tick_ms: u64,

    /// Age in milliseconds after which an unacknowledged datagram is resent.
    #[arg(long, default_value_t = 5)]
    pub udp_timeout_ms: u64,

    /// Resends before a shortcut datagram falls back to the successor.
    #[arg(long, default_value_t = 3)]
    pub udp_retries: u8,

    /// Time limit in milliseconds for opening a ring link.
    #[arg(long, default_value_t = 1000)]
    pub connect_timeout_ms: u64,
}

impl Cli {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::new(Peer::new(self.key, self.ip, self.port))
            .with_bind(self.bind)
            .with_tuning(RuntimeTuning {
                tick: Duration::from_millis(self.tick_ms),
                udp_timeout: Duration::from_millis(self.udp_timeout_ms),
                udp_retries: self.udp_retries,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity_and_defaults() {
        let cli = Cli::try_parse_from(["chord-ring", "12", "127.0.0.1", "4012"]).expect("valid args");
        let config = cli.node_config();
        assert_eq!(config.identity.key.get(), 12);
        assert_eq!(config.identity.port(), 4012);
        assert_eq!(config.bind, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.tuning, RuntimeTuning::default());
    }

    #[test]
    fn rejects_keys_outside_the_ring() {
        assert!(Cli::try_parse_from(["chord-ring", "32", "127.0.0.1", "4012"]).is_err());
    }
}
