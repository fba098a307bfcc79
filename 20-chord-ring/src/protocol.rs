//! Console command parsing.
//!
//! One command per line, case-insensitive. Node arguments are given as
//! `key ip port`, the same triple the wire protocol uses.

use anyhow::{anyhow, Context, Result};

use crate::ring::{parse_ip, parse_port, Peer, RingKey};
use crate::store::Value;

pub const USAGE: &str = "commands: new, pentry <key> <ip> <port>, bentry <key> <ip> <port>, \
find <key>, get <key>, set <key> [value], chord <key> <ip> <port>, echord, show, leave, exit, help";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    New,
    PEntry(Peer),
    BEntry(Peer),
    Find(RingKey),
    Get(RingKey),
    Set { key: RingKey, value: Option<Value> },
    Chord(Peer),
    EChord,
    Show,
    Leave,
    Exit,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim_start()),
            None => (trimmed, ""),
        };
        if word.is_empty() {
            return Err(anyhow!("empty command"));
        }
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match (word.to_lowercase().as_str(), args.as_slice()) {
            ("new", []) => ConsoleCommand::New,
            ("pentry", [key, ip, port]) => ConsoleCommand::PEntry(parse_peer(key, ip, port)?),
            ("bentry", [key, ip, port]) => ConsoleCommand::BEntry(parse_peer(key, ip, port)?),
            ("chord", [key, ip, port]) => ConsoleCommand::Chord(parse_peer(key, ip, port)?),
            ("find", [key]) => ConsoleCommand::Find(parse_key(key)?),
            ("get", [key]) => ConsoleCommand::Get(parse_key(key)?),
            ("set", [key, ..]) => {
                let raw = rest[key.len()..].trim();
                let value = if raw.is_empty() {
                    None
                } else {
                    Some(Value::new(raw).context("invalid value")?)
                };
                ConsoleCommand::Set {
                    key: parse_key(key)?,
                    value,
                }
            }
            ("echord", []) => ConsoleCommand::EChord,
            ("show", []) => ConsoleCommand::Show,
            ("leave", []) => ConsoleCommand::Leave,
            ("exit", []) => ConsoleCommand::Exit,
            ("help", []) => ConsoleCommand::Help,
            ("pentry" | "bentry" | "chord", _) => {
                return Err(anyhow!("{word} requires <key> <ip> <port>"))
            }
            ("find" | "get", _) => return Err(anyhow!("{word} requires exactly one <key>")),
            ("set", _) => return Err(anyhow!("set requires <key> [value]")),
            ("new" | "echord" | "show" | "leave" | "exit" | "help", _) => {
                return Err(anyhow!("{word} takes no arguments"))
            }
            _ => return Err(anyhow!("unknown command '{word}'")),
        };
        Ok(command)
    }
}

fn parse_key(raw: &str) -> Result<RingKey> {
    raw.parse().with_context(|| format!("invalid key '{raw}'"))
}

fn parse_peer(key: &str, ip: &str, port: &str) -> Result<Peer> {
    Ok(Peer::new(
        parse_key(key)?,
        parse_ip(ip).context("invalid ip")?,
        parse_port(port).context("invalid port")?,
    ))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn key(value: u8) -> RingKey {
        RingKey::new(value).expect("valid key")
    }

    #[test]
    fn case_insensitive_commands() {
        assert_eq!(ConsoleCommand::parse("new").ok(), Some(ConsoleCommand::New));
        assert_eq!(ConsoleCommand::parse("NEW").ok(), Some(ConsoleCommand::New));
        assert_eq!(ConsoleCommand::parse("ShOw").ok(), Some(ConsoleCommand::Show));
        assert_eq!(ConsoleCommand::parse("  exit  ").ok(), Some(ConsoleCommand::Exit));
        assert_eq!(ConsoleCommand::parse("EChord").ok(), Some(ConsoleCommand::EChord));
    }

    #[test]
    fn node_arguments() {
        let expected = Peer::new(key(5), Ipv4Addr::LOCALHOST, 4000);
        assert_eq!(
            ConsoleCommand::parse("pentry 5 127.0.0.1 4000").ok(),
            Some(ConsoleCommand::PEntry(expected))
        );
        assert_eq!(
            ConsoleCommand::parse("BENTRY 5 127.0.0.1 4000").ok(),
            Some(ConsoleCommand::BEntry(expected))
        );
        assert_eq!(
            ConsoleCommand::parse("chord 5 127.0.0.1 4000").ok(),
            Some(ConsoleCommand::Chord(expected))
        );
    }

    #[test]
    fn set_value_is_optional_and_may_contain_spaces() {
        assert_eq!(
            ConsoleCommand::parse("set 7 hello world").ok(),
            Some(ConsoleCommand::Set {
                key: key(7),
                value: Some(Value::new("hello world").expect("valid value")),
            })
        );
        assert_eq!(
            ConsoleCommand::parse("set 7").ok(),
            Some(ConsoleCommand::Set {
                key: key(7),
                value: None
            })
        );
    }

    #[test]
    fn invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("jump").is_err());
        assert!(ConsoleCommand::parse("find").is_err());
        assert!(ConsoleCommand::parse("find 32").is_err());
        assert!(ConsoleCommand::parse("get 1 2").is_err());
        assert!(ConsoleCommand::parse("pentry 5 127.0.0.1").is_err());
        assert!(ConsoleCommand::parse("pentry 5 localhost 4000").is_err());
        assert!(ConsoleCommand::parse("chord 5 127.0.0.1 70000").is_err());
        assert!(ConsoleCommand::parse("set 1 this-value-is-too-long").is_err());
        assert!(ConsoleCommand::parse("show now").is_err());
    }
}
