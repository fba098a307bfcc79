//! Line-oriented text protocol spoken between ring members.
//!
//! Every message is ASCII, space separated and terminated by `\n`, with a hard
//! limit of [`MAX_MESSAGE_LEN`] bytes including the terminator. The same
//! encoding is used over TCP links and in UDP datagrams.

use std::fmt;

use thiserror::Error;

use crate::ring::{parse_ip, parse_port, Peer, RingKey, Seq};
use crate::store::Value;

/// Largest message accepted on either transport, delimiter included.
pub const MAX_MESSAGE_LEN: usize = 64;

/// Message delimiter.
pub const DELIMITER: u8 = b'\n';

/// Wire tag of a message, i.e. its first token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    SelfNode,
    Pred,
    Find,
    Response,
    Get,
    GetReply,
    Set,
    EntryFind,
    EntryPred,
    Ack,
}

impl MessageTag {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageTag::SelfNode => "SELF",
            MessageTag::Pred => "PRED",
            MessageTag::Find => "FND",
            MessageTag::Response => "RSP",
            MessageTag::Get => "GET",
            MessageTag::GetReply => "RGET",
            MessageTag::Set => "SET",
            MessageTag::EntryFind => "EFND",
            MessageTag::EntryPred => "EPRED",
            MessageTag::Ack => "ACK",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        let tag = match token {
            "SELF" => MessageTag::SelfNode,
            "PRED" => MessageTag::Pred,
            "FND" => MessageTag::Find,
            "RSP" => MessageTag::Response,
            "GET" => MessageTag::Get,
            "RGET" => MessageTag::GetReply,
            "SET" => MessageTag::Set,
            "EFND" => MessageTag::EntryFind,
            "EPRED" => MessageTag::EntryPred,
            "ACK" => MessageTag::Ack,
            _ => return None,
        };
        Some(tag)
    }

    /// SELF and PRED establish links; a bad one poisons the connection.
    pub fn is_handshake(self) -> bool {
        matches!(self, MessageTag::SelfNode | MessageTag::Pred)
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single field failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("'{0}' is not an unsigned integer")]
    NotANumber(String),
    #[error("ring key {0} is outside [0, 32)")]
    KeyOutOfRange(u64),
    #[error("sequence number {0} is outside [0, 100)")]
    SeqOutOfRange(u64),
    #[error("port {0} is outside [0, 65535]")]
    PortOutOfRange(u64),
    #[error("'{0}' is not a dotted-quad IPv4 address")]
    BadIp(String),
    #[error("value is {0} bytes, the limit is 16")]
    ValueTooLong(usize),
    #[error("value contains non-printable characters")]
    ValueNotPrintable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("empty message")]
    Empty,
    #[error("message is {0} bytes, the limit is 64")]
    Oversized(usize),
    #[error("message is not ASCII")]
    NotAscii,
    #[error("unknown message type '{0}'")]
    UnknownTag(String),
    #[error("{tag} is missing field '{field}'")]
    MissingField {
        tag: MessageTag,
        field: &'static str,
    },
    #[error("{0} carries unexpected trailing data")]
    TrailingData(MessageTag),
    #[error("{tag} field '{field}': {reason}")]
    InvalidField {
        tag: MessageTag,
        field: &'static str,
        reason: FieldError,
    },
}

impl CodecError {
    pub fn tag(&self) -> Option<MessageTag> {
        match self {
            CodecError::MissingField { tag, .. }
            | CodecError::InvalidField { tag, .. }
            | CodecError::TrailingData(tag) => Some(*tag),
            _ => None,
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.tag().is_some_and(MessageTag::is_handshake)
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `SELF id ip port`: the sender becomes the receiver's successor.
    SelfNode(Peer),
    /// `PRED id ip port`: the receiver must adopt this node as predecessor.
    Pred(Peer),
    /// `FND key seq origin_id origin_ip origin_port`
    Find { key: RingKey, seq: Seq, origin: Peer },
    /// `RSP origin_id seq owner_id owner_ip owner_port`
    Response {
        origin: RingKey,
        seq: Seq,
        owner: Peer,
    },
    /// `GET key seq origin_id origin_ip origin_port`
    Get { key: RingKey, seq: Seq, origin: Peer },
    /// `RGET origin_id seq key [value]`
    GetReply {
        origin: RingKey,
        seq: Seq,
        key: RingKey,
        value: Option<Value>,
    },
    /// `SET key seq origin_id [value]`; no value deletes the mapping.
    Set {
        key: RingKey,
        seq: Seq,
        origin: RingKey,
        value: Option<Value>,
    },
    /// `EFND key`: bootstrap request from a node outside the ring.
    EntryFind { key: RingKey },
    /// `EPRED owner_id owner_ip owner_port`: bootstrap answer.
    EntryPred { owner: Peer },
    Ack,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::SelfNode(_) => MessageTag::SelfNode,
            Message::Pred(_) => MessageTag::Pred,
            Message::Find { .. } => MessageTag::Find,
            Message::Response { .. } => MessageTag::Response,
            Message::Get { .. } => MessageTag::Get,
            Message::GetReply { .. } => MessageTag::GetReply,
            Message::Set { .. } => MessageTag::Set,
            Message::EntryFind { .. } => MessageTag::EntryFind,
            Message::EntryPred { .. } => MessageTag::EntryPred,
            Message::Ack => MessageTag::Ack,
        }
    }

    /// Encodes the message including its trailing delimiter.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }

    /// Decodes one message. A single trailing `\n` (or `\r\n`) is accepted.
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        if line.len() > MAX_MESSAGE_LEN {
            return Err(CodecError::Oversized(line.len()));
        }
        if !line.is_ascii() {
            return Err(CodecError::NotAscii);
        }
        let body = line
            .strip_suffix('\n')
            .map(|rest| rest.strip_suffix('\r').unwrap_or(rest))
            .unwrap_or(line);

        let mut fields = Fields::new(body);
        let token = fields.token().ok_or(CodecError::Empty)?;
        let tag =
            MessageTag::from_token(token).ok_or_else(|| CodecError::UnknownTag(token.into()))?;
        let mut fields = TaggedFields { tag, fields };

        let message = match tag {
            MessageTag::SelfNode => Message::SelfNode(fields.peer("id", "ip", "port")?),
            MessageTag::Pred => Message::Pred(fields.peer("id", "ip", "port")?),
            MessageTag::Find => Message::Find {
                key: fields.parse("key")?,
                seq: fields.parse("seq")?,
                origin: fields.peer("origin_id", "origin_ip", "origin_port")?,
            },
            MessageTag::Response => Message::Response {
                origin: fields.parse("origin_id")?,
                seq: fields.parse("seq")?,
                owner: fields.peer("owner_id", "owner_ip", "owner_port")?,
            },
            MessageTag::Get => Message::Get {
                key: fields.parse("key")?,
                seq: fields.parse("seq")?,
                origin: fields.peer("origin_id", "origin_ip", "origin_port")?,
            },
            MessageTag::GetReply => Message::GetReply {
                origin: fields.parse("origin_id")?,
                seq: fields.parse("seq")?,
                key: fields.parse("key")?,
                value: fields.value()?,
            },
            MessageTag::Set => Message::Set {
                key: fields.parse("key")?,
                seq: fields.parse("seq")?,
                origin: fields.parse("origin_id")?,
                value: fields.value()?,
            },
            MessageTag::EntryFind => Message::EntryFind {
                key: fields.parse("key")?,
            },
            MessageTag::EntryPred => Message::EntryPred {
                owner: fields.peer("owner_id", "owner_ip", "owner_port")?,
            },
            MessageTag::Ack => Message::Ack,
        };
        fields.finish()?;
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        match self {
            Message::SelfNode(peer) | Message::Pred(peer) => {
                write!(f, "{tag} {} {} {}", peer.key, peer.ip(), peer.port())
            }
            Message::Find { key, seq, origin } | Message::Get { key, seq, origin } => write!(
                f,
                "{tag} {key} {seq} {} {} {}",
                origin.key,
                origin.ip(),
                origin.port()
            ),
            Message::Response { origin, seq, owner } => write!(
                f,
                "{tag} {origin} {seq} {} {} {}",
                owner.key,
                owner.ip(),
                owner.port()
            ),
            Message::GetReply {
                origin,
                seq,
                key,
                value,
            } => {
                write!(f, "{tag} {origin} {seq} {key}")?;
                write_value(f, value.as_ref())
            }
            Message::Set {
                key,
                seq,
                origin,
                value,
            } => {
                write!(f, "{tag} {key} {seq} {origin}")?;
                write_value(f, value.as_ref())
            }
            Message::EntryFind { key } => write!(f, "{tag} {key}"),
            Message::EntryPred { owner } => {
                write!(f, "{tag} {} {} {}", owner.key, owner.ip(), owner.port())
            }
            Message::Ack => f.write_str(tag.as_str()),
        }
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: Option<&Value>) -> fmt::Result {
    match value {
        Some(value) => write!(f, " {value}"),
        None => Ok(()),
    }
}

/// Splits a message body into space separated tokens.
struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn new(body: &'a str) -> Self {
        Self { rest: body }
    }

    fn token(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start_matches(' ');
        if trimmed.is_empty() {
            self.rest = trimmed;
            return None;
        }
        let end = trimmed.find(' ').unwrap_or(trimmed.len());
        let (token, rest) = trimmed.split_at(end);
        self.rest = rest;
        Some(token)
    }

    /// Everything left on the line, minus the separating spaces.
    fn remainder(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_matches(' ');
        self.rest = "";
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// Field reader that attaches the message tag to every error.
struct TaggedFields<'a> {
    tag: MessageTag,
    fields: Fields<'a>,
}

impl<'a> TaggedFields<'a> {
    fn raw(&mut self, field: &'static str) -> Result<&'a str, CodecError> {
        self.fields.token().ok_or(CodecError::MissingField {
            tag: self.tag,
            field,
        })
    }

    fn invalid(&self, field: &'static str) -> impl FnOnce(FieldError) -> CodecError {
        let tag = self.tag;
        move |reason| CodecError::InvalidField { tag, field, reason }
    }

    fn parse<T>(&mut self, field: &'static str) -> Result<T, CodecError>
    where
        T: std::str::FromStr<Err = FieldError>,
    {
        let raw = self.raw(field)?;
        raw.parse().map_err(self.invalid(field))
    }

    fn peer(
        &mut self,
        key_field: &'static str,
        ip_field: &'static str,
        port_field: &'static str,
    ) -> Result<Peer, CodecError> {
        let key: RingKey = self.parse(key_field)?;
        let ip = parse_ip(self.raw(ip_field)?).map_err(self.invalid(ip_field))?;
        let port = parse_port(self.raw(port_field)?).map_err(self.invalid(port_field))?;
        Ok(Peer::new(key, ip, port))
    }

    fn value(&mut self) -> Result<Option<Value>, CodecError> {
        match self.fields.remainder() {
            Some(raw) => Value::new(raw).map(Some).map_err(self.invalid("value")),
            None => Ok(None),
        }
    }

    fn finish(mut self) -> Result<(), CodecError> {
        match self.fields.token() {
            Some(_) => Err(CodecError::TrailingData(self.tag)),
            None => Ok(()),
        }
    }
}
