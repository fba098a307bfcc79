//! A TCP connection to a ring neighbour together with its reassembly buffer.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::buffer::{ConnectionBuffer, FrameError, Received};
use crate::message::{Message, MAX_MESSAGE_LEN};
use crate::ring::Peer;

/// Which role a link plays for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Successor,
    Predecessor,
    Temp,
}

impl LinkRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkRole::Successor => "successor",
            LinkRole::Predecessor => "predecessor",
            LinkRole::Temp => "temp",
        }
    }
}

#[derive(Debug)]
pub struct Link {
    /// Identity announced by the remote end; unknown for a fresh temp link.
    pub peer: Option<Peer>,
    remote: SocketAddr,
    stream: TcpStream,
    buffer: ConnectionBuffer,
}

impl Link {
    pub fn accepted(stream: TcpStream, remote: SocketAddr) -> Self {
        Self {
            peer: None,
            remote,
            stream,
            buffer: ConnectionBuffer::new(),
        }
    }

    pub async fn connect(peer: Peer, limit: Duration) -> io::Result<Self> {
        let stream = timeout(limit, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Ok(Self {
            peer: Some(peer),
            remote: peer.socket_addr(),
            stream,
            buffer: ConnectionBuffer::new(),
        })
    }

    pub fn from_stream(peer: Peer, stream: TcpStream) -> Self {
        Self {
            peer: Some(peer),
            remote: peer.socket_addr(),
            stream,
            buffer: ConnectionBuffer::new(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Reads at most one message worth of bytes.
    ///
    /// Cancel safe: when dropped before completion no bytes were consumed.
    pub async fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        let mut chunk = [0u8; MAX_MESSAGE_LEN];
        let read = self.stream.read(&mut chunk).await?;
        Ok(chunk[..read].to_vec())
    }

    /// Feeds the outcome of [`read_chunk`](Self::read_chunk) into the buffer.
    pub fn absorb(&mut self, read: io::Result<Vec<u8>>) -> Result<Received, FrameError> {
        match read {
            Ok(bytes) => self.buffer.receive(Ok(bytes.as_slice())),
            Err(err) => self.buffer.receive(Err(err)),
        }
    }

    pub fn has_backlog(&self) -> bool {
        self.buffer.has_backlog()
    }

    /// Next line already sitting in the buffer, without touching the socket.
    pub fn next_buffered(&mut self) -> Result<Option<String>, FrameError> {
        self.buffer.next_line()
    }

    pub async fn send(&mut self, message: &Message) -> io::Result<()> {
        self.stream.write_all(message.encode().as_bytes()).await?;
        self.stream.flush().await
    }

    /// Pulls whatever the socket can deliver right now and returns every
    /// complete line, so a link can be retired without losing traffic that
    /// already arrived.
    pub fn drain_ready(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut chunk = [0u8; MAX_MESSAGE_LEN];
        loop {
            while let Ok(Some(line)) = self.buffer.next_line() {
                lines.push(line);
            }
            match self.stream.try_read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => match self.buffer.receive(Ok(&chunk[..read])) {
                    Ok(Received::Complete(line)) => lines.push(line),
                    Ok(_) => {}
                    Err(_) => break,
                },
            }
        }
        lines
    }
}
