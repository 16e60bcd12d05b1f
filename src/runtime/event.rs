//! Events produced by an `EventSource`.
//!
//! An event is created once per accepted connection, received datagram or
//! timer tick and handed, by value, to exactly one handler.

use crate::sync::AliveFlag;
use bytes::Bytes;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Server-wide facts every event carries a reference to.
#[derive(Debug)]
pub struct ServerContext {
    /// Human-readable server name used in log lines.
    pub name: String,
    /// Address the source is bound to (`None` for timer sources).
    pub local_addr: Option<SocketAddr>,
    /// Shared shutdown flag.
    pub alive: AliveFlag,
    /// Per-read timeout applied to accepted connections.
    pub conn_timeout: Duration,
}

/// What happened.
#[derive(Debug)]
pub enum EventKind {
    /// A stream connection was accepted.
    Connection {
        stream: TcpStream,
        remote: SocketAddr,
    },
    /// A datagram was received. `reply` is a handle on the receiving socket.
    Datagram {
        payload: Bytes,
        remote: SocketAddr,
        reply: UdpSocket,
    },
    /// A timer interval elapsed.
    Timer { tick: u64, at: Instant },
}

/// One occurrence needing handling.
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    pub server: Arc<ServerContext>,
}

impl Event {
    pub fn new(kind: EventKind, server: Arc<ServerContext>) -> Self {
        Self { kind, server }
    }

    /// Remote peer, for connection and datagram events.
    pub fn remote(&self) -> Option<SocketAddr> {
        match &self.kind {
            EventKind::Connection { remote, .. } | EventKind::Datagram { remote, .. } => {
                Some(*remote)
            }
            EventKind::Timer { .. } => None,
        }
    }
}
