//! Event sources.
//!
//! An `EventSource` owns one bound socket (or a timer) and yields events
//! until the alive flag clears. Socket calls block for at most the
//! configured I/O timeout; transient failures are swallowed and retried
//! after sleeping `1/backlog` seconds.

use crate::runtime::event::{Event, EventKind, ServerContext};
use crate::sync::AliveFlag;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Writes to an accepted connection block at most this long.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Accept TCP connections.
    Stream,
    /// Receive UDP datagrams.
    Datagram,
    /// Emit a tick every interval.
    Timer(Duration),
}

/// Parameters for binding a source.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub name: String,
    pub kind: SourceKind,
    /// Address to bind; `None` picks the first address `localhost` resolves to.
    pub address: Option<SocketAddr>,
    pub backlog: u32,
    /// Timeout for a single accept/receive call.
    pub timeout: Duration,
    /// Read timeout applied to accepted connections.
    pub conn_timeout: Duration,
    /// Largest datagram received in one event.
    pub buflen: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            name: "base".to_string(),
            kind: SourceKind::Stream,
            address: None,
            backlog: 128,
            timeout: Duration::from_millis(50),
            conn_timeout: Duration::from_millis(5),
            buflen: 512,
        }
    }
}

enum Endpoint {
    Listener(TcpListener),
    Datagram(UdpSocket),
    Timer { interval: Duration, ticks: u64 },
}

/// A blocking-with-timeout sequence of events.
pub struct EventSource {
    endpoint: Endpoint,
    context: Arc<ServerContext>,
    backoff: Duration,
    buflen: usize,
}

impl EventSource {
    /// Bind the source. Bind and listen failures are returned here; nothing
    /// after construction is fatal.
    pub fn bind(options: SourceOptions, alive: AliveFlag) -> io::Result<Self> {
        let backlog = options.backlog.max(1);

        let (endpoint, local_addr) = match options.kind {
            SourceKind::Timer(interval) => (Endpoint::Timer { interval, ticks: 0 }, None),
            kind => {
                let address = match options.address {
                    Some(address) => address,
                    None => default_address()?,
                };
                let socket = bind_socket(address, kind, backlog, options.timeout)?;
                let local_addr = socket.local_addr()?.as_socket();
                let endpoint = if kind == SourceKind::Stream {
                    Endpoint::Listener(socket.into())
                } else {
                    Endpoint::Datagram(socket.into())
                };
                (endpoint, local_addr)
            }
        };

        let context = Arc::new(ServerContext {
            name: options.name,
            local_addr,
            alive,
            conn_timeout: options.conn_timeout,
        });

        Ok(Self {
            endpoint,
            context,
            backoff: Duration::from_secs_f64(1.0 / f64::from(backlog)),
            buflen: options.buflen.max(1),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.context.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Shut the socket down so blocked peers see it close. The descriptor is
    /// released when the source is dropped.
    pub fn shutdown(&self) {
        let result = match &self.endpoint {
            Endpoint::Listener(listener) => SockRef::from(listener).shutdown(Shutdown::Both),
            Endpoint::Datagram(socket) => SockRef::from(socket).shutdown(Shutdown::Both),
            Endpoint::Timer { .. } => Ok(()),
        };
        // Listening sockets are never connected; ENOTCONN here is expected.
        if let Err(e) = result {
            trace!(error = %e, "Socket shutdown");
        }
        info!(name = %self.context.name, "Event source closed");
    }

    /// One accept/receive attempt. `Ok(None)` means the timer was interrupted
    /// by shutdown.
    fn poll(&mut self) -> io::Result<Option<EventKind>> {
        match &mut self.endpoint {
            Endpoint::Listener(listener) => {
                let (stream, remote) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(self.context.conn_timeout))?;
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                debug!(peer = %remote, "Accepted connection");
                Ok(Some(EventKind::Connection { stream, remote }))
            }
            Endpoint::Datagram(socket) => {
                let mut buf = vec![0u8; self.buflen];
                let (n, remote) = socket.recv_from(&mut buf)?;
                buf.truncate(n);
                let reply = socket.try_clone()?;
                trace!(peer = %remote, len = n, "Received datagram");
                Ok(Some(EventKind::Datagram {
                    payload: Bytes::from(buf),
                    remote,
                    reply,
                }))
            }
            Endpoint::Timer { interval, ticks } => {
                if self.context.alive.wait_killed(*interval) {
                    return Ok(None);
                }
                *ticks += 1;
                Ok(Some(EventKind::Timer {
                    tick: *ticks,
                    at: Instant::now(),
                }))
            }
        }
    }
}

impl Iterator for EventSource {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if !self.context.alive.is_alive() {
                return None;
            }

            match self.poll() {
                Ok(Some(kind)) => return Some(Event::new(kind, Arc::clone(&self.context))),
                Ok(None) => continue,
                Err(e) if is_transient(&e) => {}
                Err(e) => debug!(error = %e, "Event source error, retrying"),
            }
            thread::sleep(self.backoff);
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
    )
}

/// The first address `localhost` resolves to, with an OS-chosen port.
fn default_address() -> io::Result<SocketAddr> {
    ("localhost", 0)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no default address"))
}

/// Create a socket with address and port reuse and a receive timeout.
fn bind_socket(
    addr: SocketAddr,
    kind: SourceKind,
    backlog: u32,
    timeout: Duration,
) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let (ty, protocol) = match kind {
        SourceKind::Datagram => (Type::DGRAM, Protocol::UDP),
        _ => (Type::STREAM, Protocol::TCP),
    };

    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.bind(&addr.into())?;

    if kind == SourceKind::Stream {
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    }

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn loopback(kind: SourceKind) -> SourceOptions {
        SourceOptions {
            kind,
            address: Some("127.0.0.1:0".parse().unwrap()),
            timeout: Duration::from_millis(10),
            ..SourceOptions::default()
        }
    }

    #[test]
    fn test_accepts_connections() {
        let alive = AliveFlag::new();
        let mut source = EventSource::bind(loopback(SourceKind::Stream), alive).unwrap();
        let addr = source.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hi").unwrap();

        let event = source.next().unwrap();
        assert_eq!(event.server.local_addr, Some(addr));
        assert_eq!(event.remote(), Some(client.local_addr().unwrap()));

        let EventKind::Connection { mut stream, .. } = event.kind else {
            panic!("expected a connection event");
        };
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_receives_datagrams() {
        let alive = AliveFlag::new();
        let options = SourceOptions {
            buflen: 4,
            ..loopback(SourceKind::Datagram)
        };
        let mut source = EventSource::bind(options, alive).unwrap();
        let addr = source.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", addr).unwrap();

        let event = source.next().unwrap();
        let EventKind::Datagram { payload, remote, reply } = event.kind else {
            panic!("expected a datagram event");
        };
        assert_eq!(&payload[..], b"ping");
        assert_eq!(remote, client.local_addr().unwrap());

        reply.send_to(b"pong", remote).unwrap();
        let mut buf = [0u8; 4];
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn test_timer_ticks() {
        let alive = AliveFlag::new();
        let options = SourceOptions {
            kind: SourceKind::Timer(Duration::from_millis(5)),
            ..SourceOptions::default()
        };
        let source = EventSource::bind(options, alive).unwrap();
        assert!(source.local_addr().is_none());

        let ticks: Vec<u64> = source
            .take(3)
            .map(|event| match event.kind {
                EventKind::Timer { tick, .. } => tick,
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(ticks, vec![1, 2, 3]);
    }

    #[test]
    fn test_terminates_when_killed() {
        let alive = AliveFlag::new();
        let mut source = EventSource::bind(loopback(SourceKind::Stream), alive.clone()).unwrap();

        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            alive.kill();
        });

        assert!(source.next().is_none());
        killer.join().unwrap();
        source.shutdown();
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let options = SourceOptions {
            address: Some(taken.local_addr().unwrap()),
            ..loopback(SourceKind::Stream)
        };
        // The existing listener did not opt into port reuse.
        assert!(EventSource::bind(options, AliveFlag::new()).is_err());
    }
}
