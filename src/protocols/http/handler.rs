//! Per-connection state machine for the drop protocol.
//!
//! Each step does one bounded piece of work: one line of the request head,
//! one dispatch decision, one response head, or one body chunk. A read that
//! times out ends the step with `Continue` so the connection yields its slot
//! and is retried later.

use super::parser::{Headers, ParseError, Progress, RequestHead, RequestParser};
use super::resolver::Resolve;
use super::response::{ResponseHead, StatusCode};
use crate::runtime::{BoxError, Event, EventHandler, EventKind, HandlerFactory, Step};
use crate::storage::{chunk_size, Retrieval, StoreError, Upload};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Version used in responses sent before the request line was understood.
const DEFAULT_VERSION: f64 = 1.1;

/// Most unread input discarded before closing.
const LINGER_LIMIT: usize = 1 << 20;

/// Builds a `ConnectionHandler` for every accepted connection.
#[derive(Clone)]
pub struct DropHandlerFactory {
    resolver: Arc<dyn Resolve>,
    idle_timeout: Option<Duration>,
}

impl DropHandlerFactory {
    pub fn new(resolver: Arc<dyn Resolve>, idle_timeout: Option<Duration>) -> Self {
        Self {
            resolver,
            idle_timeout,
        }
    }
}

impl HandlerFactory for DropHandlerFactory {
    fn handler(&self, event: Event) -> Box<dyn EventHandler> {
        match event.kind {
            EventKind::Connection { stream, remote } => Box::new(ConnectionHandler::new(
                stream,
                remote,
                Arc::clone(&self.resolver),
                self.idle_timeout,
            )),
            other => {
                debug!(event = ?other, "Ignoring non-connection event");
                Box::new(Ignored)
            }
        }
    }
}

/// Finishes immediately.
struct Ignored;

impl EventHandler for Ignored {
    fn step(&mut self) -> Result<Step, BoxError> {
        Ok(Step::Done)
    }
}

enum Transfer {
    /// GET: stream the stored resource to the client.
    Send(Retrieval),
    /// POST: receive the body into storage.
    Receive(Upload),
}

enum State {
    AwaitRequestLine,
    AwaitHeaders,
    Dispatched(RequestHead),
    Responding {
        head: ResponseHead,
        then: Box<State>,
    },
    StreamingBody(Transfer),
    /// Half-close and discard unread input.
    Closing,
    Closed,
}

/// Outcome of feeding buffered input to the parser.
enum LineRead {
    Line(Progress),
    Timeout,
    Eof,
    Invalid(ParseError),
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Handles one connection: a single request, then close.
pub struct ConnectionHandler {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
    resolver: Arc<dyn Resolve>,
    idle_timeout: Option<Duration>,
    last_progress: Instant,
    parser: RequestParser,
    version: f64,
    state: State,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        resolver: Arc<dyn Resolve>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            reader: BufReader::new(stream),
            peer,
            resolver,
            idle_timeout,
            last_progress: Instant::now(),
            parser: RequestParser::new(),
            version: DEFAULT_VERSION,
            state: State::AwaitRequestLine,
        }
    }

    fn respond(&self, status: StatusCode, content_length: u64, then: State) -> State {
        State::Responding {
            head: ResponseHead::new(self.version, status, content_length),
            then: Box::new(then),
        }
    }

    /// Stay in `state` unless the connection has been idle too long.
    fn idle_or(&self, state: State) -> State {
        match self.idle_timeout {
            Some(limit) if self.last_progress.elapsed() >= limit => {
                debug!(peer = %self.peer, "Idle timeout, closing connection");
                State::Closed
            }
            _ => state,
        }
    }

    /// Feed buffered input to the parser until one line ends.
    fn read_line(&mut self) -> io::Result<LineRead> {
        loop {
            let available = match self.reader.fill_buf() {
                Ok([]) => return Ok(LineRead::Eof),
                Ok(buf) => buf,
                Err(e) if is_timeout(&e) => return Ok(LineRead::Timeout),
                Err(e) => return Err(e),
            };

            let mut used = 0;
            let mut outcome = Ok(Progress::Partial);
            for &byte in available {
                used += 1;
                outcome = self.parser.push(byte);
                if !matches!(outcome, Ok(Progress::Partial)) {
                    break;
                }
            }
            self.reader.consume(used);
            self.last_progress = Instant::now();

            match outcome {
                Ok(Progress::Partial) => continue,
                Ok(progress) => return Ok(LineRead::Line(progress)),
                Err(e) => return Ok(LineRead::Invalid(e)),
            }
        }
    }

    fn await_head(&mut self, state: State) -> State {
        match self.read_line() {
            Ok(LineRead::Line(Progress::Complete)) => {
                match std::mem::take(&mut self.parser).into_head() {
                    Some(head) => State::Dispatched(head),
                    None => State::Closed,
                }
            }
            Ok(LineRead::Line(_)) => {
                if let Some(version) = self.parser.version() {
                    self.version = version;
                }
                if self.parser.in_request_line() {
                    State::AwaitRequestLine
                } else {
                    State::AwaitHeaders
                }
            }
            Ok(LineRead::Timeout) => self.idle_or(state),
            Ok(LineRead::Eof) => {
                debug!(peer = %self.peer, "Peer closed before completing a request");
                State::Closed
            }
            Ok(LineRead::Invalid(e)) => {
                debug!(peer = %self.peer, error = %e, "Malformed request");
                self.respond(StatusCode::BadRequest, 0, State::Closing)
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Read failed");
                State::Closed
            }
        }
    }

    fn dispatch(&mut self, head: RequestHead) -> State {
        info!(
            method = %head.method,
            resource = %head.resource,
            peer = %self.peer,
            "Handling request"
        );
        match head.method.as_str() {
            "GET" => self.dispatch_get(&head),
            "POST" => self.dispatch_post(&head),
            _ => self.respond(StatusCode::NotImplemented, 0, State::Closing),
        }
    }

    fn dispatch_get(&mut self, head: &RequestHead) -> State {
        let path = self.resolver.resolve(&head.resource);
        match Retrieval::open(&path) {
            Ok(retrieval) => {
                let len = retrieval.len();
                self.respond(
                    StatusCode::Ok,
                    len,
                    State::StreamingBody(Transfer::Send(retrieval)),
                )
            }
            Err(StoreError::NotFound) => self.respond(StatusCode::NotFound, 0, State::Closing),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open resource");
                self.respond(StatusCode::InternalServerError, 0, State::Closing)
            }
        }
    }

    fn dispatch_post(&mut self, head: &RequestHead) -> State {
        let len = match content_length(&head.headers) {
            Ok(len) => len,
            Err(status) => return self.respond(status, 0, State::Closing),
        };

        let path = self.resolver.resolve(&head.resource);
        match Upload::create(&path, len) {
            Ok(upload) => State::StreamingBody(Transfer::Receive(upload)),
            Err(StoreError::Conflict) => self.respond(StatusCode::Conflict, 0, State::Closing),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot create resource");
                self.respond(StatusCode::InternalServerError, 0, State::Closing)
            }
        }
    }

    fn send_head(&mut self, head: ResponseHead, then: State) -> State {
        let mut stream = self.reader.get_ref();
        match stream.write_all(&head.to_bytes()) {
            Ok(()) => {
                self.last_progress = Instant::now();
                debug!(peer = %self.peer, status = head.status.as_u16(), "Sent response head");
                then
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Failed to send response head");
                // Nothing was read yet; leave the resource in place.
                if let State::StreamingBody(Transfer::Send(retrieval)) = then {
                    retrieval.cancel();
                }
                State::Closed
            }
        }
    }

    fn send_chunk(&mut self, mut retrieval: Retrieval) -> State {
        match retrieval.next_chunk() {
            Ok(Some(chunk)) => {
                let mut stream = self.reader.get_ref();
                match stream.write_all(&chunk) {
                    Ok(()) => {
                        self.last_progress = Instant::now();
                        State::StreamingBody(Transfer::Send(retrieval))
                    }
                    Err(e) => {
                        debug!(
                            peer = %self.peer,
                            error = %e,
                            remaining = retrieval.remaining(),
                            "Client went away, transfer truncated"
                        );
                        State::Closed
                    }
                }
            }
            Ok(None) => {
                debug!(peer = %self.peer, len = retrieval.len(), "Retrieval complete");
                retrieval.finish();
                State::Closing
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Storage read failed, transfer truncated");
                State::Closed
            }
        }
    }

    fn receive_chunk(&mut self, mut upload: Upload) -> State {
        if upload.remaining() == 0 {
            let status = match upload.commit() {
                Ok(()) => StatusCode::Ok,
                Err(StoreError::Conflict) => StatusCode::Conflict,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Cannot publish resource");
                    StatusCode::InternalServerError
                }
            };
            return self.respond(status, 0, State::Closing);
        }

        let mut buf = vec![0u8; chunk_size(upload.remaining())];
        match self.reader.read(&mut buf) {
            Ok(0) => {
                debug!(
                    peer = %self.peer,
                    remaining = upload.remaining(),
                    "Peer closed mid-upload"
                );
                self.respond(StatusCode::InternalServerError, 0, State::Closing)
            }
            Ok(n) => match upload.write_chunk(&buf[..n]) {
                Ok(()) => {
                    self.last_progress = Instant::now();
                    State::StreamingBody(Transfer::Receive(upload))
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Storage write failed");
                    self.respond(StatusCode::InternalServerError, 0, State::Closing)
                }
            },
            Err(e) if is_timeout(&e) => self.idle_or(State::StreamingBody(Transfer::Receive(upload))),
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Receive failed mid-upload");
                self.respond(StatusCode::InternalServerError, 0, State::Closing)
            }
        }
    }

    /// Half-close, then drop whatever input already arrived so closing does
    /// not reset the connection before the client reads the response.
    fn linger(&mut self) {
        let stream = self.reader.get_ref();
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            trace!(peer = %self.peer, error = %e, "Half-close failed");
            return;
        }
        if stream.set_nonblocking(true).is_err() {
            return;
        }

        let mut discard = [0u8; 4096];
        let mut drained = 0;
        while drained < LINGER_LIMIT {
            match self.reader.read(&mut discard) {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
        trace!(peer = %self.peer, drained, "Connection closed");
    }
}

impl EventHandler for ConnectionHandler {
    fn step(&mut self) -> Result<Step, BoxError> {
        let state = std::mem::replace(&mut self.state, State::Closed);
        self.state = match state {
            State::AwaitRequestLine | State::AwaitHeaders => self.await_head(state),
            State::Dispatched(head) => self.dispatch(head),
            State::Responding { head, then } => self.send_head(head, *then),
            State::StreamingBody(Transfer::Send(retrieval)) => self.send_chunk(retrieval),
            State::StreamingBody(Transfer::Receive(upload)) => self.receive_chunk(upload),
            State::Closing => {
                self.linger();
                State::Closed
            }
            State::Closed => State::Closed,
        };

        Ok(match self.state {
            State::Closed => Step::Done,
            _ => Step::Continue,
        })
    }
}

/// The declared body length of a POST.
fn content_length(headers: &Headers) -> Result<u64, StatusCode> {
    match headers.get("content-length") {
        None => Err(StatusCode::LengthRequired),
        Some([value]) => value
            .as_int()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or(StatusCode::BadRequest),
        Some(_) => Err(StatusCode::BadRequest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::parser::HeaderValue;
    use crate::protocols::http::PathResolver;
    use crate::runtime::handler::run_to_completion;
    use crate::storage::tests::scratch_dir;
    use crate::sync::AliveFlag;
    use std::fs;
    use std::net::TcpListener;
    use std::path::Path;
    use std::thread;

    /// Run one request against a handler on a loopback connection.
    fn exchange(root: &Path, request: &[u8]) -> Vec<u8> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(5))).unwrap();

        let resolver: Arc<dyn Resolve> = Arc::new(PathResolver::new(root, true));
        let mut handler = ConnectionHandler::new(stream, peer, resolver, None);

        client.write_all(request).unwrap();
        let alive = AliveFlag::new();
        let worker = thread::spawn(move || run_to_completion(&mut handler, &alive));

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        worker.join().unwrap().unwrap();
        response
    }

    fn status_line(response: &[u8]) -> String {
        let text = String::from_utf8_lossy(response);
        text.lines().next().unwrap_or_default().to_string()
    }

    fn body(response: &[u8]) -> &[u8] {
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap();
        &response[split + 4..]
    }

    #[test]
    fn test_content_length_rules() {
        let mut headers = Headers::new();
        assert_eq!(content_length(&headers), Err(StatusCode::LengthRequired));
        headers.set("content-length", "abc");
        assert_eq!(content_length(&headers), Err(StatusCode::BadRequest));
        headers.set("content-length", HeaderValue::Int(-1));
        assert_eq!(content_length(&headers), Err(StatusCode::BadRequest));
        headers.set("content-length", 7u64);
        assert_eq!(content_length(&headers), Ok(7));
        headers.add("content-length", 8u64);
        assert_eq!(content_length(&headers), Err(StatusCode::BadRequest));
    }

    #[test]
    fn test_post_then_get() {
        let root = scratch_dir("handler");
        let response = exchange(&root, b"POST /memo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(status_line(&response), "HTTP/1.1 200 OK");
        assert_eq!(fs::read(root.join("memo")).unwrap(), b"hello");

        let response = exchange(&root, b"GET /memo HTTP/1.1\r\n\r\n");
        assert_eq!(status_line(&response), "HTTP/1.1 200 OK");
        assert_eq!(body(&response), b"hello");
        assert!(!root.join("memo").exists());

        let response = exchange(&root, b"GET /memo HTTP/1.1\r\n\r\n");
        assert_eq!(status_line(&response), "HTTP/1.1 404 Not Found");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_post_conflict() {
        let root = scratch_dir("handler-conflict");
        fs::write(root.join("taken"), b"first").unwrap();
        let response = exchange(&root, b"POST /taken HTTP/1.0\r\nContent-Length: 6\r\n\r\nsecond");
        assert_eq!(status_line(&response), "HTTP/1.0 409 Conflict");
        assert_eq!(fs::read(root.join("taken")).unwrap(), b"first");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_post_truncated_body() {
        let root = scratch_dir("handler-truncated");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(5))).unwrap();

        let resolver: Arc<dyn Resolve> = Arc::new(PathResolver::new(&root, true));
        let mut handler = ConnectionHandler::new(stream, peer, resolver, None);

        client.write_all(b"POST /cut HTTP/1.1\r\nContent-Length: 100\r\n\r\nshort").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        run_to_completion(&mut handler, &AliveFlag::new()).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();

        assert_eq!(status_line(&response), "HTTP/1.1 500 Internal Server Error");
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_protocol_errors() {
        let root = scratch_dir("handler-errors");
        let response = exchange(&root, b"POST /x HTTP/1.1\r\n\r\n");
        assert_eq!(status_line(&response), "HTTP/1.1 411 Length Required");
        assert!(!root.join("x").exists());

        let response = exchange(&root, b"DELETE /x HTTP/1.1\r\n\r\n");
        assert_eq!(status_line(&response), "HTTP/1.1 501 Not Implemented");

        let response = exchange(&root, b"GET /x SPDY/3\r\n\r\n");
        assert_eq!(status_line(&response), "HTTP/1.1 400 Bad Request");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_idle_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(5))).unwrap();

        let resolver: Arc<dyn Resolve> = Arc::new(PathResolver::new("/nonexistent", true));
        let mut handler =
            ConnectionHandler::new(stream, peer, resolver, Some(Duration::from_millis(50)));

        client.write_all(b"GET /never-fin").unwrap();
        let started = Instant::now();
        run_to_completion(&mut handler, &AliveFlag::new()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(handler);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_non_connection_events_ignored() {
        let factory = DropHandlerFactory::new(Arc::new(PathResolver::new("/tmp", true)), None);
        let context = Arc::new(crate::runtime::ServerContext {
            name: "test".to_string(),
            local_addr: None,
            alive: AliveFlag::new(),
            conn_timeout: Duration::from_millis(5),
        });
        let event = Event::new(
            EventKind::Timer {
                tick: 1,
                at: Instant::now(),
            },
            context,
        );
        let mut handler = factory.handler(event);
        assert_eq!(handler.step().unwrap(), Step::Done);
    }
}
