#![allow(dead_code)]

use sdrop::config::{Config, SchedulerType};
use sdrop::server::Server;
use sdrop::sync::AliveFlag;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A server on a loopback port storing into a fresh scratch directory.
pub struct TestServer {
    pub addr: SocketAddr,
    pub root: PathBuf,
    alive: AliveFlag,
    thread: Option<JoinHandle<usize>>,
}

impl TestServer {
    pub fn start(tag: &str, scheduler: SchedulerType, threads: i64) -> Self {
        let root = std::env::temp_dir().join(format!(
            "sdrop-it-{}-{}-{:08x}",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&root).unwrap();

        let config = Config {
            listen: Some("127.0.0.1:0".parse().unwrap()),
            accept_timeout: Duration::from_millis(10),
            conn_timeout: Duration::from_millis(5),
            idle_timeout: Some(Duration::from_secs(5)),
            drain_timeout: Duration::from_secs(5),
            threads,
            scheduler,
            root: root.clone(),
            isolate: true,
            ..Config::default()
        };

        let server = Server::from_config(&config, AliveFlag::new()).unwrap();
        let addr = server.local_addr().unwrap();
        let alive = server.alive();
        let thread = thread::spawn(move || server.run(None));

        Self {
            addr,
            root,
            alive,
            thread: Some(thread),
        }
    }

    pub fn pipelining(tag: &str) -> Self {
        Self::start(tag, SchedulerType::Pipelining, 2)
    }

    /// Send raw request bytes and read the whole response.
    pub fn request(&self, raw: &[u8]) -> Response {
        let mut stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(raw).unwrap();

        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        Response::parse(&bytes)
    }

    pub fn post(&self, name: &str, body: &[u8]) -> Response {
        let mut raw = format!(
            "POST /{} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            name,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        self.request(&raw)
    }

    pub fn get(&self, name: &str) -> Response {
        self.request(format!("GET /{} HTTP/1.1\r\nHost: localhost\r\n\r\n", name).as_bytes())
    }

    /// Names stored under the root, staging files included.
    pub fn stored(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.alive.kill();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[derive(Debug)]
pub struct Response {
    pub status_line: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    fn parse(bytes: &[u8]) -> Self {
        let split = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap_or_else(|| panic!("no response head in {:?}", String::from_utf8_lossy(bytes)));
        let head = String::from_utf8(bytes[..split].to_vec()).unwrap();
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap().to_string();
        let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
        let headers = lines
            .map(|line| {
                let (k, v) = line.split_once(": ").unwrap();
                (k.to_string(), v.to_string())
            })
            .collect();

        Self {
            status_line,
            status,
            headers,
            body: bytes[split + 4..].to_vec(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Deterministic filler that differs per seed.
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
