//! Incremental request-head parser.
//!
//! Bytes are pushed one at a time so the caller controls how much of the
//! connection is consumed per step. A space ends the method, a space ends the
//! resource, a newline ends the version; header lines follow until a blank
//! line. Nothing past the blank line is ever consumed.

use std::collections::BTreeMap;
use std::fmt;

/// Largest request head accepted, request line included.
pub const MAX_HEAD: usize = 64 * 1024;

/// A header value, coerced to a number when the whole value parses as one.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl HeaderValue {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(n) = raw.parse::<i64>() {
            return HeaderValue::Int(n);
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => HeaderValue::Float(f),
            _ => HeaderValue::Text(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Int(n) => write!(f, "{}", n),
            HeaderValue::Float(x) => write!(f, "{}", x),
            HeaderValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for HeaderValue {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => HeaderValue::Int(n),
            Err(_) => HeaderValue::Text(n.to_string()),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

/// Case-insensitive multi-map of headers, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(BTreeMap<String, Vec<HeaderValue>>);

fn normalize(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping earlier values for the same key.
    pub fn add(&mut self, key: &str, value: impl Into<HeaderValue>) {
        self.0.entry(normalize(key)).or_default().push(value.into());
    }

    /// Replace every value for `key`.
    pub fn set(&mut self, key: &str, value: impl Into<HeaderValue>) {
        self.0.insert(normalize(key), vec![value.into()]);
    }

    pub fn get(&self, key: &str) -> Option<&[HeaderValue]> {
        self.0.get(&normalize(key)).map(Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<&HeaderValue> {
        self.get(key).and_then(<[HeaderValue]>::first)
    }

    /// Every (key, value) pair, keys sorted, values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v)))
    }
}

/// A fully parsed request head.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub resource: String,
    pub version: f64,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The head exceeded `MAX_HEAD` bytes.
    HeadTooLarge,
    /// A line break arrived before the method and resource were complete.
    MalformedRequestLine,
    /// The version token is not `HTTP/<number>`.
    BadVersion(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::HeadTooLarge => write!(f, "request head exceeds {} bytes", MAX_HEAD),
            ParseError::MalformedRequestLine => write!(f, "malformed request line"),
            ParseError::BadVersion(v) => write!(f, "bad protocol version: {:?}", v),
        }
    }
}

impl std::error::Error for ParseError {}

/// What the last pushed byte completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Mid-line.
    Partial,
    /// A line (request line or header line) ended.
    Line,
    /// The blank line ending the head was seen.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Method,
    Resource,
    Version,
    Headers,
    Done,
}

#[derive(Debug)]
pub struct RequestParser {
    phase: Phase,
    buf: Vec<u8>,
    fold: String,
    consumed: usize,
    method: String,
    resource: String,
    version: f64,
    headers: Headers,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Method,
            buf: Vec::new(),
            fold: String::new(),
            consumed: 0,
            method: String::new(),
            resource: String::new(),
            version: 0.0,
            headers: Headers::new(),
        }
    }

    /// True until the request line has been read.
    pub fn in_request_line(&self) -> bool {
        matches!(self.phase, Phase::Method | Phase::Resource | Phase::Version)
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Version seen so far, if the request line is complete.
    pub fn version(&self) -> Option<f64> {
        (!self.in_request_line()).then_some(self.version)
    }

    pub fn push(&mut self, byte: u8) -> Result<Progress, ParseError> {
        if self.phase == Phase::Done {
            return Ok(Progress::Complete);
        }
        self.consumed += 1;
        if self.consumed > MAX_HEAD {
            return Err(ParseError::HeadTooLarge);
        }

        match self.phase {
            Phase::Method | Phase::Resource => match byte {
                // Blank lines before a request are tolerated.
                b'\n' if self.phase == Phase::Method && self.buf.is_empty() => {}
                b'\n' => return Err(ParseError::MalformedRequestLine),
                b'\r' | b' ' if self.buf.is_empty() => {}
                b' ' => {
                    let token = take_text(&mut self.buf);
                    if self.phase == Phase::Method {
                        self.method = token;
                        self.phase = Phase::Resource;
                    } else {
                        self.resource = token;
                        self.phase = Phase::Version;
                    }
                }
                _ => self.buf.push(byte),
            },
            Phase::Version => {
                if byte == b'\n' {
                    let raw = take_text(&mut self.buf);
                    self.version = parse_version(&raw)?;
                    self.phase = Phase::Headers;
                    return Ok(Progress::Line);
                }
                self.buf.push(byte);
            }
            Phase::Headers => {
                if byte == b'\n' {
                    return Ok(self.header_line());
                }
                self.buf.push(byte);
            }
            Phase::Done => {}
        }
        Ok(Progress::Partial)
    }

    fn header_line(&mut self) -> Progress {
        let line = take_text(&mut self.buf);
        if line.is_empty() {
            self.fold.clear();
            self.phase = Phase::Done;
            return Progress::Complete;
        }

        let joined = if self.fold.is_empty() {
            line
        } else {
            std::mem::take(&mut self.fold) + &line
        };

        match joined.split_once(':') {
            Some((key, value)) => self.headers.add(key, HeaderValue::parse(value)),
            // Continued on the next line.
            None => self.fold = joined + " ",
        }
        Progress::Line
    }

    /// The parsed head, once `push` has returned `Complete`.
    pub fn into_head(self) -> Option<RequestHead> {
        (self.phase == Phase::Done).then_some(RequestHead {
            method: self.method,
            resource: self.resource,
            version: self.version,
            headers: self.headers,
        })
    }
}

/// Drain the buffer into a trimmed string.
fn take_text(buf: &mut Vec<u8>) -> String {
    let text = String::from_utf8_lossy(buf).trim().to_string();
    buf.clear();
    text
}

fn parse_version(raw: &str) -> Result<f64, ParseError> {
    raw.strip_prefix("HTTP/")
        .and_then(|n| n.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| ParseError::BadVersion(raw.to_string()))
}
