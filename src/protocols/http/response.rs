//! Response heads.

use super::parser::{HeaderValue, Headers};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;

/// Status codes the drop server answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
    LengthRequired,
    InternalServerError,
    NotImplemented,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::Conflict => 409,
            StatusCode::LengthRequired => 411,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::Conflict => "Conflict",
            StatusCode::LengthRequired => "Length Required",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
        }
    }
}

/// Status line plus headers. Bodies are streamed separately.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub version: f64,
    pub status: StatusCode,
    pub headers: Headers,
}

impl ResponseHead {
    /// A head with `Connection: close` and the given content length.
    pub fn new(version: f64, status: StatusCode, content_length: u64) -> Self {
        let mut headers = Headers::new();
        headers.set("connection", "close");
        headers.set("content-length", content_length);
        Self {
            version,
            status,
            headers,
        }
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Wire form, terminated by the blank line.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(128);
        // Writing into a String cannot fail.
        let _ = write!(
            out,
            "HTTP/{:.1} {} {}\r\n",
            self.version,
            self.status.as_u16(),
            self.status.reason_phrase()
        );
        for (key, value) in self.headers.iter() {
            let _ = write!(out, "{}: {}\r\n", capitalize(key), value);
        }
        out.push_str("\r\n");

        let mut buf = BytesMut::with_capacity(out.len());
        buf.put_slice(out.as_bytes());
        buf.freeze()
    }
}

/// `content-length` -> `Content-Length`.
fn capitalize(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
