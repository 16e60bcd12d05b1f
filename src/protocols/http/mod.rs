//! The drop protocol: a minimal HTTP/1.x subset.
//!
//! `POST /name` with a `Content-Length` stores a resource once; the first
//! `GET /name` streams it back, shredding each chunk as it goes, and then
//! unlinks it. Every connection carries exactly one request.

mod handler;
pub mod parser;
mod resolver;
mod response;

pub use handler::{ConnectionHandler, DropHandlerFactory};
pub use parser::{HeaderValue, Headers, ParseError, RequestHead, RequestParser};
pub use resolver::{PathResolver, Resolve};
pub use response::{ResponseHead, StatusCode};
