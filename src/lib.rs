//! sdrop: a temporary file drop server
//!
//! A resource is stored by one POST and destroyed by the first GET that
//! reads it: every chunk is overwritten with random bytes as it is sent,
//! then the file is unlinked.
//!
//! The server is built from small parts:
//! - `runtime`: event sources, steppable handlers and interchangeable
//!   schedulers (direct, threaded, iterative pool, pipelining)
//! - `protocols::http`: the request parser and per-connection state machine
//! - `storage`: locked shredding reads and no-overwrite uploads
//! - `config`: CLI arguments merged over a TOML file

pub mod config;
pub mod protocols;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod sync;
