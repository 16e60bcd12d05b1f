//! Protocol implementations.
//!
//! - `http`: the file-drop protocol served by the `sdrop` binary
pub mod http;
