//! golist - caching go/packages driver
//!
//! The binary answers `go list` queries through a long-running daemon that
//! keeps results in a durable cache and refreshes them when source files
//! change. This library holds the pieces the binary is made of.

pub mod client;
pub mod logging;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientError, Launcher};
pub use protocol::{ProtocolError, Request, Response, Route, Status};
pub use server::{DaemonConfig, Server, ServerError};
