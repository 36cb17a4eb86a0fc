//! EPC: a small, single-threaded implementation of the Emacs-style
//! Procedure Call protocol -- bidirectional RPC over a length-prefixed
//! s-expression wire format, where either end of a connection can be
//! caller and callee at once.
//!
//! Three layers, bottom to top:
//! - [`sexp`] and [`codec`]: the value model and wire framing.
//! - [`deferred`] and [`channel`]: a single-assignment continuation engine
//!   and the per-connection event registry built on top of it.
//! - [`connection`], [`manager`] and [`server`]: a framed connection, the
//!   EPC call/return/methods protocol layered on its channel, and a
//!   loopback TCP listener that manages a fleet of accepted connections.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod deferred;
pub mod error;
pub mod manager;
pub mod server;
pub mod sexp;

#[cfg(test)]
pub mod test_util;

pub use channel::Channel;
pub use config::Config;
pub use connection::{Connection, TcpTransport, Transport};
pub use deferred::Deferred;
pub use error::Error;
pub use manager::{init_epc_layer, Manager, Method, TaskOutcome};
pub use sexp::{Sexp, Symbol};
pub use server::Server;
