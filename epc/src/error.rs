//! Error taxonomy for the EPC core.
//!
//! Wire-level failures (`return-error`, `epc-error`) and purely local
//! failures (framing, I/O, an orphaned session) are unified behind one
//! `Fail`-derived enum so callers can `match` on error kind instead of
//! sniffing prefix strings out of a message.

use epc_prelude::*;

use std::io;
use std::str::Utf8Error;

/// Failure while decoding a single frame's header or payload.
#[derive(Clone, Debug, Fail)]
pub enum FramingError {
    /// The 6 header bytes were not lowercase ASCII hex.
    #[fail(display = "malformed length header: {:?}", _0)]
    BadHexHeader(String),
    /// The header declared a zero-length payload.
    #[fail(display = "zero-length frame")]
    ZeroLength,
    /// Payload bytes were not valid UTF-8.
    #[fail(display = "payload is not valid UTF-8: {}", _0)]
    Utf8(Utf8Error),
    /// Payload could not be parsed as an s-expression.
    #[fail(display = "malformed s-expression: {}", _0)]
    SexpSyntax(String),
}

/// Top level error type returned by every fallible operation in this crate.
#[derive(Debug, Fail)]
pub enum Error {
    /// Socket-level failure.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[fail(cause)] io::Error),
    /// A frame could not be decoded.
    #[fail(display = "framing error: {}", _0)]
    Framing(FramingError),
    /// The peer reported a protocol-level failure (wire tag `epc-error`),
    /// e.g. a call to a method it does not have registered. The wire
    /// message already carries its own `EPC-ERROR: ` prefix (see
    /// `Manager::handle_call`'s unknown-method reply), so this is not
    /// re-added here.
    #[fail(display = "{}", _0)]
    EpcError(String),
    /// The peer reported an application-level failure (wire tag
    /// `return-error`): the remote method's own task raised.
    #[fail(display = "{}", _0)]
    RemoteError(String),
    /// The connection was closed before a reply to this call arrived.
    #[fail(display = "connection closed before a reply arrived")]
    Disconnected,
    /// A call was dispatched locally against an unregistered method name.
    #[fail(display = "No such method: {}", _0)]
    NoSuchMethod(String),
}

impl Error {
    /// True if this error originated from the wire's `epc-error` channel,
    /// i.e. a protocol-level failure as opposed to an application one.
    pub fn is_epc_error(&self) -> bool {
        matches!(self, Error::EpcError(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}
