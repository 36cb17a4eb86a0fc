//! Connection: owns a byte transport and a read buffer, decodes frames as
//! bytes arrive, and dispatches decoded messages onto a `Channel`.
//!
//! `Transport` plays the role the teacher's `json_rpc::Transport` trait
//! plays for its WebSocket/mock backends (`transport/web.rs`,
//! `test_util::transport::mock::MockTransport`), generalized from "send a
//! whole text message" to "send raw bytes", since here the framing (the
//! length header) is this crate's own responsibility rather than the
//! transport's.

use epc_prelude::*;

use crate::channel::Channel;
use crate::codec::ReadBuffer;
use crate::error::Error;
use crate::sexp::Sexp;

use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::TcpStream;
use std::time::Duration;

/// Byte-level transport a `Connection` frames on top of.
pub trait Transport {
    /// Write `bytes` as-is. No chunking guarantees beyond the OS primitive.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Non-blocking-ish read: wait up to `timeout` for bytes to arrive, and
    /// return whatever is available (possibly empty if the timeout
    /// elapsed with nothing to read, possibly `None` if the peer has
    /// closed the connection).
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, Error>;

    /// Tear down the transport. Idempotent.
    fn close(&mut self);
}

/// A `Transport` backed by a real `std::net::TcpStream`.
pub struct TcpTransport {
    stream: TcpStream,
    closed: bool,
}

impl TcpTransport {
    /// Wrap an already-connected stream. Puts it into non-blocking-with-
    /// timeout mode so `read` can be polled cooperatively.
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true).ok();
        Ok(TcpTransport { stream, closed: false })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        if self.closed {
            return Ok(None);
        }
        self.stream.set_read_timeout(Some(timeout)).ok();
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                self.closed = true;
                Ok(None)
            }
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(Some(Vec::new()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Current lifecycle state of a `Connection`, used by `Manager::live_p`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Accepting/initiating, not yet exchanging frames (reserved for
    /// transports with a handshake; plain TCP transitions straight to Open).
    Connecting,
    /// Open and able to exchange frames.
    Open,
    /// Disconnected. Terminal.
    Closed,
}

/// Owns a transport and the byte buffer frames are assembled from,
/// publishing decoded messages onto a `Channel`.
pub struct Connection {
    pub name: String,
    transport: RefCell<Box<dyn Transport>>,
    read_buffer: RefCell<ReadBuffer>,
    channel: Channel,
    state: Cell<State>,
}

impl Connection {
    /// Wrap `transport`, named `name` for logging, publishing decoded
    /// messages onto `channel`.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, channel: Channel) -> Self {
        Connection {
            name: name.into(),
            transport: RefCell::new(transport),
            read_buffer: RefCell::new(ReadBuffer::new()),
            channel,
            state: Cell::new(State::Open),
        }
    }

    /// The channel messages decoded off this connection are published to.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Encode and write `v` as one frame.
    pub fn send(&self, v: &Sexp) -> Result<(), Error> {
        let frame = crate::codec::encode(v);
        self.transport.borrow_mut().send(&frame)
    }

    /// Poll the transport for up to `timeout`, feed any bytes into the read
    /// buffer, and drain every complete frame now available, publishing
    /// each to the channel. A malformed individual frame is logged and the
    /// loop stops (since we cannot safely skip past an undecodable frame of
    /// unknown length); well-formed frames already drained are unaffected.
    ///
    /// Returns `true` if the peer closed the connection during this call.
    pub fn poll(&self, timeout: Duration) -> bool {
        if self.state.get() == State::Closed {
            return true;
        }
        let bytes = match self.transport.borrow_mut().read(timeout) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.disconnect();
                return true;
            }
            Err(e) => {
                log::warn!("[{}] transport read error: {}", self.name, e);
                self.disconnect();
                return true;
            }
        };
        if !bytes.is_empty() {
            self.read_buffer.borrow_mut().feed(&bytes);
        }
        self.drain_frames();
        false
    }

    fn drain_frames(&self) {
        loop {
            let frame = self.read_buffer.borrow_mut().take_frame();
            match frame {
                Ok(Some(v)) => self.dispatch(v),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[{}] framing error, dropping rest of buffer: {}", self.name, e);
                    break;
                }
            }
        }
    }

    fn dispatch(&self, v: Sexp) {
        let items = match v.as_list() {
            Some(items) if !items.is_empty() => items,
            _ => {
                log::warn!("[{}] malformed message (not a non-empty list): {:?}", self.name, v);
                return;
            }
        };
        let head = match items[0].as_symbol() {
            Some(sym) => sym.clone(),
            None => {
                log::warn!("[{}] malformed message (head is not a symbol): {:?}", self.name, v);
                return;
            }
        };
        let rest = Sexp::List(items[1..].to_vec());
        self.channel.send(&head, rest);
    }

    /// Close the transport and mark this connection terminal. Idempotent.
    pub fn disconnect(&self) {
        if self.state.get() == State::Closed {
            return;
        }
        log::debug!("[{}] disconnecting", self.name);
        self.transport.borrow_mut().close();
        self.state.set(State::Closed);
    }
}
