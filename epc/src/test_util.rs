//! In-memory transport pair for tests, grounded in the teacher's
//! `test_util::transport::mock::MockTransport`: two endpoints share a pair
//! of byte queues instead of a socket, so connection-level tests don't need
//! a real listener.

use epc_prelude::*;

use crate::connection::Transport;
use crate::error::Error;

use std::collections::VecDeque;
use std::time::Duration;

struct Shared {
    /// Bytes written by this endpoint's peer, waiting to be read.
    inbox: VecDeque<u8>,
    peer_closed: bool,
}

/// One side of an in-memory, loopback byte transport.
pub struct MockTransport {
    inbox: Rc<RefCell<Shared>>,
    outbox: Rc<RefCell<Shared>>,
    closed: bool,
}

impl MockTransport {
    /// Build two linked endpoints: bytes sent on one arrive as reads on the
    /// other.
    pub fn pair() -> (MockTransport, MockTransport) {
        let a_to_b = Rc::new(RefCell::new(Shared { inbox: VecDeque::new(), peer_closed: false }));
        let b_to_a = Rc::new(RefCell::new(Shared { inbox: VecDeque::new(), peer_closed: false }));
        let a = MockTransport { inbox: b_to_a.clone(), outbox: a_to_b.clone(), closed: false };
        let b = MockTransport { inbox: a_to_b, outbox: b_to_a, closed: false };
        (a, b)
    }
}

impl Transport for MockTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        self.outbox.borrow_mut().inbox.extend(bytes.iter().copied());
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        if self.closed {
            return Ok(None);
        }
        let mut shared = self.inbox.borrow_mut();
        if shared.inbox.is_empty() {
            return Ok(if shared.peer_closed { None } else { Some(Vec::new()) });
        }
        Ok(Some(shared.inbox.drain(..).collect()))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.outbox.borrow_mut().peer_closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_bytes_arrive_on_the_peer() {
        let (mut a, mut b) = MockTransport::pair();
        a.send(b"hello").unwrap();
        let got = b.read(Duration::from_millis(0)).unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn close_is_observed_as_peer_closed_once_drained() {
        let (mut a, mut b) = MockTransport::pair();
        a.send(b"hi").unwrap();
        a.close();
        let got = b.read(Duration::from_millis(0)).unwrap().unwrap();
        assert_eq!(got, b"hi");
        assert!(b.read(Duration::from_millis(0)).unwrap().is_none());
    }

    #[test]
    fn empty_read_is_some_empty_vec_while_open() {
        let (_a, mut b) = MockTransport::pair();
        assert_eq!(b.read(Duration::from_millis(0)).unwrap(), Some(Vec::new()));
    }
}
