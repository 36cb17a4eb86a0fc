//! Loopback TCP listener: accepts connections, wraps each in a `Manager`,
//! and drives the whole fleet from one thread.

use epc_prelude::*;

use crate::channel::Channel;
use crate::config::Config;
use crate::connection::{Connection, TcpTransport};
use crate::manager::{init_epc_layer, Manager};

use std::net::{SocketAddr, TcpListener};

/// A running EPC server: owns the listener and every accepted connection's
/// `Manager`.
pub struct Server {
    listener: TcpListener,
    config: Config,
    connect_function: Box<dyn Fn(&Manager)>,
    clients: RefCell<Vec<Manager>>,
}

impl Server {
    /// Bind `config.bind_addr` on `port` (0 for an OS-assigned ephemeral
    /// port) and start accepting connections. `connect_function` is called
    /// once per accepted client, before that client's first call can
    /// complete, so it can register methods via `Manager::define_method`.
    pub fn start(
        connect_function: impl Fn(&Manager) + 'static,
        port: u16,
        config: Option<Config>,
    ) -> std::io::Result<Rc<Server>> {
        let config = config.unwrap_or_default();
        let addr = SocketAddr::from((config.bind_addr, port));
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        log::info!("epc server listening on {}", listener.local_addr()?);

        let server = Rc::new(Server {
            listener,
            config,
            connect_function: Box::new(connect_function),
            clients: RefCell::new(Vec::new()),
        });
        server.accept_pending();
        Ok(server)
    }

    /// The address actually bound (useful when `port` was 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of currently tracked client connections.
    pub fn client_count(&self) -> usize {
        self.clients.borrow().len()
    }

    /// Accept every connection currently pending, without blocking.
    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let transport = match TcpTransport::new(stream) {
                        Ok(t) => t,
                        Err(e) => {
                            log::warn!("epc server: failed to prepare accepted socket from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let conn = Connection::new(format!("client:{}", peer), Box::new(transport), Channel::new());
                    let mngr = Manager::new(conn, true, Some(self.config.clone()));
                    init_epc_layer(&mngr);
                    (self.connect_function)(&mngr);
                    log::info!("epc server: accepted {}", peer);
                    self.clients.borrow_mut().push(mngr);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("epc server: accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Drive one iteration: accept any pending connections, poll every
    /// client for a short slice each, drop clients whose peer disconnected,
    /// and drain one post-queue tick. Intended to be called in a loop by
    /// the embedding application, which is responsible for sleeping
    /// `config.tick_time` between calls when idle.
    pub fn step(&self) {
        self.accept_pending();
        let mut closed = Vec::new();
        for (i, mngr) in self.clients.borrow().iter().enumerate() {
            if mngr.connection().poll(self.config.tick_time) {
                closed.push(i);
            }
        }
        if !closed.is_empty() {
            let mut clients = self.clients.borrow_mut();
            for i in closed.into_iter().rev() {
                let mngr = clients.remove(i);
                log::info!("epc server: client disconnected, stopping its manager");
                mngr.stop();
            }
        }
        crate::deferred::pump_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp::Sexp;
    use std::time::{Duration, Instant};

    #[test]
    fn accepts_a_client_and_serves_a_call() {
        crate::deferred::pump_all();
        let server = Server::start(
            |mngr| {
                mngr.define_method(
                    "echo",
                    |args| crate::manager::TaskOutcome::Value(args.first().cloned().unwrap_or_else(Sexp::nil)),
                    None,
                    None,
                );
            },
            0,
            None,
        )
        .expect("bind should succeed on an ephemeral port");
        let addr = server.local_addr().unwrap();

        let stream = std::net::TcpStream::connect(addr).expect("client connect");
        let transport = crate::connection::TcpTransport::new(stream).unwrap();
        let conn = Connection::new("client", Box::new(transport), Channel::new());
        let client = Manager::new(conn, false, None);
        init_epc_layer(&client);

        let d = client.call_deferred("echo", vec![Sexp::Str("hi".into())]);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            server.step();
            client.connection().poll(Duration::from_millis(5));
            crate::deferred::pump_all();
            if d.tail().is_settled() || Instant::now() > deadline {
                break;
            }
        }
        assert_eq!(d.tail().try_take_result().unwrap().unwrap(), Sexp::Str("hi".into()));
        assert_eq!(server.client_count(), 1);
    }
}
