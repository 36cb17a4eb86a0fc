//! Construction-time knobs shared by `Manager` and `Server`, mirroring the
//! teacher's preference for explicit constructor parameters
//! (`WebSocket::new_opened(url)`, `Handle::new(transport)`) over hidden
//! global constants.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Tunable parameters, with the base spec's stated defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long the server's accept loop sleeps between idle iterations
    /// when it has nothing to do.
    pub tick_time: Duration,
    /// How long `sync` blocks on one connection-poll attempt before
    /// checking whether its target deferred has settled.
    pub sync_poll_budget: Duration,
    /// How long `Manager::stop` waits for pending socket output to drain.
    pub stop_drain_budget: Duration,
    /// Interface `Server::start` binds to. Loopback-only by design: this
    /// is not meant to expose EPC services beyond the local host.
    pub bind_addr: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tick_time: Duration::from_millis(1),
            sync_poll_budget: Duration::from_millis(150),
            stop_drain_budget: Duration::from_millis(150),
            bind_addr: Ipv4Addr::LOCALHOST,
        }
    }
}
