//! End-to-end test over a real loopback TCP socket (as opposed to the
//! `MockTransport`-based tests inside `src/`), exercising the full stack:
//! `Server` accepting a connection and `Manager` dispatching a call.
//!
//! Both sides live on this one thread and are driven by hand (`step`,
//! `poll`, `pump_all`) rather than via `call_sync`/`sync`, since every
//! `Manager`/`Server` here is `Rc`-based and therefore cannot cross a real
//! OS thread boundary -- the same single-threaded discipline the
//! `MockTransport` tests in `src/manager.rs`/`src/server.rs` already rely
//! on applies equally to a real socket.

use epc::{Channel, Connection, Manager, Sexp, Server, TaskOutcome, TcpTransport};
use std::time::{Duration, Instant};

fn drive_to_settlement(d: &epc::Deferred<Sexp>, server: &Server, client: &Manager) -> Result<Sexp, epc::Error> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if d.tail().is_settled() {
            return d.tail().try_take_result().unwrap();
        }
        assert!(Instant::now() < deadline, "deferred did not settle in time");
        server.step();
        client.connection().poll(Duration::from_millis(5));
        epc::deferred::pump_all();
    }
}

#[test]
fn echo_over_real_tcp() {
    let server = Server::start(
        |mngr: &Manager| {
            mngr.define_method(
                "echo",
                |args| TaskOutcome::Value(args.first().cloned().unwrap_or_else(Sexp::nil)),
                None,
                None,
            );
        },
        0,
        None,
    )
    .expect("bind should succeed on an ephemeral port");
    let addr = server.local_addr().unwrap();

    let stream = std::net::TcpStream::connect(addr).expect("connect");
    let transport = TcpTransport::new(stream).expect("wrap stream");
    let conn = Connection::new("test-client", Box::new(transport), Channel::new());
    let client = Manager::new(conn, false, None);
    epc::init_epc_layer(&client);

    let d = client.call_deferred("echo", vec![Sexp::Str("round trip".into())]);
    let result = drive_to_settlement(&d, &server, &client);

    assert_eq!(result.unwrap(), Sexp::Str("round trip".into()));
}

#[test]
fn unknown_method_over_real_tcp_fails_with_epc_error() {
    let server = Server::start(|_mngr: &Manager| {}, 0, None).expect("bind should succeed");
    let addr = server.local_addr().unwrap();

    let stream = std::net::TcpStream::connect(addr).expect("connect");
    let transport = TcpTransport::new(stream).expect("wrap stream");
    let conn = Connection::new("test-client", Box::new(transport), Channel::new());
    let client = Manager::new(conn, false, None);
    epc::init_epc_layer(&client);

    let d = client.call_deferred("nonesuch", vec![]);
    let result = drive_to_settlement(&d, &server, &client);

    let err = result.unwrap_err();
    assert!(err.is_epc_error());
}
