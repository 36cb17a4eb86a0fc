//! Connects to `echo_server`, calls `echo` synchronously, and prints the
//! round-tripped value plus the server's method list.

use epc::{Channel, Connection, Manager, Sexp, TcpTransport};

fn main() {
    env_logger::init();

    let stream = std::net::TcpStream::connect("127.0.0.1:60123").expect("connect to echo_server");
    let transport = TcpTransport::new(stream).expect("wrap stream");
    let conn = Connection::new("echo_client", Box::new(transport), Channel::new());
    let mngr = Manager::new(conn, false, None);
    epc::init_epc_layer(&mngr);

    match mngr.call_sync("echo", vec![Sexp::Str("hello, epc".into())]) {
        Ok(v) => println!("echo replied: {:?}", v),
        Err(e) => eprintln!("echo failed: {}", e),
    }

    match mngr.query_methods_sync() {
        Ok(v) => println!("registered methods: {:?}", v),
        Err(e) => eprintln!("methods failed: {}", e),
    }

    mngr.stop();
}
