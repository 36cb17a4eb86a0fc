//! A minimal EPC server exposing one method, `echo`, that returns its
//! single argument unchanged. Run alongside `echo_client`.

use epc::{Manager, Server, TaskOutcome};

fn main() {
    env_logger::init();

    let server = Server::start(
        |mngr: &Manager| {
            mngr.define_method(
                "echo",
                |args| TaskOutcome::Value(args.first().cloned().unwrap_or_else(epc::Sexp::nil)),
                None,
                Some("echo back a single argument".into()),
            );
        },
        60123,
        None,
    )
    .expect("failed to bind");

    println!("listening on {}", server.local_addr().unwrap());
    loop {
        server.step();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
