//! The EPC manager: per-connection registered methods, pending outbound
//! sessions, and the five message-kind handlers wired onto the connection's
//! channel.
//!
//! Structured as a cheap `Rc` handle around its mutable state, the same
//! shape the teacher's `utils::make_handles!` macro produces for its own
//! per-connection objects (`Handle(Rc<RefCell<T>>)`); here the state is
//! split into a few separately-borrowed `RefCell`s instead of one, since
//! the handlers below only ever need to borrow one of `methods` or
//! `sessions` at a time.

use epc_prelude::*;

use crate::channel::Key;
use crate::config::Config;
use crate::connection::Connection;
use crate::deferred::{Deferred, Outcome};
use crate::error::Error;
use crate::sexp::{Sexp, Symbol};

/// What a registered method's task produced.
pub enum TaskOutcome {
    /// A concrete value, sent back as `return` immediately.
    Value(Sexp),
    /// An async result; `return` is sent once it resolves (see the open
    /// question in the design notes about errors on this path).
    Deferred(Deferred<Sexp>),
    /// The task raised. `Sexp` because the original error can be any
    /// value (a string, a symbol, a structured list) and is re-printed
    /// with the same printer used for the wire, not just `Display`-ed.
    Error(Sexp),
}

type Task = Rc<dyn Fn(&[Sexp]) -> TaskOutcome>;

/// A registered remote-callable method.
#[derive(Clone)]
pub struct Method {
    /// The name callers address this method by.
    pub name: Symbol,
    /// Optional argument-list spec, returned verbatim by `methods`.
    pub arg_specs: Option<Sexp>,
    /// Optional human-readable description, returned verbatim by `methods`.
    pub docstring: Option<String>,
    task: Task,
}

struct ManagerData {
    title: Option<String>,
    /// Mirrors the base spec's `port` field: true iff this manager was
    /// constructed from an accepted (inbound) connection rather than one
    /// this side initiated.
    accepted: bool,
    connection: Connection,
    methods: RefCell<Vec<Method>>,
    sessions: RefCell<Vec<(u64, Deferred<Sexp>)>>,
    config: Config,
    stopped: Cell<bool>,
}

/// A cheap, cloneable handle to one side of an EPC connection.
#[derive(Clone)]
pub struct Manager(Rc<ManagerData>);

impl CloneRef for Manager {
    fn clone_ref(&self) -> Self {
        self.clone()
    }
}

impl Manager {
    /// Wrap `connection` in a fresh manager, defaulting `config` when not
    /// given. Does *not* wire up the five message handlers -- call
    /// `init_epc_layer` once the manager is ready to start receiving calls.
    pub fn new(connection: Connection, accepted: bool, config: Option<Config>) -> Self {
        let mngr = Manager(Rc::new(ManagerData {
            title: None,
            accepted,
            connection,
            methods: RefCell::new(Vec::new()),
            sessions: RefCell::new(Vec::new()),
            config: config.unwrap_or_default(),
            stopped: Cell::new(false),
        }));
        live_set::insert(&mngr);
        mngr
    }

    /// Optional human-readable title for logging/diagnostics.
    pub fn with_title(self, title: impl Into<String>) -> Self {
        // `Rc::get_mut` only succeeds while we are the sole owner, which we
        // are immediately after `new`; this is meant to be used as a
        // builder step, not after the manager has been shared.
        let mut rc = self.0;
        match Rc::get_mut(&mut rc) {
            Some(data) => data.title = Some(title.into()),
            None => log::warn!("with_title called on an already-shared Manager; ignored"),
        }
        Manager(rc)
    }

    /// True iff this manager was constructed from an accepted connection.
    pub fn accepted(&self) -> bool {
        self.0.accepted
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.0.connection
    }

    /// True iff the underlying connection is not yet closed.
    pub fn live_p(&self) -> bool {
        !self.0.stopped.get() && self.0.connection.state() != crate::connection::State::Closed
    }

    /// Prepend a new method to the registry. Returns the constructed
    /// `Method` (cheap to clone: its task is `Rc`-shared).
    pub fn define_method(
        &self,
        name: impl Into<String>,
        task: impl Fn(&[Sexp]) -> TaskOutcome + 'static,
        arg_specs: Option<Sexp>,
        docstring: Option<String>,
    ) -> Method {
        let method = Method { name: Symbol::new(name.into()), arg_specs, docstring, task: Rc::new(task) };
        self.0.methods.borrow_mut().insert(0, method.clone());
        method
    }

    /// Allocate a uid, register the session, and send `(call uid method
    /// args)`. Returns the deferred that will settle when a matching
    /// `return`/`return-error`/`epc-error` arrives.
    pub fn call_deferred(&self, method: impl Into<String>, args: Vec<Sexp>) -> Deferred<Sexp> {
        let uid = crate::deferred::next_uid();
        let d: Deferred<Sexp> = Deferred::new();
        self.0.sessions.borrow_mut().push((uid, d.clone()));
        log::debug!("[{}] call #{} opened", self.label(), uid);
        let msg = Sexp::List(vec![
            Sexp::symbol("call"),
            Sexp::Int(uid as i64),
            Sexp::symbol(method.into()),
            Sexp::List(args),
        ]);
        if let Err(e) = self.0.connection.send(&msg) {
            log::warn!("[{}] failed to send call #{}: {}", self.label(), uid, e);
            self.remove_session(uid);
            d.post_ng(e);
        }
        d
    }

    /// `sync(call_deferred(method, args))`: block until the reply arrives.
    pub fn call_sync(&self, method: impl Into<String>, args: Vec<Sexp>) -> Result<Sexp, Error> {
        let d = self.call_deferred(method, args);
        sync(self, &d)
    }

    /// Allocate a uid, register the session, and send `(methods uid)`.
    /// Unlike `call_deferred`, this is not a `call` frame: the peer's
    /// `methods` handler replies directly with `(return uid …)`, so the
    /// reply routes back through `handle_return` rather than through the
    /// method registry.
    pub fn query_methods_deferred(&self) -> Deferred<Sexp> {
        let uid = crate::deferred::next_uid();
        let d: Deferred<Sexp> = Deferred::new();
        self.0.sessions.borrow_mut().push((uid, d.clone()));
        log::debug!("[{}] methods query #{} opened", self.label(), uid);
        let msg = Sexp::List(vec![Sexp::symbol("methods"), Sexp::Int(uid as i64)]);
        if let Err(e) = self.0.connection.send(&msg) {
            log::warn!("[{}] failed to send methods query #{}: {}", self.label(), uid, e);
            self.remove_session(uid);
            d.post_ng(e);
        }
        d
    }

    /// `sync(query_methods_deferred())`: block until the reply arrives.
    pub fn query_methods_sync(&self) -> Result<Sexp, Error> {
        let d = self.query_methods_deferred();
        sync(self, &d)
    }

    /// Disconnect, briefly waiting for pending output to drain, and remove
    /// this manager from the live set. Idempotent.
    pub fn stop(&self) {
        if self.0.stopped.replace(true) {
            return; // already stopped
        }
        log::debug!("[{}] stopping", self.label());
        // "Wait briefly for pending socket output": give the transport a
        // last, bounded chance to flush anything already queued before we
        // tear the connection down.
        self.0.connection.poll(self.0.config.stop_drain_budget);
        self.0.connection.disconnect();
        live_set::remove(self);
    }

    fn label(&self) -> &str {
        self.0.title.as_deref().unwrap_or(&self.0.connection.name)
    }

    fn remove_session(&self, uid: u64) -> Option<Deferred<Sexp>> {
        let mut sessions = self.0.sessions.borrow_mut();
        if let Some(pos) = sessions.iter().position(|(id, _)| *id == uid) {
            Some(sessions.remove(pos).1)
        } else {
            None
        }
    }

    fn send_reply(&self, kind: &str, uid: i64, value: Sexp) {
        let msg = Sexp::List(vec![Sexp::symbol(kind), Sexp::Int(uid), value]);
        if let Err(e) = self.0.connection.send(&msg) {
            log::warn!("[{}] failed to send {} reply for #{}: {}", self.label(), kind, uid, e);
        }
    }

    fn handle_call(&self, payload: Sexp) {
        let items = match payload.as_list() {
            Some(items) if items.len() == 3 => items,
            _ => {
                log::warn!("[{}] malformed call message: {:?}", self.label(), payload);
                return;
            }
        };
        let uid = items[0].as_int().unwrap_or(0);
        let name = match items[1].as_symbol() {
            Some(s) => s.clone(),
            None => {
                log::warn!("[{}] malformed call message (method is not a symbol)", self.label());
                return;
            }
        };
        let args: Vec<Sexp> = items[2].as_list().map(|l| l.to_vec()).unwrap_or_default();

        let method = self.0.methods.borrow().iter().find(|m| m.name == name).cloned();
        let method = match method {
            Some(m) => m,
            None => {
                let local_err = Error::NoSuchMethod(name.name().to_owned());
                log::warn!("[{}] {}", self.label(), local_err);
                let msg = format!("EPC-ERROR: No such method : {}", name.name());
                self.send_reply("epc-error", uid, Sexp::Str(msg));
                return;
            }
        };

        log::debug!("[{}] dispatching call #{} to {}", self.label(), uid, name.name());
        match (method.task)(&args) {
            TaskOutcome::Value(v) => self.send_reply("return", uid, v),
            TaskOutcome::Deferred(inner) => {
                let mngr = self.clone();
                inner.next_callback(move |v| {
                    mngr.send_reply("return", uid, v.clone());
                    Outcome::value(v)
                });
            }
            TaskOutcome::Error(err_value) => {
                let msg = format!(
                    "FAILED in {}: {} with ERROR: {}",
                    name.name(),
                    crate::sexp::print(&Sexp::List(args)),
                    crate::sexp::print(&err_value)
                );
                log::warn!("[{}] {}", self.label(), msg);
                self.send_reply("return-error", uid, Sexp::Str(msg));
            }
        }
    }

    fn handle_return(&self, payload: Sexp) {
        let items = match payload.as_list() {
            Some(items) if items.len() == 2 => items,
            _ => return,
        };
        let uid = items[0].as_int().unwrap_or(0) as u64;
        let value = items[1].clone();
        match self.remove_session(uid) {
            Some(d) => {
                log::debug!("[{}] call #{} closed (return)", self.label(), uid);
                d.callback(value);
            }
            None => log::warn!("[{}] return for unknown session #{}, discarded", self.label(), uid),
        }
    }

    fn handle_return_error(&self, payload: Sexp) {
        let items = match payload.as_list() {
            Some(items) if items.len() == 2 => items,
            _ => return,
        };
        let uid = items[0].as_int().unwrap_or(0) as u64;
        let msg = render_message(&items[1]);
        match self.remove_session(uid) {
            Some(d) => {
                log::debug!("[{}] call #{} closed (return-error)", self.label(), uid);
                d.errorback(Error::RemoteError(msg));
            }
            None => log::warn!("[{}] return-error for unknown session #{}, discarded", self.label(), uid),
        }
    }

    fn handle_epc_error(&self, payload: Sexp) {
        let items = match payload.as_list() {
            Some(items) if items.len() == 2 => items,
            _ => return,
        };
        let uid = items[0].as_int().unwrap_or(0) as u64;
        let msg = render_message(&items[1]);
        match self.remove_session(uid) {
            Some(d) => {
                log::debug!("[{}] call #{} closed (epc-error)", self.label(), uid);
                d.errorback(Error::EpcError(msg));
            }
            None => log::warn!("[{}] epc-error for unknown session #{}, discarded", self.label(), uid),
        }
    }

    fn handle_methods(&self, payload: Sexp) {
        let items = match payload.as_list() {
            Some(items) if items.len() == 1 => items,
            _ => return,
        };
        let uid = items[0].as_int().unwrap_or(0);
        let reply: Vec<Sexp> = self
            .0
            .methods
            .borrow()
            .iter()
            .map(|m| {
                Sexp::List(vec![
                    Sexp::Symbol(m.name.clone()),
                    m.arg_specs.clone().unwrap_or_else(Sexp::nil),
                    m.docstring.clone().map(Sexp::Str).unwrap_or_else(Sexp::nil),
                ])
            })
            .collect();
        self.send_reply("return", uid, Sexp::List(reply));
    }
}

fn render_message(v: &Sexp) -> String {
    match v.as_str() {
        Some(s) => s.to_owned(),
        None => crate::sexp::print(v),
    }
}

/// Wire the five message handlers (`call`, `return`, `return-error`,
/// `epc-error`, `methods`) onto `mngr`'s connection channel.
pub fn init_epc_layer(mngr: &Manager) {
    let channel = mngr.connection().channel().clone_ref();

    let m = mngr.clone();
    channel.connect(
        Key::from("call"),
        Some(Box::new(move |payload| {
            m.handle_call(payload);
            Outcome::value(Sexp::nil())
        })),
    );

    let m = mngr.clone();
    channel.connect(
        Key::from("return"),
        Some(Box::new(move |payload| {
            m.handle_return(payload);
            Outcome::value(Sexp::nil())
        })),
    );

    let m = mngr.clone();
    channel.connect(
        Key::from("return-error"),
        Some(Box::new(move |payload| {
            m.handle_return_error(payload);
            Outcome::value(Sexp::nil())
        })),
    );

    let m = mngr.clone();
    channel.connect(
        Key::from("epc-error"),
        Some(Box::new(move |payload| {
            m.handle_epc_error(payload);
            Outcome::value(Sexp::nil())
        })),
    );

    let m = mngr.clone();
    channel.connect(
        Key::from("methods"),
        Some(Box::new(move |payload| {
            m.handle_methods(payload);
            Outcome::value(Sexp::nil())
        })),
    );
}

/// Block the calling thread, pumping `mngr`'s connection, until `d` (or the
/// tail of its chain) settles.
pub fn sync(mngr: &Manager, d: &Deferred<Sexp>) -> Result<Sexp, Error> {
    let tail = d.tail();
    loop {
        if let Some(result) = tail.try_take_result() {
            return result;
        }
        let closed = mngr.0.connection.poll(mngr.0.config.sync_poll_budget);
        crate::deferred::pump_all();
        if closed {
            return tail.try_take_result().unwrap_or(Err(Error::Disconnected));
        }
    }
}

/// Process-wide registry of live managers, mirroring the base spec's
/// "inserted on init, removed on stop" lifecycle.
mod live_set {
    use super::Manager;
    use epc_prelude::Rc;
    use std::cell::RefCell;

    thread_local! {
        static LIVE: RefCell<Vec<*const ()>> = RefCell::new(Vec::new());
    }

    fn ptr(mngr: &Manager) -> *const () {
        Rc::as_ptr(&mngr.0) as *const ()
    }

    pub fn insert(mngr: &Manager) {
        LIVE.with(|l| l.borrow_mut().push(ptr(mngr)));
    }

    pub fn remove(mngr: &Manager) {
        let target = ptr(mngr);
        LIVE.with(|l| l.borrow_mut().retain(|p| *p != target));
    }

    /// Number of managers currently live on this thread. Exposed for tests
    /// and demos; not part of the wire protocol.
    pub fn count() -> usize {
        LIVE.with(|l| l.borrow().len())
    }
}

/// Number of managers currently tracked as live on this thread.
pub fn live_manager_count() -> usize {
    live_set::count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockTransport;
    use crate::connection::Connection;
    use std::time::Duration;

    fn make_pair() -> (Manager, Manager) {
        let (ta, tb) = MockTransport::pair();
        let client_conn = Connection::new("client", Box::new(ta), crate::channel::Channel::new());
        let server_conn = Connection::new("server", Box::new(tb), crate::channel::Channel::new());
        let client = Manager::new(client_conn, false, None);
        let server = Manager::new(server_conn, true, None);
        init_epc_layer(&client);
        init_epc_layer(&server);
        (client, server)
    }

    fn run_until_settled<T>(d: &Deferred<T>, server: &Manager, client: &Manager)
    where
        T: 'static,
    {
        for _ in 0..1000 {
            if d.tail().is_settled() {
                return;
            }
            server.connection().poll(Duration::from_millis(1));
            client.connection().poll(Duration::from_millis(1));
            crate::deferred::pump_all();
        }
        panic!("deferred did not settle in time");
    }

    #[test]
    fn echo_round_trip() {
        crate::deferred::pump_all();
        let (client, server) = make_pair();
        server.define_method(
            "echo",
            |args| TaskOutcome::Value(args.first().cloned().unwrap_or_else(Sexp::nil)),
            None,
            None,
        );

        let d = client.call_deferred("echo", vec![Sexp::Str("hi".into())]);
        run_until_settled(&d, &server, &client);
        assert_eq!(d.tail().try_take_result().unwrap().unwrap(), Sexp::Str("hi".into()));
    }

    #[test]
    fn unknown_method_fails_with_epc_error() {
        crate::deferred::pump_all();
        let (client, server) = make_pair();
        let _ = &server;

        let d = client.call_deferred("nonesuch", vec![]);
        run_until_settled(&d, &server, &client);
        let err = d.tail().try_take_result().unwrap().unwrap_err();
        assert!(err.is_epc_error());
        assert_eq!(format!("{}", err), "EPC-ERROR: No such method : nonesuch");
    }

    #[test]
    fn task_failure_becomes_return_error() {
        crate::deferred::pump_all();
        let (client, server) = make_pair();
        server.define_method("boom", |_args| TaskOutcome::Error(Sexp::Str("bad".into())), None, None);

        let d = client.call_deferred("boom", vec![Sexp::Int(1), Sexp::Int(2)]);
        run_until_settled(&d, &server, &client);
        let err = d.tail().try_take_result().unwrap().unwrap_err();
        assert!(!err.is_epc_error());
        assert_eq!(format!("{}", err), "FAILED in boom: (1 2) with ERROR: \"bad\"");
    }

    #[test]
    fn async_task_resolves_after_its_own_deferred() {
        crate::deferred::pump_all();
        let (client, server) = make_pair();
        server.define_method(
            "later",
            |_args| {
                let inner = Deferred::new();
                inner.post_ok(Sexp::Int(42));
                TaskOutcome::Deferred(inner)
            },
            None,
            None,
        );

        let d = client.call_deferred("later", vec![]);
        run_until_settled(&d, &server, &client);
        assert_eq!(d.tail().try_take_result().unwrap().unwrap(), Sexp::Int(42));
    }

    #[test]
    fn methods_introspection() {
        crate::deferred::pump_all();
        let (client, server) = make_pair();
        server.define_method("echo", |args| TaskOutcome::Value(args.first().cloned().unwrap_or_else(Sexp::nil)), Some(Sexp::symbol("(X)")), Some("echo X".into()));

        let d = client.query_methods_deferred();
        run_until_settled(&d, &server, &client);
        let value = d.tail().try_take_result().unwrap().unwrap();
        assert_eq!(
            value,
            Sexp::List(vec![Sexp::List(vec![Sexp::symbol("echo"), Sexp::symbol("(X)"), Sexp::Str("echo X".into())])])
        );
    }

    #[test]
    fn stop_is_idempotent() {
        crate::deferred::pump_all();
        let (client, server) = make_pair();
        let _ = &server;
        assert!(client.live_p());
        client.stop();
        assert!(!client.live_p());
        client.stop(); // must not panic or double-remove from the live set
        assert!(!client.live_p());
    }

    #[test]
    fn monotonic_uids_across_calls() {
        crate::deferred::pump_all();
        let (client, server) = make_pair();
        server.define_method("echo", |args| TaskOutcome::Value(args.first().cloned().unwrap_or_else(Sexp::nil)), None, None);
        let d1 = client.call_deferred("echo", vec![Sexp::Int(1)]);
        let d2 = client.call_deferred("echo", vec![Sexp::Int(2)]);
        run_until_settled(&d1, &server, &client);
        run_until_settled(&d2, &server, &client);
        assert!(d1.tail().try_take_result().unwrap().is_ok());
        assert!(d2.tail().try_take_result().unwrap().is_ok());
    }
}
