//! Per-connection event-symbol to observer-list registry.
//!
//! Grounded in the teacher's `json_rpc::Transport`/`TransportEvent` split:
//! there, a transport hands raw events to a single `mpsc` sender; here, a
//! `Connection` hands decoded messages to potentially several observers,
//! keyed by the message's leading event symbol, with a wildcard observer
//! that sees everything (used by `Manager::init_epc_layer` to bind its five
//! handlers in one pass).

use epc_prelude::*;

use crate::deferred::Deferred;
use crate::sexp::{Sexp, Symbol};

/// An event key: either a specific symbol, or the wildcard that matches any
/// event.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Key {
    /// Matches only events with this exact symbol.
    Event(Symbol),
    /// Matches every event.
    Any,
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Event(Symbol::new(name))
    }
}

struct Observer {
    key: Key,
    deferred: Deferred<Sexp>,
}

/// An append-only registry of `(event_symbol, deferred)` pairs.
#[derive(Clone)]
pub struct Channel {
    observers: Rc<RefCell<Vec<Observer>>>,
}

impl CloneRef for Channel {
    fn clone_ref(&self) -> Self {
        self.clone()
    }
}

impl Channel {
    /// A channel with no observers yet.
    pub fn new() -> Self {
        Channel { observers: Rc::new(RefCell::new(Vec::new())) }
    }

    /// Register a new observer for `key`, returning its deferred for
    /// further chaining. `callback`, if given, is installed as the
    /// deferred's success handler up front.
    pub fn connect(&self, key: Key, callback: Option<Box<dyn FnOnce(Sexp) -> crate::deferred::Outcome<Sexp>>>) -> Deferred<Sexp> {
        let deferred = match callback {
            Some(f) => Deferred::new_with_callback(f),
            None => Deferred::new(),
        };
        self.observers.borrow_mut().push(Observer { key, deferred: deferred.clone() });
        deferred
    }

    /// Post `event` onto every observer whose key matches `event_symbol` or
    /// is the wildcard, in registration order. Posting, not executing,
    /// means observers of distinct events may interleave through the post
    /// queue -- only observers of the *same* event are guaranteed to run in
    /// registration order relative to each other.
    pub fn send(&self, event_symbol: &Symbol, payload: Sexp) {
        let matches: Vec<Deferred<Sexp>> = self
            .observers
            .borrow()
            .iter()
            .filter(|o| match &o.key {
                Key::Any => true,
                Key::Event(s) => s == event_symbol,
            })
            .map(|o| o.deferred.clone())
            .collect();
        for d in matches {
            let event = Sexp::List(vec![Sexp::Symbol(event_symbol.clone()), payload.clone()]);
            d.post_ok(event);
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}
