//! The deferred/continuation engine.
//!
//! A `Deferred<T>` is a single-assignment continuation cell with separate
//! success (`ok`) and failure (`ng`) paths. Chains form a singly linked
//! list; resolving the head forwards the value down the chain one hop at a
//! time, each hop running on the process-wide post-queue rather than by
//! direct recursive call, so a long chain never grows the call stack.
//!
//! This mirrors the teacher's single-threaded cooperative executor: nothing
//! here is `Send`, and nothing needs to be -- every `Deferred` is created,
//! resolved and read back on the one thread that drives the post queue via
//! `pump_once`/`pump_all`.

use epc_prelude::*;

use crate::error::Error;

use std::cell::Cell;
use std::collections::VecDeque;

/// What a callback or errorback produced.
pub enum Outcome<T> {
    /// A plain value: settles the node directly (or forwards to `next`).
    Value(T),
    /// A failure: settles the node along the `ng` path (or forwards to `next`).
    Error(Error),
    /// A nested deferred: this node's settlement is deferred until `r`
    /// itself settles. If this node has a `next`, it is spliced onto `r`'s
    /// tail so the chain keeps flowing once `r` resolves.
    Deferred(Deferred<T>),
}

impl<T> Outcome<T> {
    /// Convenience constructor for the common "just return a value" case.
    pub fn value(v: T) -> Self {
        Outcome::Value(v)
    }
}

type CallbackFn<T> = Box<dyn FnOnce(T) -> Outcome<T>>;
type ErrorbackFn<T> = Box<dyn FnOnce(Error) -> Outcome<T>>;

/// What a node settled to. `Unset` nodes forward through `next` instead of
/// holding a value of their own.
enum Resolution<T> {
    Unset,
    Ok(T),
    Ng(Error),
}

struct Inner<T> {
    callback: Option<CallbackFn<T>>,
    errorback: Option<ErrorbackFn<T>>,
    next: Option<Deferred<T>>,
    resolution: Resolution<T>,
}

/// A single node in a deferred chain.
///
/// Cloning a `Deferred` clones the handle (an `Rc`), not the node; use this
/// to hold onto the same node from multiple places (e.g. a session table
/// and a caller's return value).
pub struct Deferred<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred { inner: self.inner.clone() }
    }
}

impl<T> CloneRef for Deferred<T> {
    fn clone_ref(&self) -> Self {
        self.clone()
    }
}

impl<T: 'static> Deferred<T> {
    /// Create a bare node with no callback installed (the default callback
    /// is identity, the default errorback re-raises -- both are expressed
    /// here simply as "no transform", see module docs).
    pub fn new() -> Self {
        Deferred {
            inner: Rc::new(RefCell::new(Inner {
                callback: None,
                errorback: None,
                next: None,
                resolution: Resolution::Unset,
            })),
        }
    }

    /// Create a node whose success path runs `f`.
    pub fn new_with_callback(f: impl FnOnce(T) -> Outcome<T> + 'static) -> Self {
        let d = Self::new();
        d.inner.borrow_mut().callback = Some(Box::new(f));
        d
    }

    /// Synchronously execute this node along the `ok` path with `arg`.
    pub fn callback(&self, arg: T) {
        run(self.clone(), Arg::Ok(arg));
    }

    /// Synchronously execute this node along the `ng` path with `arg`.
    pub fn errorback(&self, arg: Error) {
        run(self.clone(), Arg::Ng(arg));
    }

    /// Enqueue `(self, which, arg)` for execution by the next tick.
    pub fn post_ok(&self, arg: T) {
        post(self.clone(), Arg::Ok(arg));
    }

    /// Enqueue `(self, which, arg)` for execution by the next tick.
    pub fn post_ng(&self, arg: Error) {
        post(self.clone(), Arg::Ng(arg));
    }

    /// Create a new node `d'` whose success path runs `f`, and link it as
    /// this node's `next`. If this node has already settled, the stored
    /// value/error is immediately propagated into `d'`.
    pub fn next_callback(&self, f: impl FnOnce(T) -> Outcome<T> + 'static) -> Deferred<T> {
        let next = Deferred::new_with_callback(f);
        set_next(self, next.clone());
        next
    }

    /// Create a new node `d'` whose failure path runs `f` (the success path
    /// passes its value straight through unchanged), and link it as this
    /// node's `next`.
    pub fn next_errorback(&self, f: impl FnOnce(Error) -> Outcome<T> + 'static) -> Deferred<T> {
        let next = Deferred::new();
        next.inner.borrow_mut().errorback = Some(Box::new(f));
        set_next(self, next.clone());
        next
    }

    /// Reset callbacks to their defaults and drop the forward link. Does
    /// not notify a remote peer; an in-flight call whose deferred is
    /// cancelled simply has its late reply logged and discarded.
    pub fn cancel(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.callback = None;
        inner.errorback = None;
        inner.next = None;
    }

    /// The node at the current end of this chain (the one whose `next` is
    /// still unset). Computed fresh each call since the chain may grow.
    pub fn tail(&self) -> Deferred<T> {
        let next = self.inner.borrow().next.clone();
        match next {
            Some(n) => n.tail(),
            None => self.clone(),
        }
    }

    /// True if this node has settled, without consuming the resolution.
    /// Safe to call repeatedly, e.g. from a polling loop that only later
    /// calls `try_take_result` once to extract the value.
    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().resolution, Resolution::Unset)
    }

    /// If this node has settled, take and return its resolution, leaving
    /// the node itself `Unset` behind (it is not expected to settle
    /// twice, so this is purely a read in practice).
    pub fn try_take_result(&self) -> Option<Result<T, Error>> {
        let mut inner = self.inner.borrow_mut();
        match std::mem::replace(&mut inner.resolution, Resolution::Unset) {
            Resolution::Unset => None,
            Resolution::Ok(v) => Some(Ok(v)),
            Resolution::Ng(e) => Some(Err(e)),
        }
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum Arg<T> {
    Ok(T),
    Ng(Error),
}

/// Splice `next` onto `prev`. If `prev` already settled, immediately (not
/// via the post queue) runs `next` with the stored value/error.
fn set_next<T: 'static>(prev: &Deferred<T>, next: Deferred<T>) {
    let prior = {
        let mut inner = prev.inner.borrow_mut();
        inner.next = Some(next.clone());
        match std::mem::replace(&mut inner.resolution, Resolution::Unset) {
            Resolution::Unset => None,
            Resolution::Ok(v) => Some(Arg::Ok(v)),
            Resolution::Ng(e) => Some(Arg::Ng(e)),
        }
    };
    if let Some(arg) = prior {
        run(next, arg);
    }
}

/// The execution rule (spec section 4.1): select a handler, run it, and
/// either settle this node or forward to `next`.
fn run<T: 'static>(d: Deferred<T>, arg: Arg<T>) {
    let maybe_handler = {
        let mut inner = d.inner.borrow_mut();
        match &arg {
            Arg::Ok(_) => inner.callback.take().map(Handler::Ok),
            Arg::Ng(_) => inner.errorback.take().map(Handler::Ng),
        }
    };

    let handler = match maybe_handler {
        Some(h) => h,
        None => {
            // No transform installed: forward immediately (not posted) to
            // `next` if present, otherwise this node's resolution *is* the
            // identity/re-raise default, so just store it.
            let next = d.inner.borrow_mut().next.take();
            match next {
                Some(n) => run(n, arg),
                None => settle(&d, arg),
            }
            return;
        }
    };

    let outcome = match (handler, arg) {
        (Handler::Ok(f), Arg::Ok(v)) => f(v),
        (Handler::Ng(f), Arg::Ng(e)) => f(e),
        _ => unreachable!("handler and arg are selected from the same `which`"),
    };

    match outcome {
        Outcome::Deferred(inner_d) => {
            let next = d.inner.borrow_mut().next.take();
            if let Some(n) = next {
                set_next(&inner_d, n);
            }
            // `d` itself stays unset: its settlement now flows through `inner_d`.
        }
        Outcome::Value(v) => {
            let next = d.inner.borrow_mut().next.take();
            match next {
                Some(n) => post(n, Arg::Ok(v)),
                None => d.inner.borrow_mut().resolution = Resolution::Ok(v),
            }
        }
        Outcome::Error(e) => {
            let next = d.inner.borrow_mut().next.take();
            match next {
                Some(n) => post(n, Arg::Ng(e)),
                None => {
                    log::warn!("unhandled deferred error, swallowed at chain end: {}", e);
                    d.inner.borrow_mut().resolution = Resolution::Ng(e);
                }
            }
        }
    }
}

fn settle<T>(d: &Deferred<T>, arg: Arg<T>) {
    let mut inner = d.inner.borrow_mut();
    match arg {
        Arg::Ok(v) => inner.resolution = Resolution::Ok(v),
        Arg::Ng(e) => {
            log::warn!("unhandled deferred error, swallowed at chain end: {}", e);
            inner.resolution = Resolution::Ng(e);
        }
    }
}

enum Handler<T> {
    Ok(CallbackFn<T>),
    Ng(ErrorbackFn<T>),
}

// =================
// === Post queue ===
// =================

/// A single deferred-chain node together with its pending arg, type-erased
/// so the process-wide queue can hold jobs for any `T`.
type Job = Box<dyn FnOnce()>;

thread_local! {
    static QUEUE: RefCell<VecDeque<Job>> = RefCell::new(VecDeque::new());
    static NEXT_UID: Cell<u64> = Cell::new(1);
}

fn post<T: 'static>(d: Deferred<T>, arg: Arg<T>) {
    log::trace!("post: enqueueing one post-queue entry");
    QUEUE.with(|q| q.borrow_mut().push_back(Box::new(move || run(d, arg))));
}

/// Run exactly one queued entry, if any is present. This is "one tick".
/// Returns whether an entry was actually run.
pub fn pump_once() -> bool {
    let job = QUEUE.with(|q| q.borrow_mut().pop_front());
    match job {
        Some(job) => {
            log::trace!("tick: running one post-queue entry");
            job();
            true
        }
        None => false,
    }
}

/// Drain every entry currently in the queue (including ones posted by jobs
/// run during this call), returning how many ran.
///
/// Used by `sync` (crate::manager), which wants to make guaranteed forward
/// progress while it is blocking a thread, rather than the steady one-per-
/// tick cadence a running event loop uses via `pump_once`.
pub fn pump_all() -> usize {
    let mut n = 0;
    while pump_once() {
        n += 1;
    }
    n
}

/// True if the queue currently holds no entries.
pub fn is_empty() -> bool {
    QUEUE.with(|q| q.borrow().is_empty())
}

/// Allocate the next call uid. Monotonically increasing for the lifetime of
/// the process (or, concretely, the thread this engine is run on).
pub fn next_uid() -> u64 {
    NEXT_UID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_test_queue() {
        // Tests on different threads would each get their own thread-local
        // queue; drain whatever is on this one before/after each test body
        // to avoid cross-test interference within a single thread.
        pump_all();
    }

    #[test]
    fn immediate_callback_runs_synchronously() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new_with_callback(|v| Outcome::value(v + 1));
        d.callback(41);
        assert_eq!(d.try_take_result().unwrap().unwrap(), 42);
    }

    #[test]
    fn chain_associativity() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new();
        let tail = d.next_callback(|v| Outcome::value(v + 1)).next_callback(|v| Outcome::value(v * 2));
        d.callback(3);
        pump_all();
        assert_eq!(tail.try_take_result().unwrap().unwrap(), (3 + 1) * 2);
    }

    #[test]
    fn chain_flattens_nested_deferred() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new();
        let tail = d.next_callback(|v| {
            let inner = Deferred::new();
            inner.post_ok(v + 1);
            Outcome::Deferred(inner)
        });
        d.callback(10);
        pump_all();
        assert_eq!(tail.try_take_result().unwrap().unwrap(), 11);
    }

    #[test]
    fn late_chain_attach_propagates_already_resolved_value() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new();
        d.callback(7); // resolves d since it has no `next` yet
        let tail = d.next_callback(|v| Outcome::value(v * 10));
        pump_all();
        assert_eq!(tail.try_take_result().unwrap().unwrap(), 70);
    }

    #[test]
    fn error_forwards_down_the_chain() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new();
        let tail = d.next_callback(|v| Outcome::value(v + 1));
        d.errorback(Error::RemoteError("boom".into()));
        pump_all();
        let result = tail.try_take_result().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn errorback_recovers_into_success() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new();
        let tail = d.next_errorback(|_e| Outcome::value(-1));
        d.errorback(Error::RemoteError("boom".into()));
        pump_all();
        assert_eq!(tail.try_take_result().unwrap().unwrap(), -1);
    }

    #[test]
    fn cancel_drops_forward_link() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new();
        let tail = d.next_callback(|v| Outcome::value(v + 1));
        d.cancel();
        d.callback(5);
        pump_all();
        // Cancelled: d settles on its own since `next` was cleared.
        assert_eq!(d.try_take_result().unwrap().unwrap(), 5);
        assert!(tail.try_take_result().is_none());
    }

    #[test]
    fn post_does_not_run_synchronously() {
        drain_test_queue();
        let d: Deferred<i32> = Deferred::new();
        d.post_ok(1);
        assert!(d.try_take_result().is_none(), "post must not run before the next tick");
        pump_all();
        assert_eq!(d.try_take_result().unwrap().unwrap(), 1);
    }

    #[test]
    fn uids_are_monotonic() {
        let a = next_uid();
        let b = next_uid();
        assert!(b > a);
    }
}
