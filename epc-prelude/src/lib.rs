//! Common imports shared by every crate in this workspace.
//!
//! Mirrors the small, dependency-light prelude pattern used throughout this
//! codebase: rather than repeating `use std::rc::Rc` / `use std::cell::RefCell`
//! everywhere, downstream crates do `use epc_prelude::*` and get the handful
//! of things that show up on almost every page.

pub use std::rc::Rc;
pub use std::rc::Weak;
pub use std::cell::RefCell;
pub use std::cell::Cell;
pub use std::fmt;
pub use std::fmt::Debug;
pub use std::fmt::Display;

pub use failure::Fail;
pub use failure::Error;

/// Shorthand for `Default::default()`, handy at the end of a `..default()`
/// struct-update expression.
pub fn default<T: Default>() -> T {
    Default::default()
}

/// Anything that can be cheaply viewed as a string slice.
///
/// Implemented for the usual suspects so APIs can accept `&str`, `String` or
/// `&String` without forcing the caller to pick one.
pub trait Str {
    /// Borrow `self` as a string slice.
    fn as_str(&self) -> &str;
}

impl Str for str {
    fn as_str(&self) -> &str { self }
}

impl Str for String {
    fn as_str(&self) -> &str { self.as_str() }
}

impl<'a, T: Str + ?Sized> Str for &'a T {
    fn as_str(&self) -> &str { (*self).as_str() }
}

/// Types that can be cloned without copying their payload, such as reference
/// counted handles. Used to signal at call sites that a `.clone_ref()` is
/// cheap (pointer bump) where a plain `.clone()` might be mistaken for a deep
/// copy.
pub trait CloneRef {
    /// Clone the handle, not the data it points to.
    fn clone_ref(&self) -> Self;
}

impl<T> CloneRef for Rc<T> {
    fn clone_ref(&self) -> Self { self.clone() }
}

impl<T> CloneRef for Weak<T> {
    fn clone_ref(&self) -> Self { self.clone() }
}
