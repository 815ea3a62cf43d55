//! File watch dispatcher.
//!
//! Changed paths arrive on a channel (fed by [`FsObserver`] in production and
//! directly by tests), are debounced per path, matched against each
//! [`WatchRule`]'s globs, and dispatched to the rule's targets without waiting
//! for them to finish.

pub mod debounce;
pub mod dispatcher;
pub mod observer;
pub mod rule;

pub use debounce::Debouncer;
pub use dispatcher::WatchDispatcher;
pub use observer::FsObserver;
pub use rule::{compile_globs, WatchRule, WatchTarget};
