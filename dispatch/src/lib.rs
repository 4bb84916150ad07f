//! Readiness-driven dispatch primitives for the shift input stack.
//!
//! Everything here revolves around [`Dispatchable`]: a source with a pollable
//! file descriptor and a `dispatch` operation that consumes one unit of
//! readiness. [`MultiplexingDispatchable`] aggregates many of them behind one
//! epoll fd, [`ActionQueue`] turns deferred closures into such a source, and
//! [`ThreadedDispatcher`] drives any of them from a pool of worker threads.

mod action_queue;
mod error;
mod multiplexing;
mod signal_blocker;
mod threaded;

#[cfg(test)]
mod test_util;

use std::os::fd::BorrowedFd;

pub use action_queue::ActionQueue;
pub use error::{DispatchError, FatalDispatchError};
pub use multiplexing::MultiplexingDispatchable;
pub use signal_blocker::SignalBlocker;
pub use threaded::{FatalHandler, ThreadedDispatcher};

bitflags::bitflags! {
	/// Readiness kinds a [`Dispatchable`] may care about or be woken with.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct FdEvents: u32 {
		const READABLE = 1 << 0;
		const WRITABLE = 1 << 1;
		const REMOTE_CLOSED = 1 << 2;
		const ERROR = 1 << 3;
	}
}

/// Whether a single source may be serviced by more than one thread at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReentrancy {
	/// At most one dispatch of the source is in flight at any instant.
	Sequential,
	/// Any number of threads may dispatch the source concurrently.
	Reentrant,
}

/// A pollable event source.
pub trait Dispatchable: Send + Sync {
	/// The descriptor that becomes ready when [`Dispatchable::dispatch`] has work.
	fn watch_fd(&self) -> BorrowedFd<'_>;

	/// Readiness kinds this source wants to be woken for.
	fn relevant_events(&self) -> FdEvents;

	/// Consumes one unit of readiness.
	///
	/// Returning `false` asks the owner to stop watching this source. It is
	/// not an error.
	fn dispatch(&self, events: FdEvents) -> bool;
}
