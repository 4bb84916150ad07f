use std::{
	collections::VecDeque,
	os::fd::{AsFd, BorrowedFd},
	sync::{Mutex, PoisonError},
};

use nix::{
	errno::Errno,
	sys::eventfd::{EfdFlags, EventFd},
};

use crate::{DispatchError, Dispatchable, FdEvents};

type Action = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of trying to take one unit from the readiness counter.
enum Consumed {
	Ready,
	/// Another dispatcher took the unit first.
	NotReady,
	Failed(Errno),
}

/// FIFO of deferred closures exposed as a [`Dispatchable`].
///
/// Every enqueued action adds one to a semaphore eventfd, so `n` enqueues need
/// `n` dispatches to drain. Each dispatch runs at most one action.
pub struct ActionQueue {
	event_fd: EventFd,
	actions: Mutex<VecDeque<Action>>,
}

impl ActionQueue {
	pub fn new() -> Result<Self, DispatchError> {
		let event_fd = EventFd::from_value_and_flags(
			0,
			EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE,
		)
		.map_err(DispatchError::EventFd)?;
		Ok(Self {
			event_fd,
			actions: Mutex::new(VecDeque::new()),
		})
	}

	pub fn enqueue(&self, action: impl FnOnce() + Send + 'static) {
		let mut actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
		actions.push_back(Box::new(action));
		if let Err(errno) = self.event_fd.write(1) {
			// The counter only refuses writes on overflow; keep queue and counter in step.
			actions.pop_back();
			tracing::error!(%errno, "failed to signal action queue, dropping action");
		}
	}

	/// Number of actions waiting to run.
	pub fn len(&self) -> usize {
		self.actions.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn consume(&self) -> Consumed {
		match self.event_fd.read() {
			Ok(_) => Consumed::Ready,
			Err(Errno::EAGAIN) => Consumed::NotReady,
			Err(errno) => Consumed::Failed(errno),
		}
	}
}

impl Dispatchable for ActionQueue {
	fn watch_fd(&self) -> BorrowedFd<'_> {
		self.event_fd.as_fd()
	}

	fn relevant_events(&self) -> FdEvents {
		FdEvents::READABLE
	}

	fn dispatch(&self, events: FdEvents) -> bool {
		if events.contains(FdEvents::ERROR) {
			return false;
		}
		match self.consume() {
			Consumed::Ready => {}
			Consumed::NotReady => return true,
			Consumed::Failed(errno) => {
				tracing::error!(%errno, "failed to consume action queue readiness");
				return false;
			}
		}
		let action = self
			.actions
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.pop_front();
		if let Some(action) = action {
			action();
		}
		true
	}
}
