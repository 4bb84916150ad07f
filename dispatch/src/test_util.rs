use std::{
	os::fd::{AsFd, BorrowedFd},
	time::{Duration, Instant},
};

use nix::{
	errno::Errno,
	poll::{PollFd, PollFlags, PollTimeout, poll},
	sys::eventfd::{EfdFlags, EventFd},
};

use crate::{Dispatchable, FdEvents};

pub fn fd_is_readable(fd: BorrowedFd<'_>) -> bool {
	let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
	matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
}

pub fn fd_becomes_readable(fd: BorrowedFd<'_>, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
		match poll(&mut fds, PollTimeout::from(10u16)) {
			Ok(n) if n > 0 => return true,
			Ok(_) | Err(Errno::EINTR) => continue,
			Err(_) => return false,
		}
	}
	false
}

/// Eventfd-backed source that runs a callback once per trigger.
pub struct TestDispatchable {
	event_fd: EventFd,
	callback: Box<dyn Fn() + Send + Sync>,
	keep_watching: bool,
}

impl TestDispatchable {
	pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
		Self {
			event_fd: EventFd::from_value_and_flags(
				0,
				EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE,
			)
			.unwrap(),
			callback: Box::new(callback),
			keep_watching: true,
		}
	}

	/// Source that asks to be unwatched after its first dispatch.
	pub fn one_shot(callback: impl Fn() + Send + Sync + 'static) -> Self {
		Self {
			keep_watching: false,
			..Self::new(callback)
		}
	}

	pub fn trigger(&self) {
		self.event_fd.write(1).unwrap();
	}
}

impl Dispatchable for TestDispatchable {
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
		if self.event_fd.read().is_ok() {
			(self.callback)();
		}
		self.keep_watching
	}
}
