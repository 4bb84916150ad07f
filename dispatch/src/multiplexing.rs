use std::{
	collections::HashMap,
	os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
	sync::{Arc, Condvar, Mutex, PoisonError, RwLock},
	thread::{self, ThreadId},
};

use nix::{
	errno::Errno,
	sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
};

use crate::{DispatchError, DispatchReentrancy, Dispatchable, FdEvents};

/// A [`Dispatchable`] that services many others through one epoll descriptor.
///
/// Each call to [`Dispatchable::dispatch`] services at most one ready child.
/// Sequential children are armed with `EPOLLONESHOT` and additionally guarded
/// by a per-child lock, so two threads never run the same sequential child at
/// once while different children still run in parallel. The registration
/// table has its own lock, distinct from the per-child ones, so a child may add
/// or remove watches from inside its own dispatch.
pub struct MultiplexingDispatchable {
	epoll: Epoll,
	registry: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
	watches: HashMap<u64, Arc<Watch>>,
	tokens: HashMap<RawFd, u64>,
	next_token: u64,
}

struct Watch {
	token: u64,
	fd: RawFd,
	dispatchee: Arc<dyn Dispatchable>,
	reentrancy: DispatchReentrancy,
	interest: EpollFlags,
	exclusive: Mutex<()>,
	tracker: Arc<Tracker>,
}

/// Which threads are inside a watch's dispatch.
///
/// Kept apart from [`Watch`] so a dispatching thread can release its
/// reference to the dispatchee before announcing that it is done.
#[derive(Default)]
struct Tracker {
	activity: Mutex<Activity>,
	idle: Condvar,
}

#[derive(Default)]
struct Activity {
	removed: bool,
	dispatching: Vec<ThreadId>,
}

impl Tracker {
	/// Blocks until no thread other than the caller is dispatching.
	fn wait_idle(&self) {
		let current = thread::current().id();
		let activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
		let _activity = self
			.idle
			.wait_while(activity, |activity| {
				activity.dispatching.iter().any(|id| *id != current)
			})
			.unwrap_or_else(PoisonError::into_inner);
	}
}

/// Marks the current thread as dispatching a watch for as long as it lives.
struct InFlight {
	tracker: Arc<Tracker>,
}

impl Drop for InFlight {
	fn drop(&mut self) {
		let current = thread::current().id();
		let mut activity = self
			.tracker
			.activity
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if let Some(pos) = activity.dispatching.iter().position(|id| *id == current) {
			activity.dispatching.swap_remove(pos);
		}
		drop(activity);
		self.tracker.idle.notify_all();
	}
}

/// Adapts a bare descriptor and callback into a sequential [`Dispatchable`].
struct FdCallback {
	fd: Arc<OwnedFd>,
	callback: Box<dyn Fn() + Send + Sync>,
}

impl Dispatchable for FdCallback {
	fn watch_fd(&self) -> BorrowedFd<'_> {
		self.fd.as_fd()
	}

	fn relevant_events(&self) -> FdEvents {
		FdEvents::READABLE
	}

	fn dispatch(&self, events: FdEvents) -> bool {
		if events.contains(FdEvents::ERROR) {
			return false;
		}
		(self.callback)();
		true
	}
}

impl MultiplexingDispatchable {
	pub fn new() -> Result<Self, DispatchError> {
		let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(DispatchError::Epoll)?;
		Ok(Self {
			epoll,
			registry: RwLock::new(Registry::default()),
		})
	}

	/// Starts watching `dispatchee`.
	///
	/// Fails without side effects if its descriptor is already watched; in
	/// particular no reference to `dispatchee` is retained on failure.
	pub fn add_watch(
		&self,
		dispatchee: &Arc<dyn Dispatchable>,
		reentrancy: DispatchReentrancy,
	) -> Result<(), DispatchError> {
		let fd = dispatchee.watch_fd().as_raw_fd();
		let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
		if registry.tokens.contains_key(&fd) {
			tracing::warn!(fd, "refusing to watch fd twice");
			return Err(DispatchError::AlreadyWatched(fd));
		}
		let token = registry.next_token;
		let interest = epoll_interest(dispatchee.relevant_events(), reentrancy);
		self
			.epoll
			.add(dispatchee.watch_fd(), EpollEvent::new(interest, token))
			.map_err(DispatchError::Epoll)?;
		registry.next_token += 1;
		registry.tokens.insert(fd, token);
		registry.watches.insert(
			token,
			Arc::new(Watch {
				token,
				fd,
				dispatchee: Arc::clone(dispatchee),
				reentrancy,
				interest,
				exclusive: Mutex::new(()),
				tracker: Arc::new(Tracker::default()),
			}),
		);
		tracing::trace!(fd, token, ?reentrancy, "watch added");
		Ok(())
	}

	/// Watches a bare descriptor, running `callback` each time it is readable.
	///
	/// The callback is dispatched sequentially and is responsible for draining
	/// the descriptor.
	pub fn add_fd_watch(
		&self,
		fd: Arc<OwnedFd>,
		callback: impl Fn() + Send + Sync + 'static,
	) -> Result<(), DispatchError> {
		let dispatchee: Arc<dyn Dispatchable> = Arc::new(FdCallback {
			fd,
			callback: Box::new(callback),
		});
		self.add_watch(&dispatchee, DispatchReentrancy::Sequential)
	}

	/// Stops watching `dispatchee`.
	///
	/// Blocks until dispatches of it running on other threads have returned,
	/// so the caller may destroy it as soon as this returns.
	pub fn remove_watch(&self, dispatchee: &dyn Dispatchable) -> Result<(), DispatchError> {
		self.remove_fd_watch(dispatchee.watch_fd().as_raw_fd())
	}

	/// Stops watching whatever was registered for `fd`. Same blocking
	/// guarantees as [`MultiplexingDispatchable::remove_watch`].
	pub fn remove_fd_watch(&self, fd: RawFd) -> Result<(), DispatchError> {
		let watch = {
			let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
			let token = registry
				.tokens
				.get(&fd)
				.copied()
				.ok_or(DispatchError::NotWatched(fd))?;
			self
				.detach(&mut registry, token)
				.ok_or(DispatchError::NotWatched(fd))?
		};
		watch.tracker.wait_idle();
		tracing::trace!(fd, token = watch.token, "watch removed");
		Ok(())
	}

	/// Number of watched sources.
	pub fn len(&self) -> usize {
		self
			.registry
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.watches
			.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Services ready children on the calling thread until none is ready.
	///
	/// Returns how many dispatches were performed.
	pub fn dispatch_pending(&self) -> usize {
		let mut serviced = 0;
		while self.service_one() {
			serviced += 1;
		}
		serviced
	}

	fn detach(&self, registry: &mut Registry, token: u64) -> Option<Arc<Watch>> {
		let watch = registry.watches.remove(&token)?;
		registry.tokens.remove(&watch.fd);
		if let Err(errno) = self.epoll.delete(watch.dispatchee.watch_fd()) {
			tracing::warn!(fd = watch.fd, %errno, "failed to remove fd from epoll set");
		}
		watch
			.tracker
			.activity
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.removed = true;
		Some(watch)
	}

	fn begin_dispatch(&self, token: u64) -> Option<(InFlight, Arc<Watch>)> {
		let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
		let watch = registry.watches.get(&token)?;
		let mut activity = watch
			.tracker
			.activity
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if activity.removed {
			return None;
		}
		activity.dispatching.push(thread::current().id());
		drop(activity);
		let in_flight = InFlight {
			tracker: Arc::clone(&watch.tracker),
		};
		Some((in_flight, Arc::clone(watch)))
	}

	fn rearm(&self, watch: &Watch) {
		let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
		if !registry.watches.contains_key(&watch.token) {
			return;
		}
		let mut event = EpollEvent::new(watch.interest, watch.token);
		if let Err(errno) = self.epoll.modify(watch.dispatchee.watch_fd(), &mut event) {
			tracing::error!(fd = watch.fd, %errno, "failed to rearm watch");
		}
	}

	/// Dispatches one ready child, if any. Returns whether one was ready.
	fn service_one(&self) -> bool {
		let mut ready = [EpollEvent::empty()];
		match self.epoll.wait(&mut ready, EpollTimeout::ZERO) {
			Ok(0) | Err(Errno::EINTR) => return false,
			Ok(_) => {}
			Err(errno) => {
				tracing::error!(%errno, "failed to poll watched fds");
				return false;
			}
		}
		let token = ready[0].data();
		let Some((in_flight, watch)) = self.begin_dispatch(token) else {
			// Removed between readiness and lookup.
			return true;
		};
		let events = fd_events(ready[0].events());
		let keep_watching = match watch.reentrancy {
			DispatchReentrancy::Sequential => {
				let _rearm = RearmOnUnwind {
					reactor: self,
					watch: &watch,
				};
				let _exclusive = watch.exclusive.lock().unwrap_or_else(PoisonError::into_inner);
				watch.dispatchee.dispatch(events)
			}
			DispatchReentrancy::Reentrant => watch.dispatchee.dispatch(events),
		};
		if !keep_watching {
			let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
			if self.detach(&mut registry, watch.token).is_some() {
				tracing::trace!(fd = watch.fd, "dispatchee asked to be unwatched");
			}
		} else if watch.reentrancy == DispatchReentrancy::Sequential {
			self.rearm(&watch);
		}
		// A remover may be waiting to drop the last reference to the dispatchee.
		drop(watch);
		drop(in_flight);
		true
	}
}

/// Rearms a sequential watch if its dispatch panics.
struct RearmOnUnwind<'a> {
	reactor: &'a MultiplexingDispatchable,
	watch: &'a Watch,
}

impl Drop for RearmOnUnwind<'_> {
	fn drop(&mut self) {
		if thread::panicking() {
			self.reactor.rearm(self.watch);
		}
	}
}

impl Dispatchable for MultiplexingDispatchable {
	fn watch_fd(&self) -> BorrowedFd<'_> {
		self.epoll.0.as_fd()
	}

	fn relevant_events(&self) -> FdEvents {
		FdEvents::READABLE
	}

	fn dispatch(&self, _events: FdEvents) -> bool {
		self.service_one();
		true
	}
}

fn epoll_interest(events: FdEvents, reentrancy: DispatchReentrancy) -> EpollFlags {
	let mut flags = EpollFlags::empty();
	if events.contains(FdEvents::READABLE) {
		flags |= EpollFlags::EPOLLIN;
	}
	if events.contains(FdEvents::WRITABLE) {
		flags |= EpollFlags::EPOLLOUT;
	}
	if events.contains(FdEvents::REMOTE_CLOSED) {
		flags |= EpollFlags::EPOLLRDHUP;
	}
	if events.contains(FdEvents::ERROR) {
		flags |= EpollFlags::EPOLLERR;
	}
	if reentrancy == DispatchReentrancy::Sequential {
		flags |= EpollFlags::EPOLLONESHOT;
	}
	flags
}

fn fd_events(flags: EpollFlags) -> FdEvents {
	let mut events = FdEvents::empty();
	if flags.contains(EpollFlags::EPOLLIN) {
		events |= FdEvents::READABLE;
	}
	if flags.contains(EpollFlags::EPOLLOUT) {
		events |= FdEvents::WRITABLE;
	}
	if flags.intersects(EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP) {
		events |= FdEvents::REMOTE_CLOSED;
	}
	if flags.contains(EpollFlags::EPOLLERR) {
		events |= FdEvents::ERROR;
	}
	events
}
