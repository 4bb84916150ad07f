use std::{
	any::Any,
	collections::HashMap,
	os::fd::{AsFd, BorrowedFd},
	panic::{self, AssertUnwindSafe},
	sync::{
		Arc, Condvar, Mutex, PoisonError,
		atomic::{AtomicBool, Ordering},
	},
	thread::{self, JoinHandle, ThreadId},
	time::Duration,
};

use nix::{
	errno::Errno,
	poll::{PollFd, PollFlags, PollTimeout, poll},
	sys::eventfd::{EfdFlags, EventFd},
};

use crate::{
	DispatchError, DispatchReentrancy, Dispatchable, FatalDispatchError, FdEvents,
	MultiplexingDispatchable, SignalBlocker,
};

/// Receives failures that escaped a worker's dispatch loop.
pub type FatalHandler = Arc<dyn Fn(FatalDispatchError) + Send + Sync>;

/// How long `remove_thread` waits for some worker to notice a shutdown request.
/// Workers may be stuck in callbacks we don't control.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Drives a [`Dispatchable`] from a resizable pool of worker threads.
pub struct ThreadedDispatcher {
	name: String,
	shutdown: Arc<ShutdownRequests>,
	dispatcher: Arc<MultiplexingDispatchable>,
	fatal_handler: FatalHandler,
	threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedDispatcher {
	/// Creates a pool with one worker whose fatal failures abort the process.
	pub fn new(name: impl Into<String>, target: Arc<dyn Dispatchable>) -> Result<Self, DispatchError> {
		Self::with_fatal_handler(name, target, Arc::new(abort_on_fatal))
	}

	/// Creates a pool with one worker, routing fatal failures to `fatal_handler`.
	pub fn with_fatal_handler(
		name: impl Into<String>,
		target: Arc<dyn Dispatchable>,
		fatal_handler: FatalHandler,
	) -> Result<Self, DispatchError> {
		let shutdown = Arc::new(ShutdownRequests::new()?);
		let dispatcher = Arc::new(MultiplexingDispatchable::new()?);
		// Exactly one thread may take each shutdown request.
		dispatcher.add_watch(
			&(Arc::clone(&shutdown) as Arc<dyn Dispatchable>),
			DispatchReentrancy::Sequential,
		)?;
		dispatcher.add_watch(&target, DispatchReentrancy::Reentrant)?;

		let pool = Self {
			name: name.into(),
			shutdown,
			dispatcher,
			fatal_handler,
			threads: Mutex::new(Vec::new()),
		};
		pool.add_thread()?;
		Ok(pool)
	}

	#[tracing::instrument(skip(self), fields(pool = %self.name))]
	pub fn add_thread(&self) -> Result<(), DispatchError> {
		let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
		let _blocker = SignalBlocker::new();
		let shutdown = Arc::clone(&self.shutdown);
		let dispatcher = Arc::clone(&self.dispatcher);
		let fatal_handler = Arc::clone(&self.fatal_handler);
		let handle = thread::Builder::new()
			.name(self.name.clone())
			.spawn(move || dispatch_loop(shutdown, dispatcher, fatal_handler))?;
		threads.push(handle);
		tracing::debug!(threads = threads.len(), "dispatch thread added");
		Ok(())
	}

	/// Stops one worker once its current dispatch returns, and joins it.
	#[tracing::instrument(skip(self), fields(pool = %self.name))]
	pub fn remove_thread(&self) -> Result<(), DispatchError> {
		{
			let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
			self.reap(&mut threads);
			if threads.is_empty() {
				return Err(DispatchError::NoThreads);
			}
		}
		let stopped = self.shutdown.terminate_one(SHUTDOWN_ACK_TIMEOUT)?;

		let handle = {
			let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
			threads
				.iter()
				.position(|handle| handle.thread().id() == stopped)
				.map(|pos| threads.swap_remove(pos))
		};
		match handle {
			Some(handle) => {
				if handle.join().is_err() {
					tracing::warn!("dispatch thread panicked while exiting");
				}
			}
			None => tracing::warn!(?stopped, "stopped thread does not belong to this pool"),
		}
		tracing::debug!(threads = self.thread_count(), "dispatch thread removed");
		Ok(())
	}

	/// Workers still running; ones that died from a fatal error are not counted.
	pub fn thread_count(&self) -> usize {
		let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
		self.reap(&mut threads);
		threads.len()
	}

	/// Joins workers whose dispatch loop ended without a shutdown request.
	fn reap(&self, threads: &mut Vec<JoinHandle<()>>) {
		for crashed in self.shutdown.take_crashed() {
			let Some(pos) = threads.iter().position(|handle| handle.thread().id() == crashed) else {
				continue;
			};
			if threads.swap_remove(pos).join().is_err() {
				tracing::warn!(pool = %self.name, "dispatch thread panicked while exiting");
			}
			tracing::debug!(pool = %self.name, ?crashed, "reaped dead dispatch thread");
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

impl Drop for ThreadedDispatcher {
	fn drop(&mut self) {
		let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
		self.shutdown.terminate_all();

		let current = thread::current().id();
		for handle in threads.drain(..) {
			if handle.thread().id() == current {
				tracing::error!(
					pool = %self.name,
					"dispatcher dropped from inside its own dispatch callback; detaching the thread"
				);
				continue;
			}
			if handle.join().is_err() {
				tracing::warn!(pool = %self.name, "dispatch thread panicked while exiting");
			}
		}
	}
}

fn abort_on_fatal(error: FatalDispatchError) {
	tracing::error!(%error, "fatal error in dispatch thread");
	std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

fn dispatch_loop(
	shutdown: Arc<ShutdownRequests>,
	dispatcher: Arc<MultiplexingDispatchable>,
	fatal_handler: FatalHandler,
) {
	let running = Arc::new(AtomicBool::new(true));
	let _registration = Registration::new(Arc::clone(&shutdown), Arc::clone(&running));

	let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), Errno> {
		while running.load(Ordering::Acquire) {
			let mut fds = [PollFd::new(dispatcher.watch_fd(), PollFlags::POLLIN)];
			match poll(&mut fds, PollTimeout::NONE) {
				Ok(_) => {}
				Err(Errno::EINTR) => continue,
				Err(errno) => return Err(errno),
			}
			dispatcher.dispatch(FdEvents::READABLE);
		}
		Ok(())
	}));

	let thread = thread::current().name().unwrap_or("<unnamed>").to_string();
	match outcome {
		Ok(Ok(())) => tracing::trace!(%thread, "dispatch thread exiting"),
		Ok(Err(errno)) => fatal_handler(FatalDispatchError::Poll { thread, errno }),
		Err(payload) => fatal_handler(FatalDispatchError::Panic {
			thread,
			message: panic_message(payload.as_ref()),
		}),
	}
}

/// Keeps a worker registered with the shutdown source while it runs.
struct Registration {
	shutdown: Arc<ShutdownRequests>,
	running: Arc<AtomicBool>,
}

impl Registration {
	fn new(shutdown: Arc<ShutdownRequests>, running: Arc<AtomicBool>) -> Self {
		shutdown.register(Arc::clone(&running));
		Self { shutdown, running }
	}
}

impl Drop for Registration {
	fn drop(&mut self) {
		let requested = !self.running.load(Ordering::Acquire);
		self.shutdown.unregister(requested);
	}
}

#[derive(Default)]
struct Workers {
	running: HashMap<ThreadId, Arc<AtomicBool>>,
	shutting_down: bool,
}

/// Sequential source that tells whichever worker dispatches it to exit.
struct ShutdownRequests {
	event_fd: EventFd,
	workers: Mutex<Workers>,
	/// Workers that exited on a shutdown request, waiting to be joined.
	stopped: Mutex<Vec<ThreadId>>,
	thread_stopped: Condvar,
	/// Workers that exited without one.
	crashed: Mutex<Vec<ThreadId>>,
}

impl ShutdownRequests {
	fn new() -> Result<Self, DispatchError> {
		let event_fd = EventFd::from_value_and_flags(
			0,
			EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE,
		)
		.map_err(DispatchError::EventFd)?;
		Ok(Self {
			event_fd,
			workers: Mutex::new(Workers::default()),
			stopped: Mutex::new(Vec::new()),
			thread_stopped: Condvar::new(),
			crashed: Mutex::new(Vec::new()),
		})
	}

	fn request(&self, count: u64) {
		if count == 0 {
			return;
		}
		if let Err(errno) = self.event_fd.write(count) {
			tracing::error!(%errno, "failed to request dispatch thread shutdown");
		}
	}

	/// Asks any one worker to exit and returns its id once it has.
	fn terminate_one(&self, timeout: Duration) -> Result<ThreadId, DispatchError> {
		self.event_fd.write(1).map_err(DispatchError::EventFd)?;
		let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
		let (mut stopped, wait) = self
			.thread_stopped
			.wait_timeout_while(stopped, timeout, |stopped| stopped.is_empty())
			.unwrap_or_else(PoisonError::into_inner);
		if wait.timed_out() {
			return Err(DispatchError::ThreadShutdownTimeout);
		}
		stopped.pop().ok_or(DispatchError::ThreadShutdownTimeout)
	}

	fn terminate_all(&self) {
		let count = {
			let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
			workers.shutting_down = true;
			workers.running.len() as u64
		};
		self.request(count);
	}

	fn register(&self, running: Arc<AtomicBool>) {
		let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
		workers.running.insert(thread::current().id(), running);
		if workers.shutting_down {
			self.request(1);
		}
	}

	fn unregister(&self, requested: bool) {
		let current = thread::current().id();
		{
			let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
			if workers.running.remove(&current).is_none() {
				tracing::warn!(?current, "unregistering a dispatch thread that never registered");
			}
		}
		if requested {
			self
				.stopped
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.push(current);
			self.thread_stopped.notify_one();
		} else {
			self
				.crashed
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.push(current);
		}
	}

	fn take_crashed(&self) -> Vec<ThreadId> {
		std::mem::take(&mut *self.crashed.lock().unwrap_or_else(PoisonError::into_inner))
	}
}

impl Dispatchable for ShutdownRequests {
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
		match self.event_fd.read() {
			Ok(_) => {}
			Err(Errno::EAGAIN) => return true,
			Err(errno) => {
				tracing::error!(%errno, "failed to take shutdown request");
				return true;
			}
		}
		let current = thread::current().id();
		let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
		match workers.running.get(&current) {
			Some(running) => running.store(false, Ordering::Release),
			None => tracing::warn!(?current, "shutdown request taken by a foreign thread"),
		}
		true
	}
}
