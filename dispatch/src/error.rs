use std::os::fd::RawFd;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
	#[error("fd {0} is already watched")]
	AlreadyWatched(RawFd),
	#[error("fd {0} is not watched")]
	NotWatched(RawFd),
	#[error("epoll error: {0}")]
	Epoll(Errno),
	#[error("eventfd error: {0}")]
	EventFd(Errno),
	#[error("failed to spawn dispatch thread: {0}")]
	Spawn(#[from] std::io::Error),
	#[error("dispatch thread failed to acknowledge shutdown")]
	ThreadShutdownTimeout,
	#[error("no dispatch threads left to remove")]
	NoThreads,
}

/// Failure that escaped a dispatch loop on a pool thread.
///
/// Delivered to the pool's fatal handler; the thread that produced it exits.
#[derive(Error, Debug)]
pub enum FatalDispatchError {
	#[error("dispatch panicked on thread {thread}: {message}")]
	Panic { thread: String, message: String },
	#[error("failed to wait for events on thread {thread}: {errno}")]
	Poll { thread: String, errno: Errno },
}
