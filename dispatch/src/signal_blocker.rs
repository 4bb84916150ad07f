use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};

/// Blocks every signal on the current thread until dropped.
///
/// Threads inherit the mask of their creator, so spawning while one of these
/// is alive yields a thread that never receives process signals.
pub struct SignalBlocker {
	previous: Option<SigSet>,
}

impl SignalBlocker {
	pub fn new() -> Self {
		let mut previous = SigSet::empty();
		match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut previous)) {
			Ok(()) => Self {
				previous: Some(previous),
			},
			Err(errno) => {
				tracing::warn!(%errno, "failed to block signals");
				Self { previous: None }
			}
		}
	}
}

impl Default for SignalBlocker {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for SignalBlocker {
	fn drop(&mut self) {
		if let Some(previous) = self.previous.take() {
			if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None) {
				tracing::warn!(%errno, "failed to restore signal mask");
			}
		}
	}
}
