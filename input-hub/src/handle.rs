use std::{
	fmt,
	sync::{Arc, Mutex, PoisonError, Weak, mpsc},
	time::Duration,
};

use shift_dispatch::ActionQueue;

use crate::{
	DeviceCapabilities, DeviceError, DeviceId, DeviceInfo, InputDevice,
	config::{
		ConfigBlock, DeviceConfig, KeyboardConfig, PointerConfig, TouchpadConfig, TouchscreenConfig,
	},
	hub::HubShared,
};

pub(crate) struct DeviceShared {
	pub(crate) id: DeviceId,
	pub(crate) info: DeviceInfo,
	pub(crate) config: Mutex<DeviceConfig>,
	/// Present while the device is registered with the hub.
	pub(crate) queue: Mutex<Option<Arc<ActionQueue>>>,
	pub(crate) backend: Arc<dyn InputDevice>,
	pub(crate) hub: Weak<HubShared>,
}

/// A device as seen by hub clients.
///
/// Handles stay valid after the device is removed; they then report its last
/// known configuration and refuse further changes with
/// [`DeviceError::Detached`].
#[derive(Clone)]
pub struct DeviceHandle {
	pub(crate) shared: Arc<DeviceShared>,
}

impl DeviceHandle {
	pub fn id(&self) -> DeviceId {
		self.shared.id
	}

	pub fn name(&self) -> &str {
		&self.shared.info.name
	}

	pub fn unique_id(&self) -> &str {
		&self.shared.info.unique_id
	}

	pub fn capabilities(&self) -> DeviceCapabilities {
		self.shared.info.capabilities
	}

	pub fn info(&self) -> &DeviceInfo {
		&self.shared.info
	}

	/// Whether the device is still registered with its hub.
	pub fn is_attached(&self) -> bool {
		self.shared
			.queue
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.is_some()
	}

	/// Snapshot of every committed configuration block.
	pub fn configuration(&self) -> DeviceConfig {
		self.config().clone()
	}

	pub fn pointer_configuration(&self) -> Option<PointerConfig> {
		self.config().pointer.clone()
	}

	pub fn touchpad_configuration(&self) -> Option<TouchpadConfig> {
		self.config().touchpad.clone()
	}

	pub fn keyboard_configuration(&self) -> Option<KeyboardConfig> {
		self.config().keyboard.clone()
	}

	pub fn touchscreen_configuration(&self) -> Option<TouchscreenConfig> {
		self.config().touchscreen.clone()
	}

	pub fn apply_pointer_configuration(&self, config: PointerConfig) -> Result<PendingChange, DeviceError> {
		self.apply(config)
	}

	pub fn apply_touchpad_configuration(
		&self,
		config: TouchpadConfig,
	) -> Result<PendingChange, DeviceError> {
		self.apply(config)
	}

	pub fn apply_keyboard_configuration(
		&self,
		config: KeyboardConfig,
	) -> Result<PendingChange, DeviceError> {
		self.apply(config)
	}

	pub fn apply_touchscreen_configuration(
		&self,
		config: TouchscreenConfig,
	) -> Result<PendingChange, DeviceError> {
		self.apply(config)
	}

	fn config(&self) -> std::sync::MutexGuard<'_, DeviceConfig> {
		self.shared.config.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn apply<C: ConfigBlock>(&self, block: C) -> Result<PendingChange, DeviceError> {
		if !self.capabilities().contains(C::CAPABILITY) {
			return Err(DeviceError::Unsupported(C::CAPABILITY));
		}
		block.validate()?;
		let queue = self
			.shared
			.queue
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
			.ok_or(DeviceError::Detached)?;

		let (reply, outcome) = mpsc::channel();
		let ticket = ChangeTicket::new(self.clone(), reply);
		let device = self.clone();
		queue.enqueue(move || match block.apply_to(device.shared.backend.as_ref()) {
			Ok(()) => {
				block.store(&mut device.config());
				ticket.settle(Ok(()));
			}
			Err(error) => {
				tracing::warn!(device = %device.id(), %error, "backend rejected configuration");
				ticket.settle(Err(error));
			}
		});
		Ok(PendingChange { outcome })
	}
}

impl PartialEq for DeviceHandle {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.shared, &other.shared)
	}
}

impl Eq for DeviceHandle {}

impl fmt::Debug for DeviceHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeviceHandle")
			.field("id", &self.shared.id)
			.field("name", &self.shared.info.name)
			.field("capabilities", &self.shared.info.capabilities)
			.finish()
	}
}

/// Join point for a configuration change queued on a device.
///
/// Waiting blocks until the device queue runs the change, so something must
/// be dispatching the hub's reactor.
#[must_use = "dropping a PendingChange discards the backend's verdict"]
pub struct PendingChange {
	outcome: mpsc::Receiver<Result<(), DeviceError>>,
}

impl PendingChange {
	pub fn wait(self) -> Result<(), DeviceError> {
		self.outcome.recv().unwrap_or(Err(DeviceError::Dropped))
	}

	/// `None` if the change has not run within `timeout`.
	pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), DeviceError>> {
		match self.outcome.recv_timeout(timeout) {
			Ok(outcome) => Some(outcome),
			Err(mpsc::RecvTimeoutError::Timeout) => None,
			Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(DeviceError::Dropped)),
		}
	}

	/// Outcome if the change has already run or been dropped.
	pub fn try_outcome(&self) -> Option<Result<(), DeviceError>> {
		match self.outcome.try_recv() {
			Ok(outcome) => Some(outcome),
			Err(mpsc::TryRecvError::Empty) => None,
			Err(mpsc::TryRecvError::Disconnected) => Some(Err(DeviceError::Dropped)),
		}
	}
}

/// Tracks one queued change from enqueue until it runs or is discarded.
///
/// Counts against the hub's open transaction, if any, so the batch is only
/// delivered once every change queued during it has settled.
pub(crate) struct ChangeTicket {
	device: DeviceHandle,
	in_transaction: bool,
	reply: Option<mpsc::Sender<Result<(), DeviceError>>>,
}

impl ChangeTicket {
	fn new(device: DeviceHandle, reply: mpsc::Sender<Result<(), DeviceError>>) -> Self {
		let in_transaction = device
			.shared
			.hub
			.upgrade()
			.is_some_and(|hub| hub.begin_change());
		Self {
			device,
			in_transaction,
			reply: Some(reply),
		}
	}

	fn settle(mut self, outcome: Result<(), DeviceError>) {
		let changed = outcome.is_ok();
		self.finish(outcome, changed);
	}

	fn finish(&mut self, outcome: Result<(), DeviceError>, changed: bool) {
		let Some(reply) = self.reply.take() else {
			return;
		};
		if let Some(hub) = self.device.shared.hub.upgrade() {
			hub.finish_change(self.in_transaction, changed.then(|| self.device.clone()));
		}
		// The waiter may already be gone.
		let _ = reply.send(outcome);
	}
}

impl Drop for ChangeTicket {
	fn drop(&mut self) {
		if self.reply.is_some() {
			tracing::debug!(device = %self.device.id(), "queued configuration change dropped");
		}
		self.finish(Err(DeviceError::Dropped), false);
	}
}
