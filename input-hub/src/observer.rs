use crate::DeviceHandle;

/// Receives device lifecycle notifications from a [`crate::DeviceHub`].
///
/// Callbacks always run on the hub's notification queue, one batch at a time:
/// every `device_added`, then `device_changed`, then `device_removed`, then a
/// single `changes_complete`.
pub trait InputDeviceObserver: Send + Sync {
	fn device_added(&self, device: &DeviceHandle);
	fn device_changed(&self, device: &DeviceHandle);
	fn device_removed(&self, device: &DeviceHandle);
	fn changes_complete(&self);
}

/// Told when the hub gains its first live device and loses its last one.
///
/// Called with the hub's registry locked; must not call back into the hub.
pub trait ServerStatusListener: Send + Sync {
	fn ready_for_user_input(&self);
	fn stop_receiving_input(&self);
}
